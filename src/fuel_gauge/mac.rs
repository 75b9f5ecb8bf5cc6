//! Extended memory access through the ManufacturerAccess (MAC) window.
//!
//! A block is selected by writing its sub-command or data memory address to
//! `MACSubCmd()`. The gauge then mirrors the 32-byte block at `MACData()`
//! together with its checksum and length. Writing goes the other way round:
//! address and block in one transaction, then checksum and length, which is
//! what makes the gauge commit the block. Selection sends the address low
//! byte first, a block write high byte first.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use heapless::Vec;
use serde::{Deserialize, Serialize};

use super::registers::{
    checksum, commands, corrected_checksum, MAC_BLOCK_LENGTH, MAC_BLOCK_SIZE,
};
use super::{timing, Bq27220};
use crate::error::Error;

/// One block read back through the MAC window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacBlock {
    pub sub_command: u16,
    pub data: Vec<u8, MAC_BLOCK_SIZE>,
    /// Checksum computed over the address and the data.
    pub checksum: u8,
    /// `MACDataSum()` as reported by the gauge.
    pub reported_checksum: u8,
    /// `MACDataLen()` as reported by the gauge.
    pub reported_length: u8,
}

impl MacBlock {
    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.reported_checksum
    }
}

impl<I2C, D> Bq27220<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    /// Read the first `length` bytes of the block at `sub_command`.
    ///
    /// A checksum mismatch is logged and the data returned anyway; the gauge
    /// reports stale sums while a configuration update is in progress. Use
    /// [`MacBlock::checksum_matches`] to tell.
    pub async fn read_extended_memory_block(
        &mut self,
        sub_command: u16,
        length: usize,
    ) -> Result<MacBlock, Error> {
        if length > MAC_BLOCK_SIZE {
            return Err(Error::InvalidLength);
        }

        let [lo, hi] = sub_command.to_le_bytes();
        self.write_bytes(&[commands::MAC_SUB_COMMAND, lo, hi]).await?;
        self.state.last_sub_command = sub_command;
        self.wait(timing::mac_address_time()).await;

        // Address echo plus the whole window
        let mut raw = [0u8; MAC_BLOCK_SIZE + 2];
        self.read_register_block(commands::MAC_SUB_COMMAND, &mut raw)
            .await?;
        let computed = checksum(&raw[..length + 2]);
        self.state.checksum = computed;
        self.wait(timing::settle_time()).await;
        self.wait(timing::mac_block_time()).await;

        let (reported_checksum, reported_length) = self.read_checksum_and_length().await?;

        let mut data = [0u8; MAC_BLOCK_SIZE];
        self.read_register_block(commands::MAC_DATA, &mut data[..length])
            .await?;
        self.wait(timing::mac_block_time()).await;
        self.state.mac_data[..length].copy_from_slice(&data[..length]);

        if computed != reported_checksum {
            warn!(
                "[BQ27220] MAC {:#x} checksum mismatch: computed {:#x}, reported {:#x}",
                sub_command, computed, reported_checksum
            );
        }

        Ok(MacBlock {
            sub_command,
            data: Vec::from_slice(&data[..length]).map_err(|_| Error::InvalidLength)?,
            checksum: computed,
            reported_checksum,
            reported_length,
        })
    }

    /// Change a 1, 2 or 4 byte value at the start of the block at
    /// `sub_command`, leaving the rest of the block as the gauge has it.
    ///
    /// Multi-byte values are placed big-endian, as the gauge stores them.
    pub async fn write_extended_memory_value(
        &mut self,
        sub_command: u16,
        value: u32,
        quantity: usize,
    ) -> Result<MacBlock, Error> {
        if !matches!(quantity, 1 | 2 | 4) {
            error!("[BQ27220] Unsupported write quantity {}", quantity);
            return Err(Error::InvalidArgument);
        }

        let current = self
            .read_extended_memory_block(sub_command, MAC_BLOCK_SIZE)
            .await?;
        let mut block = [0u8; MAC_BLOCK_SIZE];
        block.copy_from_slice(&current.data);
        block[..quantity].copy_from_slice(&value.to_be_bytes()[4 - quantity..]);

        self.write_extended_memory_block(sub_command, &block).await
    }

    /// Replace the whole block at `sub_command` and read it back.
    ///
    /// The address goes out high byte first, unlike every other address
    /// written to the gauge.
    pub async fn write_extended_memory_block(
        &mut self,
        sub_command: u16,
        block: &[u8; MAC_BLOCK_SIZE],
    ) -> Result<MacBlock, Error> {
        let mut buf = [0u8; MAC_BLOCK_SIZE + 3];
        buf[0] = commands::MAC_SUB_COMMAND;
        buf[1..3].copy_from_slice(&sub_command.to_be_bytes());
        buf[3..].copy_from_slice(block);
        let tx_checksum = checksum(&buf[1..]);

        self.write_bytes(&buf).await?;
        self.wait(timing::settle_time()).await;

        let sum = corrected_checksum(sub_command, tx_checksum);
        debug!(
            "[BQ27220] MAC {:#x} write, checksum {:#x} -> {:#x}",
            sub_command, tx_checksum, sum
        );
        self.write_bytes(&[commands::MAC_DATA_SUM, sum]).await?;
        self.wait(timing::settle_time()).await;

        self.write_bytes(&[commands::MAC_DATA_LEN, MAC_BLOCK_LENGTH])
            .await?;
        self.wait(timing::mac_block_time()).await;

        let (reported_checksum, reported_length) = self.read_checksum_and_length().await?;
        debug!(
            "[BQ27220] MAC {:#x} committed, sum {:#x}, len {}",
            sub_command, reported_checksum, reported_length
        );

        let readback = self
            .read_extended_memory_block(sub_command, MAC_BLOCK_SIZE)
            .await?;
        if readback.data.as_slice() != block.as_slice() {
            warn!("[BQ27220] MAC {:#x} read back differs from write", sub_command);
        }
        Ok(readback)
    }
}
