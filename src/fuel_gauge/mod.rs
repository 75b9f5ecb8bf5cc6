//! Driver for the TI BQ27220 single-cell fuel gauge.
//!
//! Besides the directly addressable standard registers, the gauge exposes a
//! command engine behind `Control()` and the ManufacturerAccess (MAC) window.
//! Every exchange with it is a fixed sequence of register writes, reads and
//! mandatory waits; [`Bq27220`] encodes those sequences on top of an async
//! register bus.
//!
//! The driver does no locking of its own. `&mut self` on every operation
//! keeps one transaction in flight per gauge; share a gauge between tasks by
//! wrapping it in a mutex.

pub mod mac;
pub mod ops;
pub mod registers;
pub mod snapshot;
pub mod sub_command;
pub mod timing;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use crate::config::FuelGaugeConfig;
use crate::error::Error;

pub use mac::MacBlock;
pub use ops::TemperatureSource;
pub use registers::{Flags, GaugingStatus, OperationConfigA, OperationStatus};
pub use snapshot::RegisterSnapshot;
pub use sub_command::SubCommandResponse;

use registers::{commands, MAC_BLOCK_SIZE};

/// Everything the driver last read from or computed for the gauge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceState {
    pub registers: RegisterSnapshot,
    /// Contents of the MAC data window after the last block transfer.
    pub mac_data: [u8; MAC_BLOCK_SIZE],
    /// Sub-command or data memory address addressed last.
    pub last_sub_command: u16,
    /// Checksum computed over the last MAC block read.
    pub checksum: u8,
    /// `MACDataSum()` as last reported by the gauge.
    pub mac_data_sum: u8,
    /// `MACDataLen()` as last reported by the gauge.
    pub mac_data_len: u8,
}

pub struct Bq27220<I2C, D> {
    i2c: I2C,
    delay: D,
    config: FuelGaugeConfig,
    state: DeviceState,
}

impl<I2C, D> Bq27220<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D, config: FuelGaugeConfig) -> Self {
        Self {
            i2c,
            delay,
            config,
            state: DeviceState::default(),
        }
    }

    pub fn config(&self) -> &FuelGaugeConfig {
        &self.config
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Give back the bus and the delay provider.
    pub fn release(self) -> (I2C, D) {
        (self.i2c, self.delay)
    }

    /// Write `bytes` in one bus transaction. The first byte is the register
    /// address.
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!("[BQ27220] W {:?}", hex!(bytes));
        self.i2c
            .write(self.config.address, bytes)
            .await
            .map_err(Error::bus)
    }

    /// Fill `buf` with consecutive registers starting at `reg`.
    pub async fn read_register_block(&mut self, reg: u8, buf: &mut [u8]) -> Result<(), Error> {
        self.i2c
            .write_read(self.config.address, &[reg], buf)
            .await
            .map_err(Error::bus)?;
        trace!("[BQ27220] R {:#x} {:?}", reg, hex!(buf));
        Ok(())
    }

    /// Read a little-endian standard register.
    pub async fn read_register_u16(&mut self, reg: u8) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_register_block(reg, &mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) async fn read_register_u8(&mut self, reg: u8) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_register_block(reg, &mut buf).await?;
        Ok(buf[0])
    }

    /// Write a 16-bit opcode or data memory address to `Control()`.
    pub(crate) async fn write_control(&mut self, cmd: u16) -> Result<(), Error> {
        let [lo, hi] = cmd.to_le_bytes();
        self.write_bytes(&[commands::CONTROL, lo, hi]).await
    }

    /// Read the checksum and length registers of the MAC window, as
    /// `(MACDataSum, MACDataLen)`.
    pub async fn read_checksum_and_length(&mut self) -> Result<(u8, u8), Error> {
        let sum = self.read_register_u8(commands::MAC_DATA_SUM).await?;
        self.wait(timing::settle_time()).await;
        let len = self.read_register_u8(commands::MAC_DATA_LEN).await?;
        self.wait(timing::settle_time()).await;

        self.state.mac_data_sum = sum;
        self.state.mac_data_len = len;
        Ok((sum, len))
    }

    /// Read all four standard register blocks into a snapshot.
    ///
    /// Any bus failure aborts the whole read; fields of a partially read
    /// snapshot are never exposed.
    pub async fn read_standard_registers(&mut self) -> Result<RegisterSnapshot, Error> {
        let mut blocks: snapshot::Blocks = Default::default();
        for (base, block) in snapshot::BLOCK_BASES.iter().zip(blocks.iter_mut()) {
            self.read_register_block(*base, block).await?;
            self.wait(timing::settle_time()).await;
        }

        let snapshot = RegisterSnapshot::from_blocks(&blocks);
        debug!(
            "[BQ27220] {} mV, {} mA, SoC {}%",
            snapshot.voltage,
            snapshot.current,
            snapshot.state_of_charge
        );
        self.state.registers = snapshot.clone();
        Ok(snapshot)
    }

    pub(crate) async fn wait(&mut self, duration: Duration) {
        self.delay.delay_ms(duration.as_millis() as u32).await;
    }
}
