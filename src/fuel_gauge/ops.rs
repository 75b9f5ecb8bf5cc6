//! Security, mode and configuration operations built on the command engine.

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use super::registers::{commands, data_memory, sub_commands, OperationConfigA, OperationStatus};
use super::{timing, Bq27220};
use crate::error::Error;

/// Which sensor the gauge takes the cell temperature from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TemperatureSource {
    /// Die temperature, with the BIN pin used for battery insertion.
    Internal,
    /// External NTC thermistor on the BIN pin.
    Ntc,
}

impl<I2C, D> Bq27220<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    /// Write `cmd` to `Control()` without polling for completion, then wait
    /// `settle` on top of the ordinary settle time.
    pub async fn control(&mut self, cmd: u16, settle: Duration) -> Result<(), Error> {
        self.write_control(cmd).await?;
        self.state.last_sub_command = cmd;
        self.wait(timing::settle_time()).await;
        self.wait(settle).await;
        Ok(())
    }

    pub async fn seal(&mut self) -> Result<(), Error> {
        info!("[BQ27220] Sealing");
        self.control(sub_commands::SEALED, timing::mode_change_time())
            .await
    }

    pub async fn unseal(&mut self) -> Result<(), Error> {
        info!("[BQ27220] Unsealing");
        self.control(sub_commands::UNSEAL_KEY_1, timing::key_time())
            .await?;
        self.control(sub_commands::UNSEAL_KEY_2, timing::mode_change_time())
            .await
    }

    /// Step from unsealed to full access. The gauge must be unsealed first.
    pub async fn full_access(&mut self) -> Result<(), Error> {
        for _ in 0..2 {
            self.control(sub_commands::FULL_ACCESS_KEY, timing::key_time())
                .await?;
        }
        Ok(())
    }

    /// Enter configuration update mode, required before data memory writes.
    pub async fn enter_config_update(&mut self) -> Result<(), Error> {
        info!("[BQ27220] Entering config update");
        self.control(sub_commands::ENTER_CFG_UPDATE, timing::mode_change_time())
            .await
    }

    pub async fn exit_config_update(&mut self) -> Result<(), Error> {
        info!("[BQ27220] Leaving config update");
        self.control(sub_commands::EXIT_CFG_UPDATE, timing::mode_change_time())
            .await
    }

    /// Leave configuration update mode and re-initialize gauging with the
    /// new configuration.
    pub async fn exit_config_update_reinit(&mut self) -> Result<(), Error> {
        info!("[BQ27220] Leaving config update with reinit");
        self.control(
            sub_commands::EXIT_CFG_UPDATE_REINIT,
            timing::mode_change_time(),
        )
        .await
    }

    pub async fn reset(&mut self) -> Result<(), Error> {
        warn!("[BQ27220] Resetting gauge");
        self.control(sub_commands::RESET, timing::mode_change_time())
            .await
    }

    /// Select one of the six battery profiles, numbered from 1.
    pub async fn select_profile(&mut self, profile: u8) -> Result<(), Error> {
        if !(1..=6).contains(&profile) {
            return Err(Error::InvalidArgument);
        }
        info!("[BQ27220] Selecting profile {}", profile);
        let cmd = sub_commands::SET_PROFILE_1 + (profile - 1) as u16;
        self.control(cmd, timing::mode_change_time()).await
    }

    pub async fn device_number(&mut self) -> Result<u32, Error> {
        self.sub_command_u32(sub_commands::DEVICE_NUMBER).await
    }

    pub async fn firmware_version(&mut self) -> Result<u32, Error> {
        self.sub_command_u32(sub_commands::FW_VERSION).await
    }

    pub async fn hardware_version(&mut self) -> Result<u32, Error> {
        self.sub_command_u32(sub_commands::HW_VERSION).await
    }

    pub async fn operation_status(&mut self) -> Result<OperationStatus, Error> {
        let raw = self.read_register_u16(commands::OPERATION_STATUS).await?;
        self.wait(timing::settle_time()).await;
        self.state.registers.operation_status = raw;
        Ok(OperationStatus::from_bits_retain(raw))
    }

    /// Short read of a big-endian word from data memory.
    pub async fn read_data_u16(&mut self, address: u16) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_data(address, &mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Short read of one byte from data memory.
    pub async fn read_data_u8(&mut self, address: u16) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_data(address, &mut buf).await?;
        Ok(buf[0])
    }

    async fn read_data(&mut self, address: u16, buf: &mut [u8]) -> Result<(), Error> {
        self.write_control(address).await?;
        self.state.last_sub_command = address;
        self.wait(timing::settle_time()).await;
        self.read_register_block(commands::MAC_DATA, buf).await?;
        self.wait(timing::settle_time()).await;
        Ok(())
    }

    /// Switch the temperature sensor in `Operation Config A`. Needs full
    /// access and config update mode to stick.
    ///
    /// The word is read at its data memory address but written at
    /// [`data_memory::OPERATION_CONFIG_A_WRITE`].
    pub async fn set_temperature_source(&mut self, source: TemperatureSource) -> Result<(), Error> {
        let current = self.read_data_u16(data_memory::OPERATION_CONFIG_A).await?;
        let mut config = OperationConfigA::from_bits_retain(current);
        match source {
            TemperatureSource::Internal => {
                config.remove(OperationConfigA::EXTERNAL_THERMISTOR);
                config.insert(OperationConfigA::BATTERY_INSERTION_ENABLE);
            }
            TemperatureSource::Ntc => {
                config.remove(OperationConfigA::BATTERY_INSERTION_ENABLE);
                config.insert(OperationConfigA::EXTERNAL_THERMISTOR);
            }
        }
        debug!(
            "[BQ27220] Operation Config A {:#x} -> {:#x}",
            current,
            config.bits()
        );

        self.write_extended_memory_value(
            data_memory::OPERATION_CONFIG_A_WRITE,
            config.bits() as u32,
            2,
        )
        .await?;
        Ok(())
    }
}
