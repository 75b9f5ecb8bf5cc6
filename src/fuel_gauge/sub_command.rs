use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use super::registers::{commands, SUB_COMMAND_SENTINEL};
use super::timing::{self, POLL_ATTEMPTS};
use super::Bq27220;
use crate::error::Error;

/// What `Control()` held at the end of a sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubCommandResponse {
    /// The gauge finished; the response waits in the MAC window.
    Sentinel,
    /// Anything else, including the last value read when polling ran out.
    DirectValue(u16),
}

impl SubCommandResponse {
    fn from_raw(raw: u16) -> Self {
        if raw == SUB_COMMAND_SENTINEL {
            Self::Sentinel
        } else {
            Self::DirectValue(raw)
        }
    }
}

impl<I2C, D> Bq27220<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    /// Issue `cmd` and poll `Control()` until it reads back the sentinel.
    ///
    /// Running out of polls is not an error: the last value read is handed
    /// back as [`SubCommandResponse::DirectValue`] and the caller decides
    /// what it means.
    pub async fn send_sub_command(&mut self, cmd: u16) -> Result<SubCommandResponse, Error> {
        self.write_control(cmd).await?;
        self.state.last_sub_command = cmd;
        self.wait(timing::sub_command_time()).await;

        let mut response = SubCommandResponse::DirectValue(0);
        for _ in 0..POLL_ATTEMPTS {
            self.wait(timing::poll_interval()).await;
            let mut buf = [0u8; 4];
            self.read_register_block(commands::CONTROL, &mut buf).await?;
            response = SubCommandResponse::from_raw(u16::from_be_bytes([buf[0], buf[1]]));
            if response == SubCommandResponse::Sentinel {
                break;
            }
        }
        self.wait(timing::poll_interval()).await;

        if let SubCommandResponse::DirectValue(last) = response {
            error!(
                "[BQ27220] Sub-command {:#x} did not complete, last read {:#x}",
                cmd, last
            );
        }
        Ok(response)
    }

    /// Run `cmd` and fetch its 32-bit response, either straight from
    /// `Control()` or from the start of the MAC window.
    pub(crate) async fn sub_command_u32(&mut self, cmd: u16) -> Result<u32, Error> {
        match self.send_sub_command(cmd).await? {
            SubCommandResponse::DirectValue(v) => Ok(v as u32),
            SubCommandResponse::Sentinel => {
                let mut buf = [0u8; 4];
                self.read_register_block(commands::MAC_SUB_COMMAND, &mut buf)
                    .await?;
                self.wait(timing::mac_block_time()).await;
                Ok(u32::from_be_bytes(buf))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::config::FuelGaugeConfig;
    use crate::fuel_gauge::registers::sub_commands;
    use crate::test_helpers::{init_logger, MockDelay, MockGauge};

    #[test]
    fn stops_polling_at_sentinel() {
        init_logger();
        let mock = MockGauge::new();
        mock.complete_after(3);
        let delay = MockDelay::new();
        let mut gauge = Bq27220::new(mock.clone(), delay.clone(), FuelGaugeConfig::default());

        let response = block_on(gauge.send_sub_command(sub_commands::CONTROL_STATUS)).unwrap();

        assert_eq!(response, SubCommandResponse::Sentinel);
        assert_eq!(mock.control_polls(), 3);
        assert_eq!(mock.writes(), vec![vec![0x00, 0x00, 0x00]]);
        // Processing wait, one interval before each poll, one after
        assert_eq!(delay.delays(), vec![50, 1, 1, 1, 1]);
    }

    #[test]
    fn exhausted_poll_returns_last_value() {
        init_logger();
        let mock = MockGauge::new();
        mock.set_control_value(0x0C0A);
        let delay = MockDelay::new();
        let mut gauge = Bq27220::new(mock.clone(), delay.clone(), FuelGaugeConfig::default());

        let response = block_on(gauge.send_sub_command(sub_commands::GAUGING_STATUS)).unwrap();

        assert_eq!(response, SubCommandResponse::DirectValue(0x0C0A));
        assert_eq!(mock.control_polls(), POLL_ATTEMPTS);
        assert_eq!(mock.writes(), vec![vec![0x00, 0x56, 0x00]]);
        assert_eq!(delay.total_ms(), 50 + POLL_ATTEMPTS as u32 + 1);
        assert_eq!(gauge.state().last_sub_command, sub_commands::GAUGING_STATUS);
    }

    #[test]
    fn sentinel_response_read_from_window() {
        let mock = MockGauge::new();
        mock.complete_after(1);
        mock.set_sub_command_response(&[0x20, 0x02]);
        let mut gauge = Bq27220::new(mock.clone(), MockDelay::new(), FuelGaugeConfig::default());

        let value = block_on(gauge.sub_command_u32(sub_commands::DEVICE_NUMBER)).unwrap();

        // Window starts with the echoed sub-command
        assert_eq!(value, 0x0100_2002);
    }
}
