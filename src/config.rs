use embassy_time::Duration;

/// Runtime configuration of a multiplexer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MuxConfig {
    /// Receive buffer fill ratio (percent) at or above which the peer is
    /// told to stop sending on a channel.
    pub rx_flow_off_percent: u8,
    /// Receive buffer fill ratio (percent) at or below which the peer is
    /// allowed to resume.
    pub rx_flow_on_percent: u8,
    /// Drop frames that do not fit in a channel buffer instead of stalling
    /// the receive path until the consumer catches up.
    pub discard_on_overflow: bool,
    /// Maximum wait for the peer to answer SABM or DISC.
    pub response_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            rx_flow_off_percent: 60,
            rx_flow_on_percent: 40,
            discard_on_overflow: false,
            response_timeout: Duration::from_secs(3),
        }
    }
}

impl MuxConfig {
    pub fn with_discard_on_overflow(mut self) -> Self {
        self.discard_on_overflow = true;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_flow_watermarks(mut self, off_percent: u8, on_percent: u8) -> Self {
        self.rx_flow_off_percent = off_percent;
        self.rx_flow_on_percent = on_percent;
        self
    }
}

/// Runtime configuration of the fuel gauge driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FuelGaugeConfig {
    /// 7-bit bus address.
    pub address: u8,
}

impl Default for FuelGaugeConfig {
    fn default() -> Self {
        Self {
            address: crate::fuel_gauge::registers::DEFAULT_ADDRESS,
        }
    }
}
