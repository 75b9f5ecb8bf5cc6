//! Mandatory waits between bus phases, taken from the gauge datasheet and
//! bring-up measurements. These are minimums, not tuning knobs.

use embassy_time::Duration;

/// Settle time after every ordinary register transaction
pub fn settle_time() -> Duration {
    Duration::from_millis(1)
}

/// Processing time after a sub-command is written, before polling starts
pub fn sub_command_time() -> Duration {
    Duration::from_millis(50)
}

/// Interval between `Control()` completion polls
pub fn poll_interval() -> Duration {
    Duration::from_millis(1)
}

/// Maximum number of `Control()` completion polls
pub const POLL_ATTEMPTS: usize = 100;

/// Time for the gauge to latch a MAC address before its block is readable.
/// Must be at least 2 ms.
pub fn mac_address_time() -> Duration {
    Duration::from_millis(3)
}

/// Time for the gauge to process a full MAC block transfer
pub fn mac_block_time() -> Duration {
    Duration::from_millis(5)
}

/// Time between the two halves of a security key
pub fn key_time() -> Duration {
    Duration::from_millis(5)
}

/// Time for a mode change (seal, unseal, config update, reset, profile
/// selection) to take effect
pub fn mode_change_time() -> Duration {
    Duration::from_millis(2000)
}
