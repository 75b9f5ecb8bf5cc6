//! Register map of the BQ27220 single-cell gauge.

use core::ops::Range;

use bitflags::bitflags;

/// 7-bit bus address.
pub const DEFAULT_ADDRESS: u8 = 0x55;

/// Standard commands, i.e. the directly addressable 16-bit registers.
pub mod commands {
    #![allow(dead_code)]
    pub const CONTROL: u8 = 0x00;
    pub const AT_RATE: u8 = 0x02;
    pub const AT_RATE_TIME_TO_EMPTY: u8 = 0x04;
    pub const TEMPERATURE: u8 = 0x06;
    pub const VOLTAGE: u8 = 0x08;
    pub const FLAGS: u8 = 0x0A;
    pub const CURRENT: u8 = 0x0C;
    pub const REMAINING_CAPACITY: u8 = 0x10;
    pub const FULL_CHARGE_CAPACITY: u8 = 0x12;
    pub const AVERAGE_CURRENT: u8 = 0x14;
    pub const TIME_TO_EMPTY: u8 = 0x16;
    pub const TIME_TO_FULL: u8 = 0x18;
    pub const STANDBY_CURRENT: u8 = 0x1A;
    pub const STANDBY_TIME_TO_EMPTY: u8 = 0x1C;
    pub const MAX_LOAD_CURRENT: u8 = 0x1E;
    pub const MAX_LOAD_TIME_TO_EMPTY: u8 = 0x20;
    pub const RAW_COULOMB_COUNT: u8 = 0x22;
    pub const AVERAGE_POWER: u8 = 0x24;
    pub const INTERNAL_TEMPERATURE: u8 = 0x28;
    pub const CYCLE_COUNT: u8 = 0x2A;
    pub const STATE_OF_CHARGE: u8 = 0x2C;
    pub const STATE_OF_HEALTH: u8 = 0x2E;
    pub const CHARGE_VOLTAGE: u8 = 0x30;
    pub const CHARGE_CURRENT: u8 = 0x32;
    pub const BTP_DISCHARGE_SET: u8 = 0x34;
    pub const BTP_CHARGE_SET: u8 = 0x36;
    pub const OPERATION_STATUS: u8 = 0x3A;
    pub const DESIGN_CAPACITY: u8 = 0x3C;

    // Extended, i.e. MAC command and data window
    pub const MAC_SUB_COMMAND: u8 = 0x3E;
    pub const MAC_DATA: u8 = 0x40;
    pub const MAC_DATA_SUM: u8 = 0x60;
    pub const MAC_DATA_LEN: u8 = 0x61;

    pub const ANALOG_COUNT: u8 = 0x79;
    pub const RAW_CURRENT: u8 = 0x7A;
    pub const RAW_VOLTAGE: u8 = 0x7C;
    pub const RAW_TEMPERATURE: u8 = 0x7E;
}

/// Sub-commands written to `Control()`.
pub mod sub_commands {
    #![allow(dead_code)]
    pub const CONTROL_STATUS: u16 = 0x0000;
    pub const DEVICE_NUMBER: u16 = 0x0001;
    pub const FW_VERSION: u16 = 0x0002;
    pub const HW_VERSION: u16 = 0x0003;
    pub const BOARD_OFFSET: u16 = 0x0009;
    pub const CC_OFFSET: u16 = 0x000A;
    pub const CC_OFFSET_SAVE: u16 = 0x000B;
    pub const OCV_CMD: u16 = 0x000C;
    pub const BAT_INSERT: u16 = 0x000D;
    pub const BAT_REMOVE: u16 = 0x000E;
    pub const SET_SNOOZE: u16 = 0x0013;
    pub const CLEAR_SNOOZE: u16 = 0x0014;
    pub const SET_PROFILE_1: u16 = 0x0015;
    pub const SET_PROFILE_2: u16 = 0x0016;
    pub const SET_PROFILE_3: u16 = 0x0017;
    pub const SET_PROFILE_4: u16 = 0x0018;
    pub const SET_PROFILE_5: u16 = 0x0019;
    pub const SET_PROFILE_6: u16 = 0x001A;
    pub const CAL_TOGGLE: u16 = 0x002D;
    pub const SEALED: u16 = 0x0030;
    pub const RESET: u16 = 0x0041;
    pub const OPERATION_STATUS: u16 = 0x0054;
    pub const GAUGING_STATUS: u16 = 0x0056;
    pub const EXIT_CAL: u16 = 0x0080;
    pub const ENTER_CAL: u16 = 0x0081;
    pub const ENTER_CFG_UPDATE: u16 = 0x0090;
    pub const EXIT_CFG_UPDATE_REINIT: u16 = 0x0091;
    pub const EXIT_CFG_UPDATE: u16 = 0x0092;
    pub const RETURN_TO_ROM: u16 = 0x0F00;

    pub const UNSEAL_KEY_1: u16 = 0x0414;
    pub const UNSEAL_KEY_2: u16 = 0x3672;
    pub const FULL_ACCESS_KEY: u16 = 0xFFFF;
}

/// Data memory addresses, in the order of the data flash layout.
pub mod data_memory {
    #![allow(dead_code)]
    pub const CC_GAIN: u16 = 0x9184;
    pub const CC_DELTA: u16 = 0x9188;
    pub const CC_OFFSET: u16 = 0x918C;
    pub const PACK_CONFIG: u16 = 0x918E;
    pub const BOARD_OFFSET: u16 = 0x9190;
    pub const INTERNAL_TEMP_OFFSET: u16 = 0x9191;
    pub const EXTERNAL_TEMP_OFFSET: u16 = 0x9192;
    pub const CHARGE_INHIBIT_TEMP_LOW: u16 = 0x91F5;
    pub const CHARGE_INHIBIT_TEMP_HIGH: u16 = 0x91F7;
    pub const CHARGE_INHIBIT_HYSTERESIS: u16 = 0x91F9;
    pub const CHARGING_CURRENT: u16 = 0x91FB;
    pub const CHARGING_VOLTAGE: u16 = 0x91FD;
    pub const TAPER_CURRENT: u16 = 0x9201;
    pub const OPERATION_CONFIG_A: u16 = 0x9206;
    /// Where `Operation Config A` is written through the MAC window. Sits
    /// 0x20 below the read address, inside the extra checksum correction
    /// range. Found empirically.
    pub const OPERATION_CONFIG_A_WRITE: u16 = OPERATION_CONFIG_A - 0x20;
    pub const OPERATION_CONFIG_B: u16 = 0x9208;
    pub const SOC_DELTA: u16 = 0x920B;
    pub const CLOCK_CONTROL: u16 = 0x920C;
    pub const IO_CONFIG: u16 = 0x920D;
    pub const INIT_DISCHARGE_SET: u16 = 0x920E;
    pub const INIT_CHARGE_SET: u16 = 0x9210;
    pub const DEVICE_TYPE: u16 = 0x9212;
    pub const SLEEP_CURRENT: u16 = 0x9217;
    pub const DESIGN_CAPACITY: u16 = 0x929F;
}

/// Value `Control()` reads back once a sub-command has been processed.
pub const SUB_COMMAND_SENTINEL: u16 = 0xA5FF;

/// Size of the MAC data window.
pub const MAC_BLOCK_SIZE: usize = 32;

/// Value written to `MACDataLen()` after a full block: two address bytes,
/// the block, the checksum and the length byte itself.
pub const MAC_BLOCK_LENGTH: u8 = MAC_BLOCK_SIZE as u8 + 4;

/// Subtracted from the computed checksum before it is written to
/// `MACDataSum()`. Found empirically; the gauge rejects the block otherwise.
pub const CHECKSUM_CORRECTION: u8 = 0x20;

/// Data memory addresses that need one more subtracted from the written
/// checksum. Found empirically, like [`CHECKSUM_CORRECTION`].
pub const CHECKSUM_EXTRA_CORRECTION: Range<u16> = 0x91E0..data_memory::TAPER_CURRENT;

bitflags! {
    /// Contents of `Flags()` (battery status).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const FULLY_DISCHARGED = 0x8000;
        const OCV_COMPLETE = 0x4000;
        const OCV_FAIL = 0x2000;
        const SLEEP = 0x1000;
        const OVER_TEMP_CHARGE = 0x0800;
        const OVER_TEMP_DISCHARGE = 0x0400;
        const FULL_CHARGE = 0x0200;
        const CHARGE_INHIBIT = 0x0100;
        const TERMINATE_CHARGE_ALARM = 0x0040;
        const OCV_GOOD = 0x0020;
        const AUTH_GOOD = 0x0010;
        const BATTERY_PRESENT = 0x0008;
        const TERMINATE_DISCHARGE_ALARM = 0x0004;
        const SYSTEM_DOWN = 0x0002;
        const DISCHARGING = 0x0001;
    }
}

bitflags! {
    /// Contents of `OperationStatus()`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperationStatus: u16 {
        const CONFIG_UPDATE = 0x0400;
        const BTP_INTERRUPT = 0x0080;
        const SMOOTHING = 0x0040;
        const INIT_COMPLETE = 0x0020;
        const VALID_DISCHARGE_QUALIFIED = 0x0010;
        const END_OF_DISCHARGE_2 = 0x0008;
        const SECURITY_1 = 0x0004;
        const SECURITY_0 = 0x0002;
        const CALIBRATION_MODE = 0x0001;
    }
}

bitflags! {
    /// `Operation Config A` data memory word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OperationConfigA: u16 {
        const EXTERNAL_THERMISTOR = 0x8000;
        const BATTERY_GOOD_POLARITY = 0x2000;
        const BATTERY_GOOD_ENABLE = 0x1000;
        const SLEEP = 0x0400;
        const SLEEP_WAKE_CHARGE = 0x0200;
        const WRITE_TEMPERATURE = 0x0100;
        const BATTERY_INSERTION_ENABLE = 0x0080;
        const BATTERY_INSERTION_PULLUP = 0x0020;
        const PFC_CONFIG_1 = 0x0010;
        const PFC_CONFIG_0 = 0x0008;
        const WAKE_ENABLE = 0x0004;
        const WAKE_THRESHOLD_1 = 0x0002;
        const WAKE_THRESHOLD_0 = 0x0001;
    }
}

bitflags! {
    /// Response of the `GAUGING_STATUS` sub-command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GaugingStatus: u16 {
        const VALID_DISCHARGE_QUALIFIED = 0x8000;
        const END_OF_DISCHARGE_2 = 0x4000;
        const END_OF_DISCHARGE_1 = 0x2000;
        const FCC_EXCEEDED = 0x0400;
        const CONDITION_FLAG = 0x0080;
        const DISCHARGING = 0x0040;
        const END_OF_DISCHARGE = 0x0020;
        const TERMINATE_CHARGE = 0x0008;
        const TERMINATE_DISCHARGE = 0x0004;
        const FULLY_CHARGED = 0x0002;
        const FULLY_DISCHARGED = 0x0001;
    }
}

bitflags! {
    /// Response of the `CONTROL_STATUS` sub-command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlStatus: u16 {
        const COULOMB_COUNTER_CALIBRATION = 0x0020;
        const BOARD_CALIBRATION = 0x0010;
        const SNOOZE = 0x0008;
        const BATTERY_ID = 0x0007;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Flags {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Flags({=u16:#x})", self.bits())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for OperationStatus {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "OperationStatus({=u16:#x})", self.bits())
    }
}

/// `MACDataSum()` value for a block whose plain checksum is `checksum`.
pub fn corrected_checksum(sub_command: u16, checksum: u8) -> u8 {
    let mut cs = checksum.wrapping_sub(CHECKSUM_CORRECTION);
    if CHECKSUM_EXTRA_CORRECTION.contains(&sub_command) {
        cs = cs.wrapping_sub(1);
    }
    cs
}

/// `0xFF` minus the wrapping byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    0xFF - bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
