use serde::{Deserialize, Serialize};

use super::registers::{commands, Flags, OperationStatus, MAC_BLOCK_SIZE};

/// Base address of each of the four standard register blocks.
pub(crate) const BLOCK_BASES: [u8; 4] = [
    commands::CONTROL,
    commands::MAX_LOAD_TIME_TO_EMPTY,
    commands::MAC_DATA,
    commands::MAC_DATA_SUM,
];

pub(crate) type Blocks = [[u8; MAC_BLOCK_SIZE]; BLOCK_BASES.len()];

/// Zero degrees Celsius in tenths of a kelvin.
const ZERO_CELSIUS_DECI_KELVIN: i32 = 2731;

/// Last-read value of every standard register.
///
/// Units follow the gauge: millivolts, milliamps, milliamp-hours, minutes,
/// percent, and tenths of a kelvin for temperatures.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterSnapshot {
    pub control: u16,
    pub at_rate: i16,
    pub at_rate_time_to_empty: u16,
    pub temperature: u16,
    pub voltage: u16,
    pub flags: u16,
    pub current: i16,
    pub remaining_capacity: u16,
    pub full_charge_capacity: u16,
    pub average_current: i16,
    pub time_to_empty: u16,
    pub time_to_full: u16,
    pub standby_current: i16,
    pub standby_time_to_empty: u16,
    pub max_load_current: i16,

    pub max_load_time_to_empty: u16,
    pub raw_coulomb_count: u16,
    pub average_power: i16,
    pub internal_temperature: u16,
    pub cycle_count: u16,
    pub state_of_charge: u16,
    pub state_of_health: u16,
    pub charge_voltage: u16,
    pub charge_current: u16,
    pub btp_discharge_set: u16,
    pub btp_charge_set: u16,
    pub operation_status: u16,
    pub design_capacity: u16,

    pub mac_data: [u8; MAC_BLOCK_SIZE],
    pub mac_data_sum: u8,
    pub mac_data_len: u8,
    pub analog_count: u8,
    pub raw_current: u16,
    pub raw_voltage: u16,
    pub raw_temperature: u16,
}

impl RegisterSnapshot {
    /// Map the four standard register blocks, in [`BLOCK_BASES`] order.
    pub(crate) fn from_blocks(blocks: &Blocks) -> Self {
        let [b1, b2, b3, b4] = blocks;
        let word = |block: &[u8; MAC_BLOCK_SIZE], base: u8, reg: u8| {
            let i = (reg - base) as usize;
            u16::from_le_bytes([block[i], block[i + 1]])
        };
        let r1 = |reg| word(b1, BLOCK_BASES[0], reg);
        let r2 = |reg| word(b2, BLOCK_BASES[1], reg);
        let r4 = |reg| word(b4, BLOCK_BASES[3], reg);

        Self {
            control: r1(commands::CONTROL),
            at_rate: r1(commands::AT_RATE) as i16,
            at_rate_time_to_empty: r1(commands::AT_RATE_TIME_TO_EMPTY),
            temperature: r1(commands::TEMPERATURE),
            voltage: r1(commands::VOLTAGE),
            flags: r1(commands::FLAGS),
            current: r1(commands::CURRENT) as i16,
            remaining_capacity: r1(commands::REMAINING_CAPACITY),
            full_charge_capacity: r1(commands::FULL_CHARGE_CAPACITY),
            average_current: r1(commands::AVERAGE_CURRENT) as i16,
            time_to_empty: r1(commands::TIME_TO_EMPTY),
            time_to_full: r1(commands::TIME_TO_FULL),
            standby_current: r1(commands::STANDBY_CURRENT) as i16,
            standby_time_to_empty: r1(commands::STANDBY_TIME_TO_EMPTY),
            max_load_current: r1(commands::MAX_LOAD_CURRENT) as i16,

            max_load_time_to_empty: r2(commands::MAX_LOAD_TIME_TO_EMPTY),
            raw_coulomb_count: r2(commands::RAW_COULOMB_COUNT),
            average_power: r2(commands::AVERAGE_POWER) as i16,
            internal_temperature: r2(commands::INTERNAL_TEMPERATURE),
            cycle_count: r2(commands::CYCLE_COUNT),
            state_of_charge: r2(commands::STATE_OF_CHARGE),
            state_of_health: r2(commands::STATE_OF_HEALTH),
            charge_voltage: r2(commands::CHARGE_VOLTAGE),
            charge_current: r2(commands::CHARGE_CURRENT),
            btp_discharge_set: r2(commands::BTP_DISCHARGE_SET),
            btp_charge_set: r2(commands::BTP_CHARGE_SET),
            operation_status: r2(commands::OPERATION_STATUS),
            design_capacity: r2(commands::DESIGN_CAPACITY),

            mac_data: *b3,
            mac_data_sum: b4[(commands::MAC_DATA_SUM - BLOCK_BASES[3]) as usize],
            mac_data_len: b4[(commands::MAC_DATA_LEN - BLOCK_BASES[3]) as usize],
            analog_count: b4[(commands::ANALOG_COUNT - BLOCK_BASES[3]) as usize],
            raw_current: r4(commands::RAW_CURRENT),
            raw_voltage: r4(commands::RAW_VOLTAGE),
            raw_temperature: r4(commands::RAW_TEMPERATURE),
        }
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_retain(self.flags)
    }

    pub fn operation_status(&self) -> OperationStatus {
        OperationStatus::from_bits_retain(self.operation_status)
    }

    /// Cell temperature in tenths of a degree Celsius.
    pub fn temperature_deci_celsius(&self) -> i16 {
        (self.temperature as i32 - ZERO_CELSIUS_DECI_KELVIN) as i16
    }

    /// Die temperature in tenths of a degree Celsius.
    pub fn internal_temperature_deci_celsius(&self) -> i16 {
        (self.internal_temperature as i32 - ZERO_CELSIUS_DECI_KELVIN) as i16
    }
}
