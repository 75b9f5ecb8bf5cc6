#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod config;
pub mod error;
pub mod fuel_gauge;
pub mod mux;
pub mod ring_buffer;

#[cfg(test)]
mod test_helpers;

pub use config::{FuelGaugeConfig, MuxConfig};
pub use error::{Error, ProtocolError};
pub use fuel_gauge::Bq27220;
pub use mux::Mux;
