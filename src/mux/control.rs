//! Messages carried in UIH frames on the control channel (DLCI 0).

use bitflags::bitflags;
use heapless::Vec;

use super::frame::{CR, EA};

/// Multiplexer close down.
pub const TYPE_CLD: u8 = 0x30;
/// Modem status command.
pub const TYPE_MSC: u8 = 0x38;
/// Non supported command response.
pub const TYPE_NSC: u8 = 0x04;

/// Largest encoded control message this implementation produces.
pub const MESSAGE_LENGTH_MAX: usize = 5;

bitflags! {
    /// V.24 signal octet of a modem status command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Signals: u8 {
        const EA = 0x01;
        /// Flow control, set when the sender cannot accept frames.
        const FC = 0x02;
        /// Ready to communicate
        const RTC = 0x04;
        /// Ready to receive
        const RTR = 0x08;
        /// Incoming call
        const IC = 0x40;
        /// Data valid
        const DV = 0x80;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Signals {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Signals({=u8:#x})", self.bits())
    }
}

impl Signals {
    /// What the MCU reports on a channel, with FC set when the channel
    /// receive buffer is flow-controlled off.
    pub fn local(flow_controlled_off: bool) -> Self {
        let mut signals = Self::EA | Self::RTC | Self::RTR | Self::DV;
        signals.set(Self::FC, flow_controlled_off);
        signals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlMessage {
    ModemStatus {
        command: bool,
        dlci: u8,
        signals: Signals,
    },
    CloseDown {
        command: bool,
    },
    NotSupported {
        command: bool,
        rejected_type: u8,
    },
    /// Any other message type, answered with NSC when it is a command.
    Other {
        command: bool,
        type_octet: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The message continues in a later frame.
    Incomplete,
    Malformed,
}

const fn type_octet(kind: u8, command: bool) -> u8 {
    (kind << 2) | if command { CR } else { 0 } | EA
}

fn encode(kind: u8, command: bool, value: &[u8]) -> Vec<u8, MESSAGE_LENGTH_MAX> {
    let mut out = Vec::new();
    // Capacity covers every message built in this module.
    out.push(type_octet(kind, command)).ok();
    out.push(((value.len() as u8) << 1) | EA).ok();
    out.extend_from_slice(value).ok();
    out
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8, MESSAGE_LENGTH_MAX> {
        match *self {
            Self::ModemStatus {
                command,
                dlci,
                signals,
            } => encode(TYPE_MSC, command, &[(dlci << 2) | CR | EA, signals.bits()]),
            Self::CloseDown { command } => encode(TYPE_CLD, command, &[]),
            Self::NotSupported {
                command,
                rejected_type,
            } => encode(TYPE_NSC, command, &[rejected_type]),
            Self::Other { command, type_octet } => encode(type_octet >> 2, command, &[]),
        }
    }

    /// Decode one message from the front of `buf`, returning it with the
    /// number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(usize, Self), DecodeError> {
        let (&type_octet, rest) = buf.split_first().ok_or(DecodeError::Incomplete)?;
        if type_octet & EA == 0 {
            return Err(DecodeError::Malformed);
        }

        let mut len = 0usize;
        let mut length_octets = 0;
        loop {
            let &octet = rest.get(length_octets).ok_or(DecodeError::Incomplete)?;
            len |= ((octet >> 1) as usize) << (7 * length_octets);
            length_octets += 1;
            if octet & EA != 0 {
                break;
            }
            if length_octets == 2 {
                return Err(DecodeError::Malformed);
            }
        }

        let value_at = 1 + length_octets;
        let value = buf
            .get(value_at..value_at + len)
            .ok_or(DecodeError::Incomplete)?;
        let command = type_octet & CR != 0;

        let message = match type_octet >> 2 {
            TYPE_MSC => {
                if value.len() < 2 {
                    return Err(DecodeError::Malformed);
                }
                ControlMessage::ModemStatus {
                    command,
                    dlci: value[0] >> 2,
                    signals: Signals::from_bits_retain(value[1]),
                }
            }
            TYPE_CLD => ControlMessage::CloseDown { command },
            TYPE_NSC => ControlMessage::NotSupported {
                command,
                rejected_type: value.first().copied().unwrap_or_default(),
            },
            _ => ControlMessage::Other {
                command,
                type_octet,
            },
        };

        Ok((value_at + len, message))
    }
}
