//! Basic-option frame encoding and the 27.010 frame check sequence.

use crate::error::Error;

/// Opening and closing flag of every basic-option frame.
pub const FLAG: u8 = 0xF9;

/// Highest DLCI a channel may use.
pub const ADDRESS_MAX: u8 = 61;

/// Largest information field this implementation sends or accepts.
pub const INFORMATION_LENGTH_MAX: usize = 128;

/// Largest information field the two-octet length encoding can express.
pub const INFORMATION_LENGTH_LIMIT: usize = 0x7FFF;

/// Flags, address, control, two length octets and FCS.
pub const FRAME_OVERHEAD_MAX: usize = 7;

pub const FRAME_LENGTH_MAX: usize = INFORMATION_LENGTH_MAX + FRAME_OVERHEAD_MAX;

pub(crate) const EA: u8 = 0x01;
pub(crate) const CR: u8 = 0x02;
pub(crate) const PF: u8 = 0x10;

/// FCS residue of a frame whose received FCS verifies.
pub const FCS_GOOD: u8 = 0xCF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    /// Set Asynchronous Balanced Mode
    Sabm,
    /// Unnumbered Acknowledgement
    Ua,
    /// Disconnected Mode
    Dm,
    /// Disconnect
    Disc,
    /// Unnumbered Information with Header check
    Uih,
    /// Unnumbered Information
    Ui,
}

impl FrameType {
    pub const fn control(self) -> u8 {
        match self {
            Self::Sabm => 0x2F,
            Self::Ua => 0x63,
            Self::Dm => 0x0F,
            Self::Disc => 0x43,
            Self::Uih => 0xEF,
            Self::Ui => 0x03,
        }
    }

    /// Decode a control octet, ignoring the P/F bit.
    pub const fn from_control(control: u8) -> Option<Self> {
        match control & !PF {
            0x2F => Some(Self::Sabm),
            0x63 => Some(Self::Ua),
            0x0F => Some(Self::Dm),
            0x43 => Some(Self::Disc),
            0xEF => Some(Self::Uih),
            0x03 => Some(Self::Ui),
            _ => None,
        }
    }

    pub const fn is_command(self) -> bool {
        matches!(self, Self::Sabm | Self::Disc | Self::Uih | Self::Ui)
    }

    /// UI frames include the information field in the FCS, every other type
    /// only covers the header.
    pub const fn fcs_covers_information(self) -> bool {
        matches!(self, Self::Ui)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame<'a> {
    /// DLCI, 0 is the control channel.
    pub address: u8,
    pub frame_type: FrameType,
    pub command_response: bool,
    pub poll_final: bool,
    pub information: &'a [u8],
}

impl<'a> Frame<'a> {
    /// A frame sent by the initiating station: commands carry C/R = 1,
    /// responses C/R = 0.
    pub const fn new(address: u8, frame_type: FrameType, poll_final: bool, information: &'a [u8]) -> Self {
        Self {
            address,
            frame_type,
            command_response: frame_type.is_command(),
            poll_final,
            information,
        }
    }

    pub const fn sabm(address: u8) -> Self {
        Self::new(address, FrameType::Sabm, true, &[])
    }

    pub const fn disc(address: u8) -> Self {
        Self::new(address, FrameType::Disc, true, &[])
    }

    pub const fn ua(address: u8) -> Self {
        Self::new(address, FrameType::Ua, true, &[])
    }

    pub const fn dm(address: u8) -> Self {
        Self::new(address, FrameType::Dm, true, &[])
    }

    pub const fn uih(address: u8, information: &'a [u8]) -> Self {
        Self::new(address, FrameType::Uih, false, information)
    }

    pub const fn address_octet(&self) -> u8 {
        (self.address << 2) | if self.command_response { CR } else { 0 } | EA
    }

    pub const fn control_octet(&self) -> u8 {
        self.frame_type.control() | if self.poll_final { PF } else { 0 }
    }

    /// Number of octets [`encode`](Self::encode) produces.
    pub const fn encoded_len(&self) -> usize {
        let length_octets = if self.information.len() < 128 { 1 } else { 2 };
        // flag, address, control, length, info, fcs, flag
        4 + length_octets + self.information.len() + 1
    }

    /// Serialize into `out`, returning the number of octets written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let len = self.information.len();
        if len > INFORMATION_LENGTH_MAX {
            return Err(Error::InvalidLength);
        }
        if self.address > ADDRESS_MAX {
            return Err(Error::InvalidArgument);
        }
        let total = self.encoded_len();
        if out.len() < total {
            return Err(Error::InvalidArgument);
        }

        out[0] = FLAG;
        out[1] = self.address_octet();
        out[2] = self.control_octet();
        let mut i = 3;
        if len < 128 {
            out[i] = ((len as u8) << 1) | EA;
            i += 1;
        } else {
            out[i] = ((len & 0x7F) as u8) << 1;
            out[i + 1] = (len >> 7) as u8;
            i += 2;
        }
        let header_end = i;

        out[i..i + len].copy_from_slice(self.information);
        i += len;

        let fcs = if self.frame_type.fcs_covers_information() {
            fcs(&out[1..i])
        } else {
            fcs(&out[1..header_end])
        };
        out[i] = fcs;
        out[i + 1] = FLAG;

        Ok(i + 2)
    }
}

const fn crc_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Reflected CRC-8 over x^8 + x^2 + x + 1.
static CRC_TABLE: [u8; 256] = crc_table();

/// Run the FCS register over `data` starting from `crc`.
pub fn fcs_update(mut crc: u8, data: &[u8]) -> u8 {
    for b in data {
        crc = CRC_TABLE[(crc ^ b) as usize];
    }
    crc
}

/// FCS to transmit for the covered octets.
pub fn fcs(data: &[u8]) -> u8 {
    0xFF - fcs_update(0xFF, data)
}

/// Verify covered octets against a received FCS octet.
pub fn fcs_check(data: &[u8], received: u8) -> bool {
    fcs_update(fcs_update(0xFF, data), &[received]) == FCS_GOOD
}
