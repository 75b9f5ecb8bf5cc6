//! Source-agnostic basic-option frame decoder.
//!
//! The decoder never removes bytes itself. Every call reports how many bytes
//! the caller must consume, so a contiguous buffer and the receive ring of a
//! link are driven by the same algorithm.

use super::frame::{fcs_update, Frame, FrameType, ADDRESS_MAX, CR, EA, FCS_GOOD, FLAG, INFORMATION_LENGTH_MAX, PF};
use crate::error::ProtocolError;
use crate::ring_buffer::RingBuffer;

/// A cursor over received bytes.
pub trait ByteSource {
    /// Bytes currently available past the cursor.
    fn available(&self) -> usize;

    /// Byte `offset` positions past the cursor, without removing it.
    fn peek_at(&self, offset: usize) -> Option<u8>;

    /// Advance the cursor by `count` bytes.
    fn consume(&mut self, count: usize);
}

impl<const N: usize> ByteSource for RingBuffer<N> {
    fn available(&self) -> usize {
        self.len()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        RingBuffer::peek_at(self, offset)
    }

    fn consume(&mut self, count: usize) {
        RingBuffer::consume(self, count)
    }
}

/// Contiguous buffer with a read index.
#[derive(Debug, Clone)]
pub struct SliceSource<'a> {
    buf: &'a [u8],
    index: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, index: 0 }
    }

    pub fn position(&self) -> usize {
        self.index
    }
}

impl ByteSource for SliceSource<'_> {
    fn available(&self) -> usize {
        self.buf.len() - self.index
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.buf.get(self.index + offset).copied()
    }

    fn consume(&mut self, count: usize) {
        self.index = core::cmp::min(self.index + count, self.buf.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// No frame for the wanted address is available.
    NotFound,
    /// A frame has started but not all of its bytes have arrived.
    Incomplete,
    Fcs,
    TooLong,
    Malformed,
}

impl ParseError {
    /// The protocol fault behind this outcome, if it is one.
    pub fn fault(self) -> Option<ProtocolError> {
        match self {
            Self::NotFound | Self::Incomplete => None,
            Self::Fcs => Some(ProtocolError::Fcs),
            Self::TooLong => Some(ProtocolError::TooLong),
            Self::Malformed => Some(ProtocolError::Malformed),
        }
    }
}

fn find_flag<S: ByteSource + ?Sized>(source: &S, from: usize) -> Option<usize> {
    (from..source.available()).find(|&i| source.peek_at(i) == Some(FLAG))
}

/// Positions of the fields of a frame whose header starts at `start`.
struct Header {
    start: usize,
    address: u8,
    control: u8,
    len: usize,
    info_at: usize,
    fcs_at: usize,
}

impl Header {
    /// `None` until the address, control and length octets have arrived.
    fn read<S: ByteSource + ?Sized>(source: &S, start: usize) -> Option<Self> {
        let address = source.peek_at(start)?;
        let control = source.peek_at(start + 1)?;
        let len1 = source.peek_at(start + 2)?;
        let (len, length_octets) = if len1 & EA != 0 {
            ((len1 >> 1) as usize, 1)
        } else {
            let len2 = source.peek_at(start + 3)?;
            (((len1 >> 1) as usize) | ((len2 as usize) << 7), 2)
        };
        let info_at = start + 2 + length_octets;
        Some(Self {
            start,
            address,
            control,
            len,
            info_at,
            fcs_at: info_at + len,
        })
    }

    /// Run the FCS over the covered octets and the received FCS octet,
    /// which must be available.
    fn verifies<S: ByteSource + ?Sized>(&self, source: &S) -> bool {
        let covered_end = if self.control & !PF == FrameType::Ui.control() {
            self.fcs_at
        } else {
            self.info_at
        };
        let mut crc = 0xFF;
        for i in (self.start..covered_end).chain(core::iter::once(self.fcs_at)) {
            crc = fcs_update(crc, &[source.peek_at(i).unwrap_or_default()]);
        }
        crc == FCS_GOOD
    }
}

/// Whether the flag at `flag_at` opens a frame that is complete and verifies.
fn opens_valid_frame<S: ByteSource + ?Sized>(source: &S, flag_at: usize) -> bool {
    let mut start = flag_at + 1;
    while source.peek_at(start) == Some(FLAG) {
        start += 1;
    }
    Header::read(source, start).is_some_and(|h| {
        h.len <= INFORMATION_LENGTH_MAX
            && source.peek_at(h.fcs_at + 1) == Some(FLAG)
            && h.verifies(source)
    })
}

/// First flag past `from` that opens a complete, verified frame.
fn next_valid_frame<S: ByteSource + ?Sized>(source: &S, from: usize) -> Option<usize> {
    let mut from = from;
    while let Some(flag_at) = find_flag(source, from) {
        if opens_valid_frame(source, flag_at) {
            return Some(flag_at);
        }
        from = flag_at + 1;
    }
    None
}

/// Try to decode one frame from `source`.
///
/// Returns the number of bytes to consume together with the outcome. With
/// `wanted` set, well-formed frames for any other DLCI are skipped and
/// reported as [`ParseError::NotFound`]. The closing flag is left in place,
/// since peers may share it as the opening flag of the next frame.
///
/// The FCS is checked as soon as the octet the length field points at has
/// arrived, so a corrupted length octet is reported as [`ParseError::Fcs`]
/// like any other header octet. While that octet is still outstanding, a
/// complete and valid frame further on means the length was corrupted.
pub fn parse<'s, S: ByteSource + ?Sized>(
    source: &S,
    wanted: Option<u8>,
    scratch: &'s mut [u8],
) -> (usize, Result<Frame<'s>, ParseError>) {
    let mut pos = 0;
    loop {
        let Some(flag_at) = find_flag(source, pos) else {
            return (source.available(), Err(ParseError::NotFound));
        };

        let mut hdr = flag_at + 1;
        while source.peek_at(hdr) == Some(FLAG) {
            hdr += 1;
        }
        // Keep the last flag of a run, it opens whatever follows.
        let open = hdr - 1;

        let Some(header) = Header::read(source, hdr) else {
            return (open, Err(ParseError::Incomplete));
        };

        if source.peek_at(header.fcs_at).is_none() {
            if let Some(next) = next_valid_frame(source, hdr) {
                warn!(
                    "[MUX] Frame with address octet {:#x} overrun by the next frame",
                    header.address
                );
                return (next, Err(ParseError::Fcs));
            }
            if header.len > INFORMATION_LENGTH_MAX {
                warn!("[MUX] Frame length {} exceeds maximum, resynchronising", header.len);
                return (hdr, Err(ParseError::TooLong));
            }
            return (open, Err(ParseError::Incomplete));
        }

        if !header.verifies(source) {
            warn!("[MUX] FCS mismatch on frame with address octet {:#x}", header.address);
            let resume = match source.peek_at(header.fcs_at + 1) {
                Some(FLAG) => header.fcs_at + 1,
                _ => find_flag(source, hdr).unwrap_or(source.available()),
            };
            return (resume, Err(ParseError::Fcs));
        }

        match source.peek_at(header.fcs_at + 1) {
            None => return (open, Err(ParseError::Incomplete)),
            Some(FLAG) => {}
            Some(_) => {
                debug!("[MUX] Missing closing flag, resynchronising");
                pos = hdr;
                continue;
            }
        }
        let end = header.fcs_at + 1;

        let Header {
            address,
            control,
            len,
            info_at,
            ..
        } = header;
        if len > INFORMATION_LENGTH_MAX || len > scratch.len() {
            warn!("[MUX] Frame length {} exceeds maximum", len);
            return (end, Err(ParseError::TooLong));
        }

        let dlci = address >> 2;
        let Some(frame_type) = FrameType::from_control(control) else {
            warn!("[MUX] Unknown control octet {:#x}", control);
            return (end, Err(ParseError::Malformed));
        };
        if address & EA == 0 || dlci > ADDRESS_MAX {
            warn!("[MUX] Invalid address octet {:#x}", address);
            return (end, Err(ParseError::Malformed));
        }

        if wanted.is_some_and(|w| w != dlci) {
            return (end, Err(ParseError::NotFound));
        }

        for (i, b) in scratch[..len].iter_mut().enumerate() {
            *b = source.peek_at(info_at + i).unwrap_or_default();
        }

        let frame = Frame {
            address: dlci,
            frame_type,
            command_response: address & CR != 0,
            poll_final: control & PF != 0,
            information: &scratch[..len],
        };
        return (end, Ok(frame));
    }
}

/// [`parse`] and consume the reported bytes from `source`.
pub fn next_frame<'s, S: ByteSource + ?Sized>(
    source: &mut S,
    wanted: Option<u8>,
    scratch: &'s mut [u8],
) -> Result<Frame<'s>, ParseError> {
    let (consumed, result) = parse(source, wanted, scratch);
    source.consume(consumed);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::{FRAME_LENGTH_MAX, FRAME_OVERHEAD_MAX};

    const GOLDEN_UIH: [u8; 8] = [0xF9, 0x07, 0xEF, 0x05, 0x41, 0x42, 0x30, 0xF9];

    fn encode(frame: &Frame) -> heapless::Vec<u8, FRAME_LENGTH_MAX> {
        let mut buf = [0u8; FRAME_LENGTH_MAX];
        let n = frame.encode(&mut buf).unwrap();
        heapless::Vec::from_slice(&buf[..n]).unwrap()
    }

    #[test]
    fn decodes_golden_vector() {
        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let mut src = SliceSource::new(&GOLDEN_UIH);
        let frame = next_frame(&mut src, None, &mut scratch).unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.frame_type, FrameType::Uih);
        assert!(frame.command_response);
        assert!(!frame.poll_final);
        assert_eq!(frame.information, b"AB");
        // Closing flag stays for the next frame
        assert_eq!(src.position(), GOLDEN_UIH.len() - 1);
    }

    #[test]
    fn round_trip() {
        let payload = [0xA5u8; INFORMATION_LENGTH_MAX];
        let cases = [
            Frame::sabm(0),
            Frame::ua(ADDRESS_MAX),
            Frame::dm(7),
            Frame::disc(3),
            Frame::uih(1, &payload[..0]),
            Frame::uih(2, &payload[..1]),
            Frame::uih(5, &payload[..127]),
            Frame::uih(9, &payload[..128]),
            Frame::new(4, FrameType::Ui, true, &payload[..33]),
        ];

        for frame in cases.iter() {
            let bytes = encode(frame);
            assert!(bytes.len() <= frame.information.len() + FRAME_OVERHEAD_MAX);
            let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
            let (consumed, decoded) = parse(&SliceSource::new(&bytes), None, &mut scratch);
            assert_eq!(decoded.as_ref(), Ok(frame));
            assert_eq!(consumed, bytes.len() - 1);
        }
    }

    #[test]
    fn single_bit_flips_are_fcs_errors() {
        // Address, control and FCS octets
        for index in [1usize, 2, 6] {
            for bit in 0..8 {
                let mut bytes = GOLDEN_UIH;
                bytes[index] ^= 1 << bit;
                let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
                let (consumed, result) = parse(&SliceSource::new(&bytes), None, &mut scratch);
                assert_eq!(result, Err(ParseError::Fcs), "byte {} bit {}", index, bit);
                assert_eq!(consumed, bytes.len() - 1);
            }
        }
    }

    #[test]
    fn length_octet_flips_are_fcs_errors() {
        // Followed by an intact frame sharing the closing flag
        let mut stream = [0u8; 15];
        stream[..8].copy_from_slice(&GOLDEN_UIH);
        stream[8..].copy_from_slice(&GOLDEN_UIH[1..]);

        for bit in 0..8 {
            let mut bytes = stream;
            bytes[3] ^= 1 << bit;
            let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
            let mut src = SliceSource::new(&bytes);

            let (consumed, result) = parse(&src, None, &mut scratch);
            assert_eq!(result, Err(ParseError::Fcs), "bit {}", bit);
            assert_eq!(consumed, 7, "bit {}", bit);

            src.consume(consumed);
            let frame = next_frame(&mut src, None, &mut scratch).unwrap();
            assert_eq!(frame.information, b"AB", "bit {}", bit);
        }
    }

    #[test]
    fn partial_delivery_at_every_split() {
        let bytes = encode(&Frame::uih(3, b"hello mux"));
        for split in 0..bytes.len() {
            let mut ring: RingBuffer<64> = RingBuffer::new();
            let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
            let mut decoded = 0;

            ring.enqueue_slice(&bytes[..split]);
            loop {
                match next_frame(&mut ring, None, &mut scratch) {
                    Ok(_) => decoded += 1,
                    Err(ParseError::Incomplete) | Err(ParseError::NotFound) => break,
                    Err(e) => panic!("unexpected {:?}", e),
                }
            }
            assert_eq!(decoded, 0, "split {}", split);

            ring.enqueue_slice(&bytes[split..]);
            loop {
                match next_frame(&mut ring, None, &mut scratch) {
                    Ok(frame) => {
                        assert_eq!(frame.information, b"hello mux");
                        decoded += 1;
                    }
                    Err(ParseError::Incomplete) | Err(ParseError::NotFound) => break,
                    Err(e) => panic!("unexpected {:?}", e),
                }
            }
            assert_eq!(decoded, 1, "split {}", split);
        }
    }

    #[test]
    fn skips_unwanted_address() {
        let mut stream: heapless::Vec<u8, 64> = heapless::Vec::new();
        stream.extend_from_slice(&encode(&Frame::uih(2, b"no"))).unwrap();
        stream.extend_from_slice(&encode(&Frame::uih(1, b"yes"))).unwrap();

        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let mut src = SliceSource::new(&stream);
        assert_eq!(next_frame(&mut src, Some(1), &mut scratch), Err(ParseError::NotFound));
        let frame = next_frame(&mut src, Some(1), &mut scratch).unwrap();
        assert_eq!(frame.information, b"yes");
    }

    #[test]
    fn discards_leading_garbage() {
        let mut stream: heapless::Vec<u8, 32> = heapless::Vec::from_slice(&[0x00, 0x13, 0x37]).unwrap();
        stream.extend_from_slice(&GOLDEN_UIH).unwrap();

        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let mut src = SliceSource::new(&stream);
        assert_eq!(next_frame(&mut src, None, &mut scratch).unwrap().information, b"AB");
    }

    #[test]
    fn garbage_without_flag_is_consumed() {
        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let (consumed, result) = parse(&SliceSource::new(&[1, 2, 3]), None, &mut scratch);
        assert_eq!(consumed, 3);
        assert_eq!(result, Err(ParseError::NotFound));
    }

    #[test]
    fn shared_flags_between_frames() {
        // Second frame reuses the closing flag of the first
        let stream = [
            0xF9, 0x07, 0xEF, 0x05, 0x41, 0x42, 0x30, //
            0xF9, 0x07, 0xEF, 0x05, 0x41, 0x42, 0x30, 0xF9,
        ];
        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let mut src = SliceSource::new(&stream);
        assert!(next_frame(&mut src, None, &mut scratch).is_ok());
        assert!(next_frame(&mut src, None, &mut scratch).is_ok());
        assert_eq!(next_frame(&mut src, None, &mut scratch), Err(ParseError::Incomplete));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let stream = [0xF9, 0x07, 0xEF, 0x00, 0x02, 0x00];
        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let (consumed, result) = parse(&SliceSource::new(&stream), None, &mut scratch);
        assert_eq!(result, Err(ParseError::TooLong));
        assert_eq!(consumed, 1);
    }

    #[test]
    fn unknown_control_octet_is_malformed() {
        let mut bytes = [0xF9, 0x07, 0x55, 0x01, 0x00, 0xF9];
        bytes[4] = crate::mux::frame::fcs(&bytes[1..4]);
        let mut scratch = [0u8; INFORMATION_LENGTH_MAX];
        let (_, result) = parse(&SliceSource::new(&bytes), None, &mut scratch);
        assert_eq!(result, Err(ParseError::Malformed));
    }
}
