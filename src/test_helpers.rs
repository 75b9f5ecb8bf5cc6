//! Test doubles for the serial link, the register bus and delays.

use core::convert::Infallible;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::Once;
use std::vec::Vec;

use embedded_hal::i2c;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::{I2c, Operation};
use embedded_io_async::{ErrorKind, ErrorType, Read, Write};

use crate::fuel_gauge::registers::{
    checksum, commands as gauge_commands, corrected_checksum, MAC_BLOCK_LENGTH, MAC_BLOCK_SIZE,
    SUB_COMMAND_SENTINEL,
};

use crate::mux::frame::{Frame, FrameType, FRAME_LENGTH_MAX};
use crate::mux::parser::{next_frame, ParseError, SliceSource};

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .init();
    });
}

/// Frame as decoded from bytes the code under test wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub dlci: u8,
    pub frame_type: FrameType,
    pub poll_final: bool,
    pub information: Vec<u8>,
}

impl SentFrame {
    /// Modem status command on the control channel, with its FC bit.
    pub fn msc_command(&self) -> Option<(u8, bool)> {
        match (self.dlci, self.frame_type, self.information.as_slice()) {
            (0, FrameType::Uih, [0xE3, 0x05, dlci, signals]) => {
                Some((dlci >> 2, signals & 0x02 != 0))
            }
            _ => None,
        }
    }
}

/// Serial writer that records everything written to it.
#[derive(Clone, Default)]
pub struct MockSerial {
    sent: Rc<RefCell<Vec<u8>>>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.sent.borrow().clone()
    }

    pub fn clear(&self) {
        self.sent.borrow_mut().clear();
    }

    /// Decode every frame written so far.
    pub fn frames(&self) -> Vec<SentFrame> {
        let bytes = self.bytes();
        let mut src = SliceSource::new(&bytes);
        let mut scratch = [0u8; FRAME_LENGTH_MAX];
        let mut frames = Vec::new();
        loop {
            match next_frame(&mut src, None, &mut scratch) {
                Ok(f) => frames.push(SentFrame {
                    dlci: f.address,
                    frame_type: f.frame_type,
                    poll_final: f.poll_final,
                    information: f.information.to_vec(),
                }),
                Err(ParseError::Incomplete) | Err(ParseError::NotFound) => break,
                Err(e) => panic!("code under test wrote a bad frame: {:?}", e),
            }
        }
        frames
    }

    /// Modem status commands written so far, as `(dlci, flow_off)`.
    pub fn msc_commands(&self) -> Vec<(u8, bool)> {
        self.frames().iter().filter_map(SentFrame::msc_command).collect()
    }
}

impl ErrorType for MockSerial {
    type Error = Infallible;
}

impl Write for MockSerial {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.sent.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Serial writer whose link is down.
pub struct BrokenSerial;

impl ErrorType for BrokenSerial {
    type Error = ErrorKind;
}

impl Write for BrokenSerial {
    async fn write(&mut self, _buf: &[u8]) -> Result<usize, Self::Error> {
        Err(ErrorKind::BrokenPipe)
    }
}

/// Serial reader handing out pre-recorded chunks, yielding before each one
/// so that other futures in the same test get polled in between.
pub struct MockReader {
    chunks: VecDeque<Vec<u8>>,
}

impl MockReader {
    pub fn new(chunks: &[&[u8]]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
        }
    }
}

impl ErrorType for MockReader {
    type Error = Infallible;
}

impl Read for MockReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        embassy_futures::yield_now().await;
        let Some(mut chunk) = self.chunks.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.chunks.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

/// Encode a frame as the cellular module would send it.
pub fn peer_frame(dlci: u8, frame_type: FrameType, information: &[u8]) -> Vec<u8> {
    let mut frame = Frame::new(dlci, frame_type, frame_type != FrameType::Uih, information);
    // Responses from the responding station carry C/R = 1 as well.
    frame.command_response = true;
    let mut buf = [0u8; FRAME_LENGTH_MAX];
    let n = frame.encode(&mut buf).unwrap();
    buf[..n].to_vec()
}

/// Simulated BQ27220 on the register bus.
///
/// Standard registers are plain memory. `Control()` answers sub-commands
/// after a configurable number of polls, and data memory is reachable
/// through the MAC window the way the gauge exposes it. A block write only
/// lands in data memory when the checksum register carries the corrected
/// checksum the gauge expects.
#[derive(Clone, Default)]
pub struct MockGauge {
    inner: Rc<RefCell<GaugeState>>,
}

#[derive(Default)]
struct GaugeState {
    registers: Vec<u8>,
    memory: BTreeMap<u16, u8>,
    window: u16,
    staged: Option<(u16, Vec<u8>)>,
    staged_sum: Option<u8>,
    complete_after: Option<usize>,
    control_value: u16,
    polls: usize,
    sub_command_response: Vec<u8>,
    corrupt_sum: bool,
    fail_after: Option<usize>,
    transactions: usize,
    rejected: usize,
    writes: Vec<Vec<u8>>,
    reads: Vec<(u8, usize)>,
}

impl GaugeState {
    fn block(&self, address: u16) -> Vec<u8> {
        (0..MAC_BLOCK_SIZE as u16)
            .map(|i| {
                self.memory
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Mirror the block at `address` into the MAC registers.
    fn select(&mut self, address: u16) {
        self.window = address;
        let block = self.block(address);
        let [lo, hi] = address.to_le_bytes();
        let mut sum_input = vec![lo, hi];
        sum_input.extend_from_slice(&block);
        let mut sum = checksum(&sum_input);
        if self.corrupt_sum {
            sum = sum.wrapping_add(1);
        }

        let sub = gauge_commands::MAC_SUB_COMMAND as usize;
        self.registers[sub] = lo;
        self.registers[sub + 1] = hi;
        let data = gauge_commands::MAC_DATA as usize;
        self.registers[data..data + MAC_BLOCK_SIZE].copy_from_slice(&block);
        self.registers[gauge_commands::MAC_DATA_SUM as usize] = sum;
        self.registers[gauge_commands::MAC_DATA_LEN as usize] = MAC_BLOCK_LENGTH;
    }

    fn control_write(&mut self, cmd: u16) {
        if cmd >= 0x4000 {
            self.select(cmd);
            return;
        }
        self.polls = 0;
        let [lo, hi] = cmd.to_le_bytes();
        let sub = gauge_commands::MAC_SUB_COMMAND as usize;
        self.registers[sub] = lo;
        self.registers[sub + 1] = hi;
        for (i, b) in self.sub_command_response.iter().enumerate() {
            self.registers[sub + 2 + i] = *b;
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        self.writes.push(bytes.to_vec());
        let (reg, payload) = (bytes[0], &bytes[1..]);
        match (reg, payload.len()) {
            (gauge_commands::CONTROL, 2) => {
                self.control_write(u16::from_le_bytes([payload[0], payload[1]]))
            }
            (gauge_commands::MAC_SUB_COMMAND, 2) => {
                self.select(u16::from_le_bytes([payload[0], payload[1]]))
            }
            // Block writes carry the address high byte first
            (gauge_commands::MAC_SUB_COMMAND, _) => {
                let address = u16::from_be_bytes([payload[0], payload[1]]);
                self.staged = Some((address, payload.to_vec()));
                self.staged_sum = None;
            }
            (gauge_commands::MAC_DATA_SUM, 1) => self.staged_sum = Some(payload[0]),
            (gauge_commands::MAC_DATA_LEN, 1) => self.commit(payload[0]),
            _ => {
                let start = reg as usize;
                self.registers[start..start + payload.len()].copy_from_slice(payload);
            }
        }
    }

    fn commit(&mut self, len: u8) {
        let (Some((address, payload)), Some(sum)) = (self.staged.take(), self.staged_sum.take())
        else {
            self.rejected += 1;
            return;
        };
        let expected = corrected_checksum(address, checksum(&payload));
        if sum != expected || len != MAC_BLOCK_LENGTH {
            self.rejected += 1;
            return;
        }
        for (i, b) in payload[2..].iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u16), *b);
        }
        self.select(address);
    }

    fn read(&mut self, reg: u8, buf: &mut [u8]) {
        self.reads.push((reg, buf.len()));
        if reg == gauge_commands::CONTROL && buf.len() == 4 {
            self.polls += 1;
            let raw = match self.complete_after {
                Some(n) if self.polls >= n => SUB_COMMAND_SENTINEL,
                _ => self.control_value,
            };
            buf.fill(0);
            buf[..2].copy_from_slice(&raw.to_be_bytes());
            return;
        }
        let start = reg as usize;
        buf.copy_from_slice(&self.registers[start..start + buf.len()]);
    }
}

impl MockGauge {
    pub fn new() -> Self {
        let gauge = Self::default();
        gauge.inner.borrow_mut().registers = vec![0; 0x80];
        gauge
    }

    pub fn set_register_u8(&self, reg: u8, value: u8) {
        self.inner.borrow_mut().registers[reg as usize] = value;
    }

    pub fn set_register_u16(&self, reg: u8, value: u16) {
        let i = reg as usize;
        self.inner.borrow_mut().registers[i..i + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_memory(&self, address: u16, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        for (i, b) in bytes.iter().enumerate() {
            inner.memory.insert(address + i as u16, *b);
        }
    }

    pub fn memory(&self, address: u16, len: usize) -> Vec<u8> {
        let inner = self.inner.borrow();
        inner.block(address)[..len].to_vec()
    }

    /// Read back the sentinel from the `n`th poll after a sub-command.
    pub fn complete_after(&self, n: usize) {
        self.inner.borrow_mut().complete_after = Some(n);
    }

    pub fn complete_never(&self) {
        self.inner.borrow_mut().complete_after = None;
    }

    /// What `Control()` reads while a sub-command has not completed.
    pub fn set_control_value(&self, value: u16) {
        self.inner.borrow_mut().control_value = value;
    }

    /// Bytes following the echoed sub-command in the MAC window.
    pub fn set_sub_command_response(&self, bytes: &[u8]) {
        self.inner.borrow_mut().sub_command_response = bytes.to_vec();
    }

    /// Report a wrong `MACDataSum()` for every selected block.
    pub fn corrupt_reported_checksum(&self) {
        self.inner.borrow_mut().corrupt_sum = true;
    }

    /// Fail every transaction after the first `n`.
    pub fn fail_after(&self, n: usize) {
        self.inner.borrow_mut().fail_after = Some(n);
    }

    pub fn control_polls(&self) -> usize {
        self.inner.borrow().polls
    }

    pub fn rejected_commits(&self) -> usize {
        self.inner.borrow().rejected
    }

    /// Plain write transactions, register address first.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.borrow().writes.clone()
    }

    /// Register reads as `(register, length)`.
    pub fn reads(&self) -> Vec<(u8, usize)> {
        self.inner.borrow().reads.clone()
    }

    pub fn clear_log(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.writes.clear();
        inner.reads.clear();
    }
}

impl i2c::ErrorType for MockGauge {
    type Error = i2c::ErrorKind;
}

impl I2c for MockGauge {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        let nack = i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address);
        if address != crate::fuel_gauge::registers::DEFAULT_ADDRESS {
            return Err(nack);
        }
        let limit = inner.fail_after;
        if limit.is_some_and(|n| inner.transactions >= n) {
            return Err(nack);
        }
        inner.transactions += 1;

        match operations {
            [Operation::Write(bytes)] => inner.write(bytes),
            [Operation::Write([reg]), Operation::Read(buf)] => inner.read(*reg, buf),
            _ => panic!("unexpected transaction shape"),
        }
        Ok(())
    }
}

/// Delay provider that returns immediately and records each wait in
/// milliseconds.
#[derive(Clone, Default)]
pub struct MockDelay {
    delays: Rc<RefCell<Vec<u32>>>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<u32> {
        self.delays.borrow().clone()
    }

    pub fn total_ms(&self) -> u32 {
        self.delays.borrow().iter().sum()
    }
}

impl DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.delays.borrow_mut().push(ns / 1_000_000);
    }

    async fn delay_us(&mut self, us: u32) {
        self.delays.borrow_mut().push(us / 1_000);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.delays.borrow_mut().push(ms);
    }
}
