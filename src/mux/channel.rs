use bitflags::bitflags;
use embassy_sync::waitqueue::WakerRegistration;

use super::frame::FrameType;
use crate::ring_buffer::RingBuffer;

/// Lifecycle of a data link connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Null,
    Open,
    /// Closed locally or by the peer. Buffered data can still be read; the
    /// slot is only released when the whole context is torn down.
    OpenDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    /// SABM answered with UA.
    HandshakeComplete,
    /// DISC or DM received from the peer.
    PeerDisconnect,
    /// DISC sent by us.
    LocalClose,
}

impl ChannelState {
    /// The state reached through `transition`, or `None` if it is not a
    /// legal move from `self`.
    pub fn apply(self, transition: Transition) -> Option<Self> {
        match (self, transition) {
            (Self::Null, Transition::HandshakeComplete) => Some(Self::Open),
            (Self::Open, Transition::PeerDisconnect | Transition::LocalClose) => {
                Some(Self::OpenDisconnected)
            }
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u8 {
        const DATA_RECEIVED = 0x01;
        /// Peer asked us to stop sending.
        const TX_FLOW_OFF = 0x02;
        /// Peer allows sending again.
        const TX_FLOW_ON = 0x04;
        const DISCONNECTED = 0x08;
        /// A frame was dropped because the channel buffer was full.
        const OVERFLOW = 0x10;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Events {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Events({=u8:#x})", self.bits())
    }
}

/// Published to subscribers of a multiplexer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelEvent {
    pub dlci: u8,
    pub events: Events,
}

/// Opaque reference to an open channel.
///
/// Handles stay valid after the channel is closed and become invalid once
/// the owning context is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle {
    pub(crate) slot: u8,
    pub(crate) dlci: u8,
    pub(crate) generation: u16,
}

impl ChannelHandle {
    pub fn dlci(&self) -> u8 {
        self.dlci
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Accepted,
    Rejected,
}

/// Session state of one DLCI, including the control channel.
pub(crate) struct Dlc {
    pub state: ChannelState,
    /// Response we are waiting for, used to correlate UA/DM.
    pub wanted_response: Option<FrameType>,
    pub outcome: Option<Outcome>,
    pub waker: WakerRegistration,
}

impl Dlc {
    pub const fn new() -> Self {
        Self {
            state: ChannelState::Null,
            wanted_response: None,
            outcome: None,
            waker: WakerRegistration::new(),
        }
    }

    /// Apply `transition`, returning whether the state changed.
    pub fn transition(&mut self, dlci: u8, transition: Transition) -> bool {
        match self.state.apply(transition) {
            Some(next) => {
                debug!("[MUX] DLCI {} {:?} -> {:?}", dlci, self.state, next);
                self.state = next;
                true
            }
            None => {
                debug!(
                    "[MUX] DLCI {} ignoring {:?} in state {:?}",
                    dlci, transition, self.state
                );
                false
            }
        }
    }

    /// Record the answer to an outstanding SABM/DISC.
    pub fn resolve(&mut self, outcome: Outcome) -> bool {
        if self.wanted_response.take().is_none() {
            return false;
        }
        self.outcome = Some(outcome);
        self.waker.wake();
        true
    }

    pub fn expect(&mut self, response: FrameType) {
        self.wanted_response = Some(response);
        self.outcome = None;
    }
}

/// Receive buffer and flow-control flags of a data channel.
pub(crate) struct Traffic<const N: usize> {
    pub rx: RingBuffer<N>,
    pub tx_flow_controlled_off: bool,
    pub rx_flow_controlled_off: bool,
    pub overflow_count: u32,
}

impl<const N: usize> Traffic<N> {
    pub const fn new() -> Self {
        Self {
            rx: RingBuffer::new(),
            tx_flow_controlled_off: false,
            rx_flow_controlled_off: false,
            overflow_count: 0,
        }
    }

    /// Update the receive-side flow state after the buffer grew. Returns
    /// `true` when the peer must now be flow-controlled off.
    pub fn should_stop_peer(&mut self, off_percent: u8) -> bool {
        if !self.rx_flow_controlled_off && self.rx.fill_percent() >= off_percent as usize {
            self.rx_flow_controlled_off = true;
            return true;
        }
        false
    }

    /// Update the receive-side flow state after the buffer drained. Returns
    /// `true` when the peer may now resume.
    pub fn should_resume_peer(&mut self, on_percent: u8) -> bool {
        if self.rx_flow_controlled_off && self.rx.fill_percent() <= on_percent as usize {
            self.rx_flow_controlled_off = false;
            return true;
        }
        false
    }
}

pub(crate) struct Slot<const N: usize> {
    /// `None` while the slot is free.
    pub dlci: Option<u8>,
    pub dlc: Dlc,
    pub traffic: Traffic<N>,
    pub rx_waker: WakerRegistration,
}

impl<const N: usize> Slot<N> {
    pub const fn new() -> Self {
        Self {
            dlci: None,
            dlc: Dlc::new(),
            traffic: Traffic::new(),
            rx_waker: WakerRegistration::new(),
        }
    }

    pub fn claim(&mut self, dlci: u8) {
        *self = Self::new();
        self.dlci = Some(dlci);
    }

    pub fn release(&mut self) {
        *self = Self::new();
    }

    /// Mark disconnected and wake anyone blocked on the channel.
    pub fn disconnect(&mut self, transition: Transition) -> bool {
        let dlci = self.dlci.unwrap_or_default();
        let changed = self.dlc.transition(dlci, transition);
        self.dlc.wanted_response = None;
        self.rx_waker.wake();
        changed
    }
}
