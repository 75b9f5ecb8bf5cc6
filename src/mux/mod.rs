//! 3GPP TS 27.010 basic-option multiplexer.
//!
//! A [`Mux`] owns one physical serial link. Outbound traffic from every
//! channel is serialised through a single link lock, while received bytes are
//! fed in by exactly one task (see [`runner::Runner`]) and fanned out into
//! per-channel receive buffers.

pub mod channel;
pub mod control;
pub mod frame;
pub mod parser;
pub mod runner;

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;
use embedded_io_async::Write;
use heapless::Vec;

use crate::config::MuxConfig;
use crate::error::{Error, ProtocolError};
use crate::ring_buffer::RingBuffer;

pub use channel::{ChannelEvent, ChannelHandle, ChannelState, Events};
use channel::{Dlc, Outcome, Slot, Transition};
use control::ControlMessage;
use frame::{Frame, FrameType, ADDRESS_MAX, FRAME_LENGTH_MAX, INFORMATION_LENGTH_MAX};
use parser::ParseError;

/// DLCI of the control channel.
pub const CHANNEL_ID_CONTROL: u8 = 0;
/// DLCI conventionally used for the AT command channel.
pub const CHANNEL_ID_AT: u8 = 1;

/// Default size of a channel receive buffer.
pub const CHANNEL_BUFFER_SIZE: usize = INFORMATION_LENGTH_MAX * 4;
/// Default size of the raw receive ring.
pub const RX_BUFFER_SIZE: usize = FRAME_LENGTH_MAX * 4;

pub const EVENT_CAPACITY: usize = 8;
pub const EVENT_SUBSCRIBERS: usize = 4;
const EVENT_PUBLISHERS: usize = 1;

/// Holding buffer for control messages split across frames.
const HOLDING_BUFFER_SIZE: usize = INFORMATION_LENGTH_MAX;

pub type EventSubscriber<'a, M> =
    Subscriber<'a, M, ChannelEvent, EVENT_CAPACITY, EVENT_SUBSCRIBERS, EVENT_PUBLISHERS>;

/// Counters for received traffic that was dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStats {
    pub fcs_errors: u32,
    pub malformed: u32,
    pub too_long: u32,
    /// Frames that did not fit the state of their DLCI, e.g. unsolicited UA.
    pub unexpected_frames: u32,
    pub overflows: u32,
    /// Most recent of the faults counted above.
    pub last_fault: Option<ProtocolError>,
}

impl LinkStats {
    fn record(&mut self, fault: ProtocolError) {
        match fault {
            ProtocolError::Fcs => self.fcs_errors += 1,
            ProtocolError::Malformed => self.malformed += 1,
            ProtocolError::TooLong => self.too_long += 1,
            ProtocolError::UnexpectedFrame => self.unexpected_frames += 1,
        }
        self.last_fault = Some(fault);
    }
}

struct Link<W> {
    writer: W,
    buf: [u8; FRAME_LENGTH_MAX],
}

impl<W: Write> Link<W> {
    async fn send(&mut self, frame: &Frame<'_>) -> Result<(), Error> {
        let n = frame.encode(&mut self.buf)?;
        trace!("[MUX] TX {:?}", hex!(&self.buf[..n]));
        self.writer
            .write_all(&self.buf[..n])
            .await
            .map_err(Error::transport)?;
        self.writer.flush().await.map_err(Error::transport)
    }
}

struct Receiver<const N: usize> {
    ring: RingBuffer<N>,
    scratch: [u8; INFORMATION_LENGTH_MAX],
    holding: Vec<u8, HOLDING_BUFFER_SIZE>,
    stalled: bool,
    stats: LinkStats,
}

impl<const N: usize> Receiver<N> {
    const fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            scratch: [0; INFORMATION_LENGTH_MAX],
            holding: Vec::new(),
            stalled: false,
            stats: LinkStats {
                fcs_errors: 0,
                malformed: 0,
                too_long: 0,
                unexpected_frames: 0,
                overflows: 0,
                last_fault: None,
            },
        }
    }

    fn record(&mut self, error: ParseError) {
        if let Some(fault) = error.fault() {
            self.stats.record(fault);
        }
    }
}

/// Which session a response belongs to.
#[derive(Clone, Copy)]
enum Target {
    Control,
    Slot(usize),
}

enum Delivery {
    Consumed,
    /// Channel buffer full, leave the frame in the ring.
    Stalled,
}

/// Multiplexer context for one physical link.
///
/// `CHANNELS` bounds the number of simultaneously allocated data channels,
/// `CHANNEL_BUF` is the receive buffer of each, `RX_BUF` the raw ring that
/// received bytes are decoded from.
pub struct Mux<
    M: RawMutex,
    W: Write,
    const CHANNELS: usize = 4,
    const CHANNEL_BUF: usize = CHANNEL_BUFFER_SIZE,
    const RX_BUF: usize = RX_BUFFER_SIZE,
> {
    config: MuxConfig,
    generation: u16,
    link: Mutex<M, Link<W>>,
    rx: Mutex<M, Receiver<RX_BUF>>,
    control: BlockingMutex<M, RefCell<Dlc>>,
    slots: [BlockingMutex<M, RefCell<Slot<CHANNEL_BUF>>>; CHANNELS],
    events: PubSubChannel<M, ChannelEvent, EVENT_CAPACITY, EVENT_SUBSCRIBERS, EVENT_PUBLISHERS>,
    rx_space: Signal<M, ()>,
}

impl<M: RawMutex, W: Write, const CHANNELS: usize, const CHANNEL_BUF: usize, const RX_BUF: usize>
    Mux<M, W, CHANNELS, CHANNEL_BUF, RX_BUF>
{
    const BUFFERS_FIT_FRAMES: () = {
        ::core::assert!(CHANNEL_BUF >= INFORMATION_LENGTH_MAX);
        ::core::assert!(RX_BUF >= FRAME_LENGTH_MAX);
        ::core::assert!(CHANNELS <= u8::MAX as usize);
    };

    pub fn new(config: MuxConfig, writer: W) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::BUFFERS_FIT_FRAMES;

        Self {
            config,
            generation: 0,
            link: Mutex::new(Link {
                writer,
                buf: [0; FRAME_LENGTH_MAX],
            }),
            rx: Mutex::new(Receiver::new()),
            control: BlockingMutex::new(RefCell::new(Dlc::new())),
            slots: core::array::from_fn(|_| BlockingMutex::new(RefCell::new(Slot::new()))),
            events: PubSubChannel::new(),
            rx_space: Signal::new(),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Subscribe to channel events.
    pub fn subscribe(&self) -> Result<EventSubscriber<'_, M>, Error> {
        self.events.subscriber().map_err(|_| Error::ResourceExhausted)
    }

    pub fn is_enabled(&self) -> bool {
        self.control.lock(|c| c.borrow().state == ChannelState::Open)
    }

    /// Start multiplexing by establishing the control channel.
    pub async fn enable(&self) -> Result<(), Error> {
        match self.control.lock(|c| c.borrow().state) {
            ChannelState::Open => return Ok(()),
            ChannelState::OpenDisconnected => {
                warn!("[MUX] Previous session still allocated, tear down first");
                return Err(Error::TeardownRequired);
            }
            ChannelState::Null => {}
        }

        self.control.lock(|c| c.borrow_mut().expect(FrameType::Ua));
        self.send_frame(&Frame::sabm(CHANNEL_ID_CONTROL)).await?;

        match self.wait_outcome(Target::Control).await {
            Ok(Outcome::Accepted) => {
                let opened = self.control.lock(|c| {
                    c.borrow_mut()
                        .transition(CHANNEL_ID_CONTROL, Transition::HandshakeComplete)
                });
                if !opened {
                    return Err(ProtocolError::UnexpectedFrame.into());
                }
                info!("[MUX] Enabled");
                Ok(())
            }
            Ok(Outcome::Rejected) => {
                warn!("[MUX] Peer refused control channel");
                Err(Error::Rejected)
            }
            Err(e) => {
                self.control.lock(|c| c.borrow_mut().wanted_response = None);
                Err(e)
            }
        }
    }

    /// Establish data channel `dlci` with the peer.
    pub async fn open_channel(&self, dlci: u8) -> Result<ChannelHandle, Error> {
        if dlci == CHANNEL_ID_CONTROL || dlci > ADDRESS_MAX {
            return Err(Error::InvalidArgument);
        }
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }

        let slot = {
            let mut link = self.link.lock().await;

            if self.find_slot(dlci).is_some() {
                return Err(Error::AlreadyOpen);
            }
            let slot = self
                .slots
                .iter()
                .position(|s| s.lock(|s| s.borrow().dlci.is_none()))
                .ok_or(Error::ResourceExhausted)?;

            self.slots[slot].lock(|s| {
                let mut s = s.borrow_mut();
                s.claim(dlci);
                s.dlc.expect(FrameType::Ua);
            });

            if let Err(e) = link.send(&Frame::sabm(dlci)).await {
                self.slots[slot].lock(|s| s.borrow_mut().release());
                return Err(e);
            }
            slot
        };

        match self.wait_outcome(Target::Slot(slot)).await {
            Ok(Outcome::Accepted) => {
                let opened = self.slots[slot].lock(|s| {
                    s.borrow_mut()
                        .dlc
                        .transition(dlci, Transition::HandshakeComplete)
                });
                if !opened {
                    self.slots[slot].lock(|s| s.borrow_mut().release());
                    return Err(ProtocolError::UnexpectedFrame.into());
                }
                info!("[MUX] Channel {} open", dlci);
                Ok(ChannelHandle {
                    slot: slot as u8,
                    dlci,
                    generation: self.generation,
                })
            }
            Ok(Outcome::Rejected) => {
                warn!("[MUX] Peer refused channel {}", dlci);
                self.slots[slot].lock(|s| s.borrow_mut().release());
                Err(Error::Rejected)
            }
            Err(e) => {
                warn!("[MUX] No response opening channel {}", dlci);
                self.slots[slot].lock(|s| s.borrow_mut().release());
                Err(e)
            }
        }
    }

    /// Disconnect a channel.
    ///
    /// The channel moves to [`ChannelState::OpenDisconnected`]; its buffer
    /// is kept, and remaining data can still be read, until
    /// [`teardown`](Self::teardown).
    pub async fn close_channel(&self, handle: ChannelHandle) -> Result<(), Error> {
        let slot = self.slot(handle)?;
        match slot.lock(|s| s.borrow().dlc.state) {
            ChannelState::Open => {}
            ChannelState::OpenDisconnected => return Ok(()),
            ChannelState::Null => return Err(Error::NotOpen),
        }

        let mut link = self.link.lock().await;
        slot.lock(|s| s.borrow_mut().dlc.expect(FrameType::Ua));
        link.send(&Frame::disc(handle.dlci)).await?;
        drop(link);

        slot.lock(|s| s.borrow_mut().disconnect(Transition::LocalClose));
        info!("[MUX] Channel {} closed", handle.dlci);
        self.publish(handle.dlci, Events::DISCONNECTED);
        Ok(())
    }

    /// Send `data` on a channel, split into UIH frames.
    ///
    /// Returns the number of bytes sent, which is less than `data.len()`
    /// only if the peer flow-controlled the channel off part way through.
    pub async fn write(&self, handle: ChannelHandle, data: &[u8]) -> Result<usize, Error> {
        let slot = self.slot(handle)?;
        let usable = |slot: &BlockingMutex<M, RefCell<Slot<CHANNEL_BUF>>>| {
            slot.lock(|s| {
                let s = s.borrow();
                match s.dlc.state {
                    ChannelState::Open if s.traffic.tx_flow_controlled_off => {
                        Err(Error::FlowControlled)
                    }
                    ChannelState::Open => Ok(()),
                    _ => Err(Error::NotOpen),
                }
            })
        };
        usable(slot)?;

        let mut link = self.link.lock().await;
        let mut sent = 0;
        for chunk in data.chunks(INFORMATION_LENGTH_MAX) {
            match usable(slot) {
                Ok(()) => {}
                Err(Error::FlowControlled) if sent > 0 => {
                    debug!("[MUX] Channel {} flow controlled after {} bytes", handle.dlci, sent);
                    break;
                }
                Err(e) => return Err(e),
            }
            link.send(&Frame::uih(handle.dlci, chunk)).await?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    /// Read received data from a channel, waiting until some is available.
    ///
    /// Once the channel is disconnected, remaining buffered data is still
    /// returned, after which reads fail with [`Error::NotOpen`].
    pub async fn read(&self, handle: ChannelHandle, buf: &mut [u8]) -> Result<usize, Error> {
        let slot = self.slot(handle)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let on_percent = self.config.rx_flow_on_percent;
        let (n, resume) = poll_fn(|cx| {
            slot.lock(|s| {
                let mut s = s.borrow_mut();
                if s.dlci != Some(handle.dlci) {
                    return Poll::Ready(Err(Error::InvalidHandle));
                }
                let n = s.traffic.rx.dequeue_slice(buf);
                if n > 0 {
                    let resume = s.traffic.should_resume_peer(on_percent);
                    return Poll::Ready(Ok((n, resume)));
                }
                if s.dlc.state != ChannelState::Open {
                    return Poll::Ready(Err(Error::NotOpen));
                }
                s.rx_waker.register(cx.waker());
                Poll::Pending
            })
        })
        .await?;

        self.rx_space.signal(());
        if resume {
            debug!("[MUX] Channel {} rx flow on", handle.dlci);
            self.send_flow_status(handle.dlci, false).await?;
        }
        Ok(n)
    }

    /// Bytes waiting to be read on a channel.
    pub fn available(&self, handle: ChannelHandle) -> Result<usize, Error> {
        Ok(self.slot(handle)?.lock(|s| s.borrow().traffic.rx.len()))
    }

    pub fn state(&self, handle: ChannelHandle) -> Result<ChannelState, Error> {
        Ok(self.slot(handle)?.lock(|s| s.borrow().dlc.state))
    }

    /// Frames dropped on a channel because its buffer was full.
    pub fn overflow_count(&self, handle: ChannelHandle) -> Result<u32, Error> {
        Ok(self.slot(handle)?.lock(|s| s.borrow().traffic.overflow_count))
    }

    /// Whether the peer has currently flow-controlled the channel off.
    pub fn is_tx_flow_controlled(&self, handle: ChannelHandle) -> Result<bool, Error> {
        Ok(self
            .slot(handle)?
            .lock(|s| s.borrow().traffic.tx_flow_controlled_off))
    }

    pub async fn stats(&self) -> LinkStats {
        self.rx.lock().await.stats
    }

    /// Feed bytes received from the link and decode every complete frame.
    ///
    /// Returns how many bytes were accepted. Fewer than `bytes.len()` are
    /// accepted only while the receive ring is full because a channel
    /// consumer is not keeping up; the caller retries the rest after
    /// [`wait_rx_space`](Self::wait_rx_space).
    pub async fn on_bytes_received(&self, bytes: &[u8]) -> Result<usize, Error> {
        let mut rx = self.rx.lock().await;
        let accepted = rx.ring.enqueue_slice(bytes);
        trace!("[MUX] RX {:?}", hex!(&bytes[..accepted]));
        self.decode(&mut rx).await?;
        Ok(accepted)
    }

    /// Retry decoding frames left in the receive ring.
    pub async fn process(&self) -> Result<(), Error> {
        let mut rx = self.rx.lock().await;
        self.decode(&mut rx).await
    }

    /// Whether decoding is parked on a frame that does not fit its channel.
    pub async fn is_stalled(&self) -> bool {
        self.rx.lock().await.stalled
    }

    /// Resolves once a consumer has freed channel buffer space.
    pub async fn wait_rx_space(&self) {
        self.rx_space.wait().await
    }

    /// Disconnect every channel and close down the multiplexer session.
    pub async fn disable(&self) -> Result<(), Error> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut link = self.link.lock().await;
        for slot in self.slots.iter() {
            let dlci = slot.lock(|s| {
                let s = s.borrow();
                (s.dlc.state == ChannelState::Open).then_some(s.dlci).flatten()
            });
            if let Some(dlci) = dlci {
                link.send(&Frame::disc(dlci)).await?;
                slot.lock(|s| s.borrow_mut().disconnect(Transition::LocalClose));
                self.publish(dlci, Events::DISCONNECTED);
            }
        }

        let cld = ControlMessage::CloseDown { command: true }.encode();
        link.send(&Frame::uih(CHANNEL_ID_CONTROL, &cld)).await?;
        drop(link);

        self.control.lock(|c| {
            c.borrow_mut()
                .transition(CHANNEL_ID_CONTROL, Transition::LocalClose)
        });
        info!("[MUX] Disabled");
        Ok(())
    }

    /// Release every channel.
    ///
    /// Requires exclusive access, so no reader or writer can still hold a
    /// reference into a channel. Handles issued before are invalid afterwards
    /// and the context may be enabled again.
    pub fn teardown(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.get_mut().get_mut().release();
        }
        *self.control.get_mut().get_mut() = Dlc::new();

        let rx = self.rx.get_mut();
        rx.ring.clear();
        rx.holding.clear();
        rx.stalled = false;

        self.rx_space.reset();
        self.generation = self.generation.wrapping_add(1);
        debug!("[MUX] Torn down, generation {}", self.generation);
    }

    fn slot(
        &self,
        handle: ChannelHandle,
    ) -> Result<&BlockingMutex<M, RefCell<Slot<CHANNEL_BUF>>>, Error> {
        if handle.generation != self.generation {
            return Err(Error::InvalidHandle);
        }
        let slot = self
            .slots
            .get(handle.slot as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.lock(|s| s.borrow().dlci) != Some(handle.dlci) {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }

    fn find_slot(&self, dlci: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.lock(|s| s.borrow().dlci == Some(dlci)))
    }

    fn publish(&self, dlci: u8, events: Events) {
        self.events
            .immediate_publisher()
            .publish_immediate(ChannelEvent { dlci, events });
    }

    async fn send_frame(&self, frame: &Frame<'_>) -> Result<(), Error> {
        self.link.lock().await.send(frame).await
    }

    async fn send_control(&self, message: ControlMessage) -> Result<(), Error> {
        let bytes = message.encode();
        self.send_frame(&Frame::uih(CHANNEL_ID_CONTROL, &bytes)).await
    }

    async fn send_flow_status(&self, dlci: u8, off: bool) -> Result<(), Error> {
        self.send_control(ControlMessage::ModemStatus {
            command: true,
            dlci,
            signals: control::Signals::local(off),
        })
        .await
    }

    async fn wait_outcome(&self, target: Target) -> Result<Outcome, Error> {
        let wait = poll_fn(|cx| {
            self.with_dlc(target, |dlc| match dlc.outcome.take() {
                Some(outcome) => Poll::Ready(outcome),
                None => {
                    dlc.waker.register(cx.waker());
                    Poll::Pending
                }
            })
        });
        Ok(with_timeout(self.config.response_timeout, wait).await?)
    }

    fn with_dlc<R>(&self, target: Target, f: impl FnOnce(&mut Dlc) -> R) -> R {
        match target {
            Target::Control => self.control.lock(|c| f(&mut c.borrow_mut())),
            Target::Slot(i) => self.slots[i].lock(|s| f(&mut s.borrow_mut().dlc)),
        }
    }

    fn target(&self, dlci: u8) -> Option<Target> {
        if dlci == CHANNEL_ID_CONTROL {
            Some(Target::Control)
        } else {
            self.find_slot(dlci).map(Target::Slot)
        }
    }

    async fn decode(&self, rx: &mut Receiver<RX_BUF>) -> Result<(), Error> {
        rx.stalled = false;
        loop {
            let (consumed, result) = parser::parse(&rx.ring, None, &mut rx.scratch);
            match result {
                Ok(frame) => {
                    let delivery = self.dispatch(&frame, &mut rx.holding, &mut rx.stats).await?;
                    match delivery {
                        Delivery::Consumed => rx.ring.consume(consumed),
                        Delivery::Stalled => {
                            rx.stalled = true;
                            return Ok(());
                        }
                    }
                }
                Err(ParseError::Incomplete) | Err(ParseError::NotFound) => {
                    rx.ring.consume(consumed);
                    return Ok(());
                }
                Err(e) => {
                    rx.ring.consume(consumed);
                    rx.record(e);
                }
            }
        }
    }

    async fn dispatch(
        &self,
        frame: &Frame<'_>,
        holding: &mut Vec<u8, HOLDING_BUFFER_SIZE>,
        stats: &mut LinkStats,
    ) -> Result<Delivery, Error> {
        let dlci = frame.address;
        match frame.frame_type {
            FrameType::Ua => {
                let resolved = self
                    .target(dlci)
                    .is_some_and(|t| self.with_dlc(t, |dlc| dlc.resolve(Outcome::Accepted)));
                if !resolved {
                    debug!("[MUX] Unsolicited UA on DLCI {}", dlci);
                    stats.record(ProtocolError::UnexpectedFrame);
                }
            }
            FrameType::Dm => self.on_peer_dm(dlci),
            FrameType::Disc => {
                let connected = self
                    .target(dlci)
                    .is_some_and(|t| self.with_dlc(t, |dlc| dlc.state == ChannelState::Open));
                if connected {
                    self.send_frame(&Frame::ua(dlci)).await?;
                    self.on_peer_disconnect(dlci);
                } else {
                    debug!("[MUX] DISC for disconnected DLCI {}", dlci);
                    self.send_frame(&Frame::dm(dlci)).await?;
                }
            }
            FrameType::Sabm => {
                warn!("[MUX] Refusing peer SABM on DLCI {}", dlci);
                self.send_frame(&Frame::dm(dlci)).await?;
            }
            FrameType::Uih | FrameType::Ui if dlci == CHANNEL_ID_CONTROL => {
                self.on_control_data(frame.information, holding, stats)
                    .await?;
            }
            FrameType::Uih | FrameType::Ui => {
                return self.deliver(dlci, frame.information, stats).await;
            }
        }
        Ok(Delivery::Consumed)
    }

    fn on_peer_dm(&self, dlci: u8) {
        let Some(target) = self.target(dlci) else {
            debug!("[MUX] DM for unknown DLCI {}", dlci);
            return;
        };
        let open = self.with_dlc(target, |dlc| {
            if dlc.state == ChannelState::Null {
                dlc.resolve(Outcome::Rejected);
                false
            } else {
                dlc.wanted_response = None;
                dlc.state == ChannelState::Open
            }
        });
        if open {
            self.on_peer_disconnect(dlci);
        }
    }

    fn on_peer_disconnect(&self, dlci: u8) {
        if dlci == CHANNEL_ID_CONTROL {
            warn!("[MUX] Peer closed the multiplexer");
            self.control.lock(|c| {
                c.borrow_mut()
                    .transition(CHANNEL_ID_CONTROL, Transition::PeerDisconnect)
            });
            self.disconnect_all();
            return;
        }

        if let Some(i) = self.find_slot(dlci) {
            if self.slots[i].lock(|s| s.borrow_mut().disconnect(Transition::PeerDisconnect)) {
                info!("[MUX] Channel {} disconnected by peer", dlci);
                self.publish(dlci, Events::DISCONNECTED);
            }
        }
    }

    fn disconnect_all(&self) {
        for slot in self.slots.iter() {
            let dlci = slot.lock(|s| {
                let mut s = s.borrow_mut();
                let dlci = s.dlci?;
                s.disconnect(Transition::PeerDisconnect).then_some(dlci)
            });
            if let Some(dlci) = dlci {
                self.publish(dlci, Events::DISCONNECTED);
            }
        }
    }

    async fn deliver(
        &self,
        dlci: u8,
        information: &[u8],
        stats: &mut LinkStats,
    ) -> Result<Delivery, Error> {
        let Some(i) = self.find_slot(dlci) else {
            warn!("[MUX] Dropping {} bytes for unknown DLCI {}", information.len(), dlci);
            return Ok(Delivery::Consumed);
        };

        let discard = self.config.discard_on_overflow;
        let off_percent = self.config.rx_flow_off_percent;
        let (delivery, events, stop_peer) = self.slots[i].lock(|s| {
            let mut s = s.borrow_mut();
            if s.dlc.state != ChannelState::Open {
                debug!("[MUX] Dropping data for closed DLCI {}", dlci);
                return (Delivery::Consumed, Events::empty(), false);
            }
            if information.len() > s.traffic.rx.window() {
                if discard {
                    s.traffic.overflow_count += 1;
                    stats.overflows += 1;
                    warn!("[MUX] Channel {} overflow, dropped {} bytes", dlci, information.len());
                    return (Delivery::Consumed, Events::OVERFLOW, false);
                }
                // Make sure the peer has been told to stop before we stall.
                let stop_peer = s.traffic.should_stop_peer(0);
                return (Delivery::Stalled, Events::empty(), stop_peer);
            }

            s.traffic.rx.enqueue_slice(information);
            s.rx_waker.wake();
            let stop_peer = s.traffic.should_stop_peer(off_percent);
            (Delivery::Consumed, Events::DATA_RECEIVED, stop_peer)
        });

        if !events.is_empty() {
            self.publish(dlci, events);
        }
        if stop_peer {
            debug!("[MUX] Channel {} rx flow off", dlci);
            self.send_flow_status(dlci, true).await?;
        }
        Ok(delivery)
    }

    async fn on_control_data(
        &self,
        information: &[u8],
        holding: &mut Vec<u8, HOLDING_BUFFER_SIZE>,
        stats: &mut LinkStats,
    ) -> Result<(), Error> {
        if holding.extend_from_slice(information).is_err() {
            // A single I-field always fits, so a message is pending.
            let type_octet = holding.first().copied().unwrap_or_default();
            warn!("[MUX] Control message {:#x} exceeds holding buffer", type_octet);
            stats.record(ProtocolError::Malformed);
            holding.clear();
            if type_octet & frame::CR != 0 {
                return self
                    .send_control(ControlMessage::NotSupported {
                        command: false,
                        rejected_type: type_octet,
                    })
                    .await;
            }
            return Ok(());
        }

        loop {
            match ControlMessage::decode(holding) {
                Ok((used, message)) => {
                    let remaining = holding.len() - used;
                    holding.rotate_left(used);
                    holding.truncate(remaining);
                    self.on_control_message(message).await?;
                }
                Err(control::DecodeError::Incomplete) => return Ok(()),
                Err(control::DecodeError::Malformed) => {
                    warn!("[MUX] Malformed control message");
                    stats.record(ProtocolError::Malformed);
                    holding.clear();
                    return Ok(());
                }
            }
        }
    }

    async fn on_control_message(&self, message: ControlMessage) -> Result<(), Error> {
        match message {
            ControlMessage::ModemStatus {
                command: true,
                dlci,
                signals,
            } => {
                let off = signals.contains(control::Signals::FC);
                let changed = self.find_slot(dlci).is_some_and(|i| {
                    self.slots[i].lock(|s| {
                        let mut s = s.borrow_mut();
                        let changed = s.traffic.tx_flow_controlled_off != off;
                        s.traffic.tx_flow_controlled_off = off;
                        changed
                    })
                });
                if changed {
                    debug!("[MUX] Channel {} tx flow {}", dlci, if off { "off" } else { "on" });
                    let events = if off { Events::TX_FLOW_OFF } else { Events::TX_FLOW_ON };
                    self.publish(dlci, events);
                }
                self.send_control(ControlMessage::ModemStatus {
                    command: false,
                    dlci,
                    signals,
                })
                .await
            }
            ControlMessage::CloseDown { command: true } => {
                self.send_control(ControlMessage::CloseDown { command: false })
                    .await?;
                self.on_peer_disconnect(CHANNEL_ID_CONTROL);
                Ok(())
            }
            ControlMessage::Other {
                command: true,
                type_octet,
            } => {
                warn!("[MUX] Unsupported control message {:#x}", type_octet);
                self.send_control(ControlMessage::NotSupported {
                    command: false,
                    rejected_type: type_octet,
                })
                .await
            }
            ControlMessage::NotSupported { rejected_type, .. } => {
                warn!("[MUX] Peer does not support {:#x}", rejected_type);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
