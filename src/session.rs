//! The per-peer protocol state machine: sequencing, acknowledgement, retransmission and
//! lifecycle for one remote endpoint.
//!
//! All mutable state lives in `SessionInner` behind a `tokio::sync::Mutex`; handlers run to
//! completion under the lock. The four timer families (per-slot retransmission, cumulative
//! ack, null segment, transfer state) are spawned tasks holding a `Weak` reference to the
//! state - an expired timer on a dead session upgrades to nothing and exits.
//!
//! Completion callbacks are never invoked while the lock is held. Handlers collect them in a
//! deferred list which the public wrappers drain after releasing the lock, so a callback that
//! re-enters the session API cannot deadlock.

use crate::buffer_pool::BufferPool;
use crate::codec;
use crate::config::SessionConfig;
use crate::error::RudpError;
use crate::segment::{self, ReceivedSegment, SegmentFlags};
use crate::send_pipeline::SendPipeline;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

pub const RING_SIZE: usize = 256;

/// Outcome callback for one outgoing segment. Fires at most once: with `true` when the
/// segment is acknowledged, with `false` when the session closes underneath it or it is
/// displaced by a new SYN.
pub type SendCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Hook invoked (with the peer address and the session's own connection identifier) when the
/// session reaches `Closed` and tears down.
pub type OnClosed = Box<dyn Fn(SocketAddr, u32) + Send + Sync + 'static>;

/// Additional teardown hook, attachable after the session already exists (see
/// [`Session::register_close_hook`]).
pub type CloseHook = Box<dyn Fn() + Send + Sync + 'static>;

pub fn noop_callback() -> SendCallback {
    Box::new(|_| {})
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Opened,
    Broken,
    Closed,
}

struct OutstandingSegment {
    /// The fully stamped datagram as it went over the wire; retransmissions repeat it
    /// verbatim.
    datagram: BytesMut,
    /// `None` once consumed (SYN completions fire on first transmission).
    completion: Option<SendCallback>,
}

#[derive(Default)]
struct RetransmissionSlot {
    timer: Option<JoinHandle<()>>,
    attempts: usize,
}

struct SessionInner {
    self_config: SessionConfig,
    remote_config: SessionConfig,
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    buffer_pool: Arc<BufferPool>,

    /// Slot `s` may only hold the segment whose sequence number is `s`. The slot at
    /// `receive_head` is always empty; it marks the gap.
    receive_buffer: Box<[Option<BytesMut>; RING_SIZE]>,
    /// Next sequence number expected in order.
    receive_head: u8,

    send_buffer: Box<[Option<OutstandingSegment>; RING_SIZE]>,
    /// Next sequence number to assign to an outgoing segment.
    send_head: u8,
    /// Lowest sequence number not yet acknowledged by the peer; `[acknowledge_head,
    /// send_head)` is the outstanding window.
    acknowledge_head: u8,

    out_of_sequence_count: usize,
    unacknowledged_packet_count: usize,
    cumulative_ack_count: usize,
    /// Outgoing segments deferred because the send window was full.
    pending: VecDeque<(BytesMut, SendCallback)>,

    cumulative_ack_timer: Option<JoinHandle<()>>,
    null_segment_timer: Option<JoinHandle<()>>,
    transfer_state_timer: Option<JoinHandle<()>>,
    retransmission_timers: Box<[RetransmissionSlot; RING_SIZE]>,

    state: SessionState,
    /// Whether this endpoint initiated the connection; affects the null-segment timer.
    client: bool,
    torn_down: bool,

    /// Completions collected during the current handler, fired by the wrapper after the lock
    /// is released.
    deferred: Vec<(SendCallback, bool)>,
    weak_self: Weak<Mutex<SessionInner>>,
    on_closed: OnClosed,
    /// Hooks attached after creation; run once, after `on_closed`.
    close_hooks: Vec<CloseHook>,
}

impl SessionInner {
    async fn receive(
        &mut self,
        mut incoming: BytesMut,
        out: &mut Vec<ReceivedSegment>,
    ) -> Result<(), RudpError> {
        if incoming.len() < 2 {
            return Err(RudpError::InvalidPacket);
        }
        let flags = SegmentFlags::from_byte(incoming[0]);
        if !flags.is_well_formed() {
            return Err(RudpError::InvalidPacket);
        }
        let header_len = incoming[segment::OFFS_HEADER_LEN] as usize;
        if header_len > incoming.len() || header_len < 4 {
            return Err(RudpError::InvalidPacket);
        }

        let expected_sum = codec::read_u16_be(&incoming, header_len - 2);
        codec::write_u16_be(&mut incoming, header_len - 2, 0);
        let checked_len = if flags.chk { incoming.len() } else { header_len };
        if expected_sum != codec::checksum(&incoming[..checked_len]) {
            return Err(RudpError::InvalidPacket);
        }

        let sequence_number = incoming[segment::OFFS_SEQUENCE_NUMBER];
        let peer_ack_number = incoming[segment::OFFS_ACK_NUMBER];
        if flags.ack && !self.is_valid_sequence_number(peer_ack_number) {
            return Err(RudpError::InvalidPacket);
        }
        let has_payload = header_len != incoming.len();

        if flags.syn {
            if !self.client && self.state != SessionState::Initial {
                return Err(RudpError::InvalidPacket);
            }
            if header_len <= segment::OFFS_VARIANT + 2 {
                return Err(RudpError::InvalidPacket);
            }
            self.receive_buffer.fill_with(|| None);
            self.receive_head = sequence_number;
            self.remote_config =
                SessionConfig::parse(&incoming[segment::OFFS_VARIANT..header_len - 2])?;
            // both ends settle on the pointwise minima
            self.self_config &= self.remote_config;
            self.remote_config &= self.self_config;
            self.state = SessionState::Opened;
            debug!(
                "session with {:?} opened, negotiated config {:?}",
                self.peer_addr, self.self_config
            );
        }

        if flags.tcs {
            let adjust = if header_len > 6 { incoming[segment::OFFS_VARIANT] } else { 0 };
            if adjust != 0 {
                debug!(
                    "transfer state from {:?}: rotating receive ring by {}",
                    self.peer_addr, adjust
                );
                self.receive_head = sequence_number;
                let mut rotated: Box<[Option<BytesMut>; RING_SIZE]> =
                    Box::new(std::array::from_fn(|_| None));
                for (slot, data) in self.receive_buffer.iter_mut().enumerate() {
                    if let Some(data) = data.take() {
                        rotated[(slot + usize::from(adjust)) % RING_SIZE] = Some(data);
                    }
                }
                self.receive_buffer = rotated;
            }
            if self.state == SessionState::Broken {
                // the peer recovered before the transfer-state timeout hit
                if let Some(timer) = self.transfer_state_timer.take() {
                    timer.abort();
                }
                self.state = SessionState::Opened;
            }
        }

        if self.receive_buffer[sequence_number as usize].is_some() {
            trace!(
                "dropping duplicate segment #{} from {:?}",
                sequence_number,
                self.peer_addr
            );
            self.buffer_pool.return_to_pool(incoming);
            return Ok(());
        }

        let eak_list = if flags.eak && header_len > 6 {
            Some(incoming[segment::OFFS_VARIANT..header_len - 2].to_vec())
        } else {
            None
        };

        self.receive_buffer[sequence_number as usize] = Some(incoming);
        self.update_receive_head(out);

        if flags.ack {
            self.update_ack(peer_ack_number);
        }
        if flags.syn && !flags.ack {
            let reply = segment::syn(&self.self_config, true);
            self.send(reply, false, noop_callback()).await?;
        } else if flags.syn && flags.ack {
            self.send(segment::ack(), false, noop_callback()).await?;
        }
        if has_payload || flags.tcs {
            self.increment_cumulative_ack_counter().await?;
        }
        if let Some(listed) = eak_list {
            self.update_eak(&listed);
            if let Some(&last) = listed.last() {
                let begin = self.acknowledge_head;
                self.resend(begin, last).await;
            }
        }
        if flags.nul {
            self.send(segment::ack(), false, noop_callback()).await?;
        }
        if self.out_of_sequence_count >= usize::from(self.self_config.max_out_of_seq) {
            let eak = self.generate_eak();
            self.send(eak, false, noop_callback()).await?;
        }
        while self.ready_to_send() && !self.pending.is_empty() {
            let (datagram, cb) = self.pending.pop_front().expect("checked non-empty");
            self.send(datagram, true, cb).await?;
        }
        Ok(())
    }

    /// Stamp and transmit one segment, or queue it while the send window is full.
    /// `is_resend` marks segments re-submitted from the pending queue; they bypass the
    /// opened-state gate.
    async fn send(
        &mut self,
        mut datagram: BytesMut,
        is_resend: bool,
        cb: SendCallback,
    ) -> Result<(), RudpError> {
        if datagram.len() < 2 {
            self.deferred.push((cb, false));
            return Ok(());
        }
        let flags = SegmentFlags::from_byte(datagram[0]);
        if !is_resend && self.state != SessionState::Opened && !flags.syn && !flags.tcs {
            self.deferred.push((cb, false));
            return Ok(());
        }
        if !self.ready_to_send() {
            trace!("send window towards {:?} is full: queueing segment", self.peer_addr);
            self.pending.push_back((datagram, cb));
            return Ok(());
        }
        if !flags.is_well_formed() {
            return Err(RudpError::InvalidPacket);
        }
        let header_len = datagram[segment::OFFS_HEADER_LEN] as usize;
        if header_len > datagram.len() || header_len < 4 {
            return Err(RudpError::InvalidPacket);
        }
        let has_payload = header_len != datagram.len();

        if flags.syn {
            // a fresh SYN displaces whatever was outstanding; displaced sends fail
            for slot in self.send_buffer.iter_mut() {
                if let Some(outstanding) = slot.take() {
                    if let Some(completion) = outstanding.completion {
                        self.deferred.push((completion, false));
                    }
                }
            }
            self.unacknowledged_packet_count = 0;
            self.send_head = rand::random();
            self.acknowledge_head = self.send_head;
            self.state = SessionState::Opened;
        }
        if flags.rst {
            self.state = SessionState::Closed;
        }

        let sequence_number = self.send_head;
        self.send_head = self.send_head.wrapping_add(1);

        if has_payload {
            datagram[0] |= segment::FLAG_CHK;
        } else {
            datagram[0] &= !segment::FLAG_CHK;
        }
        datagram[segment::OFFS_SEQUENCE_NUMBER] = sequence_number;
        if flags.ack {
            datagram[segment::OFFS_ACK_NUMBER] = self.receive_head.wrapping_sub(1);
        }
        codec::write_u16_be(&mut datagram, header_len - 2, 0);
        let sum = codec::checksum(&datagram);
        codec::write_u16_be(&mut datagram, header_len - 2, sum);

        trace!(
            "sending segment #{} ({} bytes) to {:?}",
            sequence_number,
            datagram.len(),
            self.peer_addr
        );
        self.send_pipeline.do_send_packet(self.peer_addr, &datagram).await;

        let completion = if flags.syn {
            // a SYN's completion fires on first transmission, not on acknowledgement
            self.deferred.push((cb, true));
            None
        } else {
            Some(cb)
        };
        self.send_buffer[sequence_number as usize] =
            Some(OutstandingSegment { datagram, completion });
        self.unacknowledged_packet_count += 1;

        self.reset_cumulative_ack_counter();
        self.set_null_segment_timer();
        if has_payload || flags.nul || flags.rst {
            self.set_retransmission_timer(sequence_number);
        }
        Ok(())
    }

    /// Retransmit every occupied slot in `[begin, end)` verbatim.
    async fn resend(&mut self, begin: u8, end: u8) {
        let mut seq = begin;
        while seq != end {
            if let Some(outstanding) = &self.send_buffer[seq as usize] {
                trace!("retransmitting segment #{} to {:?}", seq, self.peer_addr);
                self.send_pipeline
                    .do_send_packet(self.peer_addr, &outstanding.datagram)
                    .await;
            }
            seq = seq.wrapping_add(1);
        }
    }

    /// Walk forward from `receive_head` through contiguously filled slots, handing every
    /// segment that carries payload to the caller, and advance the head to the first gap.
    fn update_receive_head(&mut self, out: &mut Vec<ReceivedSegment>) {
        let old_head = self.receive_head;
        for _ in 0..RING_SIZE {
            match self.receive_buffer[self.receive_head as usize].take() {
                Some(data) => {
                    let segment = ReceivedSegment::new(data);
                    if segment.has_payload() {
                        out.push(segment);
                    } else {
                        self.buffer_pool.return_to_pool(segment.into_inner());
                    }
                    self.receive_head = self.receive_head.wrapping_add(1);
                }
                None => break,
            }
        }
        if self.receive_head == old_head {
            self.out_of_sequence_count += 1;
        } else {
            self.out_of_sequence_count = 0;
        }
    }

    /// Process a cumulative acknowledgement: free every slot in `[acknowledge_head,
    /// peer_ack_number]` and advance the head past it. An acknowledgement of
    /// `acknowledge_head - 1` repeats what we already know and is a no-op.
    fn update_ack(&mut self, peer_ack_number: u8) {
        if peer_ack_number == self.acknowledge_head.wrapping_sub(1) {
            return;
        }
        if !self.is_valid_sequence_number(peer_ack_number) {
            return;
        }
        let end = peer_ack_number.wrapping_add(1);
        let mut acknowledged = 0usize;
        let mut seq = self.acknowledge_head;
        while seq != end {
            if let Some(outstanding) = self.send_buffer[seq as usize].take() {
                acknowledged += 1;
                if let Some(completion) = outstanding.completion {
                    self.deferred.push((completion, true));
                }
            }
            self.clear_retransmission_timer(seq);
            seq = seq.wrapping_add(1);
        }
        self.unacknowledged_packet_count -= acknowledged;
        self.acknowledge_head = end;
        trace!(
            "peer acknowledged through #{}, {} segments still waiting",
            peer_ack_number,
            self.waiting_for_acknowledge_count()
        );
    }

    /// Process the slot list of an extended acknowledgement: free each listed outstanding
    /// slot individually, without moving `acknowledge_head`.
    fn update_eak(&mut self, listed: &[u8]) {
        for &seq in listed {
            if self.is_valid_sequence_number(seq) {
                if let Some(outstanding) = self.send_buffer[seq as usize].take() {
                    if let Some(completion) = outstanding.completion {
                        self.deferred.push((completion, true));
                    }
                    self.unacknowledged_packet_count -= 1;
                    self.clear_retransmission_timer(seq);
                }
            }
        }
    }

    /// Build an extended acknowledgement listing every occupied receive slot in ring order
    /// from `receive_head`. Producing it answers the out-of-sequence pressure, so the counter
    /// resets here.
    fn generate_eak(&mut self) -> BytesMut {
        let mut slots = Vec::with_capacity(self.out_of_sequence_acknowledge_count());
        let mut slot = self.receive_head;
        loop {
            if self.receive_buffer[slot as usize].is_some() {
                slots.push(slot);
            }
            slot = slot.wrapping_add(1);
            if slot == self.receive_head {
                break;
            }
        }
        self.out_of_sequence_count = 0;
        segment::eak(&slots)
    }

    /// Number of receive slots occupied ahead of the gap.
    fn out_of_sequence_acknowledge_count(&self) -> usize {
        self.receive_buffer.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of outgoing segments still waiting for an acknowledgement.
    fn waiting_for_acknowledge_count(&self) -> usize {
        self.send_buffer.iter().filter(|slot| slot.is_some()).count()
    }

    /// A sequence number the peer may legitimately acknowledge: the one just below the
    /// window, or anything inside `[acknowledge_head, send_head)` in wraparound arithmetic.
    fn is_valid_sequence_number(&self, sequence_number: u8) -> bool {
        if sequence_number == self.acknowledge_head.wrapping_sub(1) {
            return true;
        }
        if self.acknowledge_head < self.send_head {
            self.acknowledge_head <= sequence_number && sequence_number < self.send_head
        } else if self.send_head < self.acknowledge_head {
            sequence_number < self.send_head || self.acknowledge_head <= sequence_number
        } else {
            false
        }
    }

    /// Negation of window-full: the next sequence number must not close the ring onto
    /// `acknowledge_head`, and the peer's outstanding-segment limit must leave room.
    fn ready_to_send(&self) -> bool {
        self.send_head.wrapping_add(1) != self.acknowledge_head
            && self.unacknowledged_packet_count
                <= usize::from(self.remote_config.max_out_of_standing_segs)
    }

    async fn increment_cumulative_ack_counter(&mut self) -> Result<(), RudpError> {
        self.cumulative_ack_count += 1;
        if self.cumulative_ack_count == 1 {
            if let Some(timer) = self.cumulative_ack_timer.take() {
                timer.abort();
            }
            let timeout = self.self_config.cumulative_ack_timeout();
            let weak = self.weak_self.clone();
            self.cumulative_ack_timer = Some(tokio::spawn(async move {
                time::sleep(timeout).await;
                let Some(inner_arc) = weak.upgrade() else { return };
                let deferred = {
                    let mut inner = inner_arc.lock().await;
                    inner.cumulative_ack_timer = None;
                    inner.cumulative_ack_count = 0;
                    if let Err(e) = inner.send(segment::ack(), false, noop_callback()).await {
                        warn!("failed to emit delayed cumulative ack: {}", e);
                    }
                    inner.take_deferred()
                };
                for (cb, success) in deferred {
                    cb(success);
                }
            }));
        } else if self.cumulative_ack_count > usize::from(self.self_config.max_cum_ack) {
            if let Some(timer) = self.cumulative_ack_timer.take() {
                timer.abort();
            }
            self.cumulative_ack_count = 0;
            self.send(segment::ack(), false, noop_callback()).await?;
        }
        Ok(())
    }

    /// Any outgoing segment piggybacks the delayed acknowledgement.
    fn reset_cumulative_ack_counter(&mut self) {
        if let Some(timer) = self.cumulative_ack_timer.take() {
            timer.abort();
        }
        self.cumulative_ack_count = 0;
    }

    /// (Re)armed after every successful send. A client that stays silent for the timeout
    /// emits a keep-alive; a server whose peer went silent for twice the timeout enters
    /// `Broken` and waits for transfer-state recovery.
    fn set_null_segment_timer(&mut self) {
        if let Some(timer) = self.null_segment_timer.take() {
            timer.abort();
        }
        let factor = if self.client { 1 } else { 2 };
        let timeout = self.self_config.null_segment_timeout() * factor;
        let weak = self.weak_self.clone();
        self.null_segment_timer = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            let Some(inner_arc) = weak.upgrade() else { return };
            let deferred = {
                let mut inner = inner_arc.lock().await;
                inner.null_segment_timer = None;
                inner.on_null_segment_timeout().await;
                inner.take_deferred()
            };
            for (cb, success) in deferred {
                cb(success);
            }
        }));
    }

    async fn on_null_segment_timeout(&mut self) {
        if self.client {
            if self.state == SessionState::Opened {
                trace!("connection to {:?} idle: sending keep-alive", self.peer_addr);
                if let Err(e) = self.send(segment::nul(), false, noop_callback()).await {
                    warn!("failed to send keep-alive: {}", e);
                }
            }
        } else {
            self.await_transfer_state();
        }
    }

    fn await_transfer_state(&mut self) {
        debug!(
            "peer {:?} went silent: awaiting transfer state recovery",
            self.peer_addr
        );
        self.state = SessionState::Broken;
        if let Some(timer) = self.transfer_state_timer.take() {
            timer.abort();
        }
        let timeout = self.self_config.transfer_state_timeout();
        let weak = self.weak_self.clone();
        self.transfer_state_timer = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            let Some(inner_arc) = weak.upgrade() else { return };
            let deferred = {
                let mut inner = inner_arc.lock().await;
                inner.transfer_state_timer = None;
                inner.close();
                inner.take_deferred()
            };
            for (cb, success) in deferred {
                cb(success);
            }
        }));
    }

    fn set_retransmission_timer(&mut self, at: u8) {
        let timeout = self.self_config.retransmission_timeout();
        let weak = self.weak_self.clone();
        let slot = &mut self.retransmission_timers[at as usize];
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.timer = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            let Some(inner_arc) = weak.upgrade() else { return };
            let deferred = {
                let mut inner = inner_arc.lock().await;
                inner.on_retransmission_timeout(at).await;
                inner.take_deferred()
            };
            for (cb, success) in deferred {
                cb(success);
            }
        }));
    }

    /// A never-acknowledged segment hits the wire `max_retrans + 1` times in total before
    /// the session gives up.
    async fn on_retransmission_timeout(&mut self, at: u8) {
        self.retransmission_timers[at as usize].timer = None;
        self.retransmission_timers[at as usize].attempts += 1;
        if self.retransmission_timers[at as usize].attempts
            > usize::from(self.self_config.max_retrans)
        {
            debug!(
                "segment #{} to {:?} exceeded {} retransmissions: giving up",
                at, self.peer_addr, self.self_config.max_retrans
            );
            self.close();
        } else {
            self.resend(at, at.wrapping_add(1)).await;
            self.set_retransmission_timer(at);
        }
    }

    fn clear_retransmission_timer(&mut self, at: u8) {
        let slot = &mut self.retransmission_timers[at as usize];
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.attempts = 0;
    }

    fn cancel_all_timers(&mut self) {
        if let Some(timer) = self.cumulative_ack_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.null_segment_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.transfer_state_timer.take() {
            timer.abort();
        }
        for seq in 0..RING_SIZE {
            self.clear_retransmission_timer(seq as u8);
        }
    }

    /// Tear the session down: cancel every timer, fail every outstanding and pending send,
    /// and notify the owner. Idempotent.
    fn close(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.state = SessionState::Closed;
        self.cancel_all_timers();
        for slot in self.send_buffer.iter_mut() {
            if let Some(outstanding) = slot.take() {
                if let Some(completion) = outstanding.completion {
                    self.deferred.push((completion, false));
                }
            }
        }
        self.unacknowledged_packet_count = 0;
        while let Some((_, cb)) = self.pending.pop_front() {
            self.deferred.push((cb, false));
        }
        debug!("session with {:?} closed", self.peer_addr);
        (self.on_closed)(self.peer_addr, self.self_config.connection_identifier);
        for hook in std::mem::take(&mut self.close_hooks) {
            hook();
        }
    }

    fn take_deferred(&mut self) -> Vec<(SendCallback, bool)> {
        std::mem::take(&mut self.deferred)
    }
}

/// One reliable session with a single peer, multiplexed over the owning endpoint's shared
/// socket.
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
    connection_id: u32,
    peer_addr: SocketAddr,
}

impl Session {
    pub fn new(
        send_pipeline: Arc<SendPipeline>,
        buffer_pool: Arc<BufferPool>,
        peer_addr: SocketAddr,
        on_closed: OnClosed,
    ) -> Session {
        let self_config = SessionConfig::new();
        let connection_id = self_config.connection_identifier;
        let inner = Arc::new_cyclic(|weak: &Weak<Mutex<SessionInner>>| {
            Mutex::new(SessionInner {
                self_config,
                remote_config: SessionConfig::new(),
                peer_addr,
                send_pipeline,
                buffer_pool,
                receive_buffer: Box::new(std::array::from_fn(|_| None)),
                receive_head: 0,
                send_buffer: Box::new(std::array::from_fn(|_| None)),
                send_head: 0,
                acknowledge_head: 0,
                out_of_sequence_count: 0,
                unacknowledged_packet_count: 0,
                cumulative_ack_count: 0,
                pending: VecDeque::new(),
                cumulative_ack_timer: None,
                null_segment_timer: None,
                transfer_state_timer: None,
                retransmission_timers: Box::new(std::array::from_fn(|_| {
                    RetransmissionSlot::default()
                })),
                state: SessionState::Initial,
                client: false,
                torn_down: false,
                deferred: Vec::new(),
                weak_self: weak.clone(),
                on_closed,
                close_hooks: Vec::new(),
            })
        });
        Session {
            inner,
            connection_id,
            peer_addr,
        }
    }

    /// The session's own connection identifier, fixed at construction.
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn get_self_config(&self) -> SessionConfig {
        self.inner.lock().await.self_config
    }

    pub async fn get_remote_config(&self) -> SessionConfig {
        self.inner.lock().await.remote_config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Client side only: mark this endpoint as the initiator and open the conversation with
    /// a SYN carrying the local configuration proposal. `cb` fires when the SYN is first
    /// transmitted.
    pub async fn connect(&self, cb: impl FnOnce(bool, u32) + Send + 'static) {
        let connection_id = self.connection_id;
        let deferred = {
            let mut inner = self.inner.lock().await;
            inner.client = true;
            let syn = segment::syn(&inner.self_config, false);
            let completion: SendCallback = Box::new(move |success| cb(success, connection_id));
            if let Err(e) = inner.send(syn, false, completion).await {
                warn!("failed to send SYN: {}", e);
            }
            inner.take_deferred()
        };
        for (cb, success) in deferred {
            cb(success);
        }
    }

    /// Attach an additional hook to run when the session closes - for owners that acquire an
    /// interest in an already-existing session. A hook registered after the session closed
    /// runs immediately.
    pub async fn register_close_hook(&self, hook: CloseHook) {
        let run_now = {
            let mut inner = self.inner.lock().await;
            if inner.torn_down {
                Some(hook)
            } else {
                inner.close_hooks.push(hook);
                None
            }
        };
        if let Some(hook) = run_now {
            hook();
        }
    }

    /// Process one datagram received for this session. In-order application payloads are
    /// appended to `out`.
    pub async fn receive(
        &self,
        datagram: BytesMut,
        out: &mut Vec<ReceivedSegment>,
    ) -> Result<(), RudpError> {
        let (result, deferred) = {
            let mut inner = self.inner.lock().await;
            let result = inner.receive(datagram, out).await;
            (result, inner.take_deferred())
        };
        for (cb, success) in deferred {
            cb(success);
        }
        result
    }

    /// Frame `payload` as an acknowledging data segment and submit it.
    pub async fn send(&self, payload: &[u8], cb: SendCallback) {
        self.send_segment(segment::data(payload), false, cb).await;
    }

    /// Submit an already-framed segment. Used internally and by tests; applications go
    /// through [`Session::send`].
    pub async fn send_segment(&self, datagram: BytesMut, is_resend: bool, cb: SendCallback) {
        let deferred = {
            let mut inner = self.inner.lock().await;
            if let Err(e) = inner.send(datagram, is_resend, cb).await {
                warn!("dropping malformed outgoing segment: {}", e);
            }
            inner.take_deferred()
        };
        for (cb, success) in deferred {
            cb(success);
        }
    }

    /// Orderly teardown: send a RST; when its completion fires (acknowledged or given up),
    /// close the session.
    pub async fn disconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        let completion: SendCallback = Box::new(move |_| {
            if let Some(inner_arc) = weak.upgrade() {
                tokio::spawn(async move {
                    let deferred = {
                        let mut inner = inner_arc.lock().await;
                        inner.close();
                        inner.take_deferred()
                    };
                    for (cb, success) in deferred {
                        cb(success);
                    }
                });
            }
        });
        self.send_segment(segment::rst(), false, completion).await;
    }
}
