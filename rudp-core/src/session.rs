//! Per-peer session state machine.
//!
//! A [`Session`] is sans-I/O: callers feed it datagrams with [`Session::input`],
//! drive timers with [`Session::update`], queue messages with
//! [`Session::send`], then collect datagrams from [`Session::drain_output`]
//! and reassembled messages from [`Session::recv`].
//!
//! ```text
//!  Connecting ──login ok──▶ Connected ──disconnect/idle/desync──▶ Disconnecting ──▶ Closed
//!       └────────────── rejected / timeout ──────────────────────────▲
//! ```

use crate::cache::RetransmitCache;
use crate::codec::PacketCodec;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, ReassemblyError};
use crate::fragmenter::Fragmenter;
use crate::metrics::{Counter, MetricsSink};
use crate::protocol::{
    constants, seq_after, seq_before, seq_distance, Fragment, Group, Opcode, Packet, PacketFlags,
    Payload, SeqNum,
};
use crate::reassembly::{FragmentOutcome, Reassembled, Reassembler};
use crate::tracker::{Admission, GapPoll, SequenceTracker};

use bytes::Bytes;
use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Listener-assigned session identifier
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by a listener from an inbound login
    Server,
    /// Created locally by connecting to a listener
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session left the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    PeerRequested,
    IdleTimeout,
    /// A sequence gap stayed open longer than allowed
    Desync,
    /// The peer kept asking for packets no longer cached
    RetransmitCacheMiss,
    LoginRejected,
    LoginTimeout,
    Local,
}

impl DisconnectReason {
    /// Locally decided teardowns notify the peer
    pub fn is_local(self) -> bool {
        !matches!(self, DisconnectReason::PeerRequested)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::PeerRequested => "peer requested",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::Desync => "sequence desync",
            DisconnectReason::RetransmitCacheMiss => "retransmit cache miss",
            DisconnectReason::LoginRejected => "login rejected",
            DisconnectReason::LoginTimeout => "login timeout",
            DisconnectReason::Local => "local close",
        };
        f.write_str(name)
    }
}

/// A reassembled message ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Logical message id assigned by the sender
    pub sequence: SeqNum,
    pub group: Group,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Counters and buffer gauges for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub checksum_failures: u64,
    pub malformed_packets: u64,
    pub duplicate_packets: u64,
    pub out_of_window_packets: u64,
    pub retransmit_requests_sent: u64,
    pub retransmits_served: u64,
    pub retransmit_cache_misses: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reassembly_evictions: u64,
    pub outbound_dropped: u64,

    pub expected_next: SeqNum,
    pub next_outbound: SeqNum,
    pub pending_packets: usize,
    pub partial_messages: usize,
    pub cached_packets: usize,
    pub queued_fragments: usize,
    pub buffered_bytes: usize,
}

impl SessionStats {
    fn record(&mut self, counter: Counter, by: u64) {
        let field = match counter {
            Counter::PacketsReceived => &mut self.packets_received,
            Counter::BytesReceived => &mut self.bytes_received,
            Counter::PacketsSent => &mut self.packets_sent,
            Counter::BytesSent => &mut self.bytes_sent,
            Counter::ChecksumFailures => &mut self.checksum_failures,
            Counter::MalformedPackets => &mut self.malformed_packets,
            Counter::DuplicatePackets => &mut self.duplicate_packets,
            Counter::OutOfWindowPackets => &mut self.out_of_window_packets,
            Counter::RetransmitRequestsSent => &mut self.retransmit_requests_sent,
            Counter::RetransmitsServed => &mut self.retransmits_served,
            Counter::RetransmitCacheMisses => &mut self.retransmit_cache_misses,
            Counter::MessagesReceived => &mut self.messages_received,
            Counter::MessagesSent => &mut self.messages_sent,
            Counter::ReassemblyEvictions => &mut self.reassembly_evictions,
            Counter::OutboundDropped => &mut self.outbound_dropped,
            Counter::InboundQueueDropped | Counter::SessionsOpened | Counter::SessionsClosed => {
                return
            }
        };
        *field += by;
    }
}

#[derive(Debug)]
struct QueuedMessage {
    id: SeqNum,
    group: Group,
    fragments: VecDeque<Fragment>,
    /// At least one fragment already went out; never dropped
    started: bool,
}

/// Reliable session with one remote peer.
pub struct Session {
    id: SessionId,
    role: Role,
    state: SessionState,
    disconnect_reason: Option<DisconnectReason>,
    config: CoreConfig,

    codec: PacketCodec,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    tracker: SequenceTracker,
    cache: RetransmitCache,

    metrics: Arc<dyn MetricsSink>,
    stats: SessionStats,

    // Outbound
    next_outbound: SeqNum,
    acked: SeqNum,
    outbound: VecDeque<QueuedMessage>,
    queued_fragments: usize,
    output: VecDeque<Bytes>,

    // Inbound
    inbox: VecDeque<LogicalMessage>,
    ack_due: bool,

    // Timers
    login: Bytes,
    opened_at: Instant,
    last_recv: Instant,
    last_send: Instant,
    last_login_sent: Instant,
    last_ack_sent: Option<Instant>,
    cache_misses: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("next_outbound", &self.next_outbound)
            .field("acked", &self.acked)
            .field("expected_next", &self.tracker.expected_next())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        id: SessionId,
        role: Role,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        login: Bytes,
        now: Instant,
    ) -> Self {
        metrics.incr(Counter::SessionsOpened, 1);
        Self {
            id,
            role,
            state: SessionState::Connecting,
            disconnect_reason: None,
            codec: PacketCodec::from_config(&config),
            fragmenter: Fragmenter::new(config.max_fragment_payload(), config.max_message_size),
            reassembler: Reassembler::new(&config),
            tracker: SequenceTracker::new(&config),
            cache: RetransmitCache::new(&config),
            metrics,
            stats: SessionStats::default(),
            next_outbound: 0,
            acked: 0,
            outbound: VecDeque::new(),
            queued_fragments: 0,
            output: VecDeque::new(),
            inbox: VecDeque::new(),
            ack_due: false,
            login,
            opened_at: now,
            last_recv: now,
            last_send: now,
            last_login_sent: now,
            last_ack_sent: None,
            cache_misses: 0,
            config,
        }
    }

    /// Server side: a login request arrived from a new peer. The session stays
    /// in `Connecting` until [`complete_login`](Self::complete_login) or
    /// [`reject_login`](Self::reject_login).
    pub fn accept(
        id: SessionId,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        login: Bytes,
        now: Instant,
    ) -> Self {
        Self::new(id, Role::Server, config, metrics, login, now)
    }

    /// Client side: queue a login request; it is retried from `update`.
    pub fn connect(
        id: SessionId,
        config: CoreConfig,
        metrics: Arc<dyn MetricsSink>,
        login: Bytes,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(id, Role::Client, config, metrics, login, now);
        session.send_login(now);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// Opaque login payload this session was created with
    pub fn login_payload(&self) -> &Bytes {
        &self.login
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Authenticator accepted the peer.
    pub fn complete_login(&mut self, now: Instant) -> CoreResult<()> {
        match (self.state, self.role) {
            (SessionState::Connecting, Role::Server) => {
                self.state = SessionState::Connected;
                self.last_recv = now;
                info!(session = self.id, "Session connected");
                self.send_control(Packet::login_accepted(self.next_outbound), now);
                Ok(())
            }
            (SessionState::Connected, _) => Ok(()),
            (SessionState::Connecting, Role::Client) => Err(CoreError::NotConnected),
            _ => Err(CoreError::Closed),
        }
    }

    /// Authenticator refused the peer.
    pub fn reject_login(&mut self, now: Instant) {
        self.begin_disconnect(DisconnectReason::LoginRejected, now);
    }

    /// Feed one raw datagram from the peer.
    ///
    /// Invalid datagrams are counted and reported but leave the session
    /// untouched.
    pub fn input(&mut self, raw: Bytes, now: Instant) -> CoreResult<()> {
        if self.state == SessionState::Closed {
            return Err(CoreError::Closed);
        }

        self.count(Counter::PacketsReceived, 1);
        self.count(Counter::BytesReceived, raw.len() as u64);

        let packet = match self.codec.parse(raw) {
            Ok(packet) => packet,
            Err(e) => {
                let counter = if e.is_checksum_mismatch() {
                    Counter::ChecksumFailures
                } else {
                    Counter::MalformedPackets
                };
                self.count(counter, 1);
                trace!(session = self.id, error = %e, "Dropping invalid datagram");
                return Err(e.into());
            }
        };

        self.handle_packet(packet, now);
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if packet.flags == PacketFlags::DISCONNECT {
            if self.state.is_open() {
                // A client still logging in reads a disconnect as a refusal
                let reason = match (self.state, self.role) {
                    (SessionState::Connecting, Role::Client) => DisconnectReason::LoginRejected,
                    _ => DisconnectReason::PeerRequested,
                };
                debug!(session = self.id, reason = %reason, "Peer requested disconnect");
                self.state = SessionState::Disconnecting;
                self.disconnect_reason = Some(reason);
                self.drop_outbound();
            }
            return;
        }

        self.last_recv = now;
        match (self.state, self.role) {
            (SessionState::Connecting, Role::Client) => {
                if packet.flags == PacketFlags::LOGIN_ACCEPTED {
                    self.state = SessionState::Connected;
                    info!(session = self.id, "Session connected");
                } else {
                    trace!(session = self.id, flags = ?packet.flags, "Ignoring packet before login");
                }
            }
            (SessionState::Connecting, Role::Server) => {
                trace!(session = self.id, flags = ?packet.flags, "Login pending, ignoring packet");
            }
            (SessionState::Connected, _) => self.handle_connected(packet, now),
            (SessionState::Disconnecting, _) | (SessionState::Closed, _) => {}
        }
    }

    fn handle_connected(&mut self, packet: Packet, now: Instant) {
        let flags = packet.flags;
        if flags == PacketFlags::FRAGMENTED {
            self.handle_data(packet, now);
        } else if flags == PacketFlags::ACK {
            if let Some(cumulative) = packet.body_u32() {
                self.handle_ack(cumulative);
            }
        } else if flags == PacketFlags::RETRANSMIT_REQUEST {
            if let Some(requested) = packet.requested_sequences() {
                self.handle_retransmit_request(&requested, now);
            }
        } else if flags == PacketFlags::KEEP_ALIVE {
            if let Some(horizon) = packet.body_u32() {
                if let Some(missing) = self.tracker.observe_horizon(horizon, now) {
                    self.request_retransmit(&missing, now);
                }
                self.ack_due = true;
            }
        } else if flags == PacketFlags::LOGIN_REQUEST && self.role == Role::Server {
            // Our acceptance was lost
            self.send_control(Packet::login_accepted(self.next_outbound), now);
        }
    }

    fn handle_data(&mut self, packet: Packet, now: Instant) {
        match self.tracker.admit(packet, now) {
            Admission::Deliver(run) => {
                self.ack_due = true;
                for packet in run {
                    if let Payload::Fragments(fragments) = packet.payload {
                        for fragment in fragments {
                            self.handle_fragment(fragment, now);
                        }
                    }
                }
            }
            Admission::Duplicate => {
                self.count(Counter::DuplicatePackets, 1);
                self.ack_due = true;
            }
            Admission::Buffered { request } => {
                if let Some(missing) = request {
                    self.request_retransmit(&missing, now);
                }
            }
            Admission::OutOfWindow => {
                self.count(Counter::OutOfWindowPackets, 1);
                trace!(session = self.id, "Packet beyond reorder window dropped");
            }
        }
    }

    fn handle_fragment(&mut self, fragment: Fragment, now: Instant) {
        match self.reassembler.on_fragment(fragment, now) {
            Ok(FragmentOutcome::Complete(message)) => self.deliver(message),
            Ok(FragmentOutcome::Incomplete) | Ok(FragmentOutcome::Duplicate) => {}
            Err(e) => {
                self.count(Counter::MalformedPackets, 1);
                debug!(session = self.id, error = %e, "Fragment rejected");
            }
        }
    }

    fn deliver(&mut self, message: Reassembled) {
        let Reassembled {
            sequence,
            group,
            data,
        } = message;

        if data.len() < constants::OPCODE_SIZE {
            self.count(Counter::MalformedPackets, 1);
            let e = ReassemblyError::MissingOpcode { sequence, group };
            debug!(session = self.id, error = %e, "Dropping message");
            return;
        }

        let opcode = u16::from_le_bytes([data[0], data[1]]);
        self.inbox.push_back(LogicalMessage {
            sequence,
            group,
            opcode,
            payload: data.slice(constants::OPCODE_SIZE..),
        });
        self.count(Counter::MessagesReceived, 1);
    }

    fn handle_ack(&mut self, cumulative: SeqNum) {
        if seq_after(cumulative, self.next_outbound) {
            trace!(session = self.id, ack = cumulative, "Ignoring ack beyond send horizon");
            return;
        }
        if seq_after(cumulative, self.acked) {
            self.acked = cumulative;
            self.cache.acknowledge(cumulative);
        }
        self.cache_misses = 0;
    }

    fn handle_retransmit_request(&mut self, requested: &[SeqNum], now: Instant) {
        for &seq in requested {
            if seq_before(seq, self.acked) {
                trace!(session = self.id, seq, "Ignoring request for acknowledged packet");
                continue;
            }
            if let Some(data) = self.cache.get(seq).cloned() {
                self.emit(data, now);
                self.count(Counter::RetransmitsServed, 1);
                continue;
            }

            self.count(Counter::RetransmitCacheMisses, 1);
            self.cache_misses += 1;
            trace!(session = self.id, seq, misses = self.cache_misses, "Retransmit cache miss");
            if self.cache_misses > self.config.max_cache_misses {
                warn!(
                    session = self.id,
                    misses = self.cache_misses,
                    "Peer keeps requesting uncached packets"
                );
                self.begin_disconnect(DisconnectReason::RetransmitCacheMiss, now);
                return;
            }
        }
        if !requested.is_empty() {
            debug!(session = self.id, count = requested.len(), "Served retransmit request");
        }
    }

    fn request_retransmit(&mut self, missing: &[SeqNum], now: Instant) {
        if missing.is_empty() {
            return;
        }
        debug!(
            session = self.id,
            first = missing[0],
            count = missing.len(),
            "Requesting retransmit"
        );
        self.send_control(Packet::retransmit_request(self.next_outbound, missing), now);
        self.count(Counter::RetransmitRequestsSent, 1);
    }

    /// Queue a logical message.
    ///
    /// When the outbound queue overflows, queued messages of the highest
    /// group number are dropped first; if that includes this message the call
    /// returns [`CoreError::Backpressure`].
    pub fn send(&mut self, group: Group, opcode: Opcode, payload: &[u8]) -> CoreResult<()> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Connecting => return Err(CoreError::NotConnected),
            SessionState::Disconnecting | SessionState::Closed => return Err(CoreError::Closed),
        }

        let id = self.fragmenter.next_message();
        let fragments = self.fragmenter.split(group, opcode, payload)?;
        self.queued_fragments += fragments.len();
        self.outbound.push_back(QueuedMessage {
            id,
            group,
            fragments: fragments.into(),
            started: false,
        });

        if self.enforce_queue_limit(id) {
            return Err(CoreError::Backpressure { group });
        }
        self.count(Counter::MessagesSent, 1);
        Ok(())
    }

    /// Returns `true` if the message `newest` was among those dropped.
    fn enforce_queue_limit(&mut self, newest: SeqNum) -> bool {
        let mut dropped_newest = false;
        while self.queued_fragments > self.config.outbound_queue_limit {
            let victim = self
                .outbound
                .iter()
                .enumerate()
                .filter(|(_, message)| !message.started)
                .max_by_key(|(position, message)| (message.group, *position))
                .map(|(position, _)| position);

            let Some(message) = victim.and_then(|position| self.outbound.remove(position)) else {
                break;
            };
            self.queued_fragments -= message.fragments.len();
            self.count(Counter::OutboundDropped, 1);
            warn!(
                session = self.id,
                group = message.group,
                fragments = message.fragments.len(),
                "Outbound queue full, dropping message"
            );
            dropped_newest |= message.id == newest;
        }
        dropped_newest
    }

    /// Pack queued fragments into data packets while the send window allows.
    ///
    /// Each packet gets its sequence number and its cache entry in the same
    /// step, so every sequence that reaches the wire can be retransmitted.
    pub fn flush(&mut self, now: Instant) {
        if self.state != SessionState::Connected {
            return;
        }

        let budget = self
            .config
            .max_packet_size
            .saturating_sub(constants::PACKET_HEADER_SIZE);
        let window = self.config.send_window as i32;

        // Unacknowledged packets must all stay cached or loss is unrecoverable
        while seq_distance(self.acked, self.next_outbound) < window
            && self.cache.has_room(self.config.max_packet_size)
        {
            let fragments = self.take_fragments(budget);
            if fragments.is_empty() {
                break;
            }

            let sequence = self.next_outbound;
            let packet = Packet::data(sequence, fragments);
            let data = match self.codec.serialize(&packet) {
                Ok(data) => data,
                Err(e) => {
                    warn!(session = self.id, error = %e, "Failed to encode data packet");
                    break;
                }
            };

            self.next_outbound = self.next_outbound.wrapping_add(1);
            self.cache.insert(sequence, data.clone(), now);
            self.emit(data, now);
        }
    }

    fn take_fragments(&mut self, budget: usize) -> Vec<Fragment> {
        let mut fragments = Vec::new();
        let mut used = 0;

        while let Some(message) = self.outbound.front_mut() {
            let Some(next) = message.fragments.front() else {
                self.outbound.pop_front();
                continue;
            };
            if used + next.wire_len() > budget {
                break;
            }
            used += next.wire_len();
            message.started = true;
            if let Some(fragment) = message.fragments.pop_front() {
                fragments.push(fragment);
                self.queued_fragments -= 1;
            }
        }
        fragments
    }

    /// Drive timers: login retries, idle and desync detection, gap
    /// re-requests, buffer expiry, acknowledgments and keep-alives.
    pub fn update(&mut self, now: Instant) {
        match self.state {
            SessionState::Closed => return,
            SessionState::Disconnecting => {
                self.shutdown();
                return;
            }
            SessionState::Connecting => {
                if now.saturating_duration_since(self.opened_at) >= self.config.connect_timeout {
                    self.begin_disconnect(DisconnectReason::LoginTimeout, now);
                } else if self.role == Role::Client
                    && now.saturating_duration_since(self.last_login_sent)
                        >= self.config.login_retry_interval
                {
                    self.send_login(now);
                }
                return;
            }
            SessionState::Connected => {}
        }

        if now.saturating_duration_since(self.last_recv) >= self.config.idle_timeout {
            self.begin_disconnect(DisconnectReason::IdleTimeout, now);
            return;
        }

        match self.tracker.poll(now) {
            GapPoll::Idle => {}
            GapPoll::Request(missing) => self.request_retransmit(&missing, now),
            GapPoll::Desync => {
                warn!(
                    session = self.id,
                    expected = self.tracker.expected_next(),
                    "Sequence gap too old"
                );
                self.begin_disconnect(DisconnectReason::Desync, now);
                return;
            }
        }

        // Partials fill in sequence order, so while a gap is open they wait
        // on it. With no gap, a stale partial means the rest never comes.
        if !self.tracker.has_gap() {
            let evicted = self.reassembler.evict_expired(now);
            if evicted > 0 {
                self.count(Counter::ReassemblyEvictions, evicted as u64);
                warn!(session = self.id, evicted, "Partial message expired");
                self.begin_disconnect(DisconnectReason::Desync, now);
                return;
            }
        }
        self.cache.expire(now);

        let ack_ready = self.last_ack_sent.map_or(true, |at| {
            now.saturating_duration_since(at) >= self.config.ack_interval
        });
        if self.ack_due && ack_ready {
            self.send_control(Packet::ack(self.next_outbound, self.tracker.expected_next()), now);
            self.ack_due = false;
            self.last_ack_sent = Some(now);
        }

        self.flush(now);

        let quiet = now.saturating_duration_since(self.last_send);
        let probe = self.acked != self.next_outbound && quiet >= self.config.retransmit_timeout;
        let heartbeat = self.config.keep_alive.is_some_and(|interval| quiet >= interval);
        if probe || heartbeat {
            self.send_control(Packet::keep_alive(self.next_outbound), now);
        }
    }

    /// Start tearing the session down. The next [`update`](Self::update)
    /// completes the transition to `Closed`.
    pub fn begin_disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        if !self.state.is_open() {
            return;
        }
        debug!(session = self.id, reason = %reason, "Session disconnecting");
        if reason.is_local() {
            self.send_control(Packet::disconnect(self.next_outbound), now);
        }
        self.state = SessionState::Disconnecting;
        self.disconnect_reason = Some(reason);
        self.drop_outbound();
    }

    /// Release every buffer and enter `Closed`. Pending output (such as a
    /// final DISCONNECT) stays drainable.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let reason = *self
            .disconnect_reason
            .get_or_insert(DisconnectReason::Local);
        self.reassembler.clear();
        self.tracker.clear();
        self.cache.clear();
        self.drop_outbound();
        self.state = SessionState::Closed;
        self.metrics.incr(Counter::SessionsClosed, 1);
        info!(session = self.id, reason = %reason, "Session closed");
    }

    /// Datagrams ready for the socket, in send order
    pub fn drain_output(&mut self) -> Drain<'_, Bytes> {
        self.output.drain(..)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Next reassembled message, in delivery order
    pub fn recv(&mut self) -> Option<LogicalMessage> {
        self.inbox.pop_front()
    }

    /// Bytes held in reassembly buffers, the retransmit cache and the
    /// outbound queue
    pub fn buffered_bytes(&self) -> usize {
        let queued: usize = self
            .outbound
            .iter()
            .flat_map(|message| message.fragments.iter())
            .map(Fragment::size)
            .sum();
        self.reassembler.buffered_bytes() + self.cache.bytes() + queued
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            expected_next: self.tracker.expected_next(),
            next_outbound: self.next_outbound,
            pending_packets: self.tracker.pending_len(),
            partial_messages: self.reassembler.in_flight(),
            cached_packets: self.cache.len(),
            queued_fragments: self.queued_fragments,
            buffered_bytes: self.buffered_bytes(),
            ..self.stats.clone()
        }
    }

    fn send_login(&mut self, now: Instant) {
        self.last_login_sent = now;
        self.send_control(Packet::login_request(self.login.clone()), now);
    }

    fn send_control(&mut self, packet: Packet, now: Instant) {
        match self.codec.serialize(&packet) {
            Ok(data) => self.emit(data, now),
            Err(e) => warn!(session = self.id, error = %e, "Failed to encode control packet"),
        }
    }

    fn emit(&mut self, data: Bytes, now: Instant) {
        self.count(Counter::PacketsSent, 1);
        self.count(Counter::BytesSent, data.len() as u64);
        self.output.push_back(data);
        self.last_send = now;
    }

    fn drop_outbound(&mut self) {
        self.outbound.clear();
        self.queued_fragments = 0;
    }

    fn count(&mut self, counter: Counter, by: u64) {
        self.stats.record(counter, by);
        self.metrics.incr(counter, by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::time::Duration;

    fn pair(config: CoreConfig) -> (Session, Session, Instant) {
        let now = Instant::now();
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let mut client = Session::connect(1, config.clone(), metrics.clone(), Bytes::from_static(b"hi"), now);
        let mut server = Session::accept(1, config, metrics, Bytes::from_static(b"hi"), now);

        for raw in client.drain_output().collect::<Vec<_>>() {
            server.input(raw, now).unwrap();
        }
        server.complete_login(now).unwrap();
        for raw in server.drain_output().collect::<Vec<_>>() {
            client.input(raw, now).unwrap();
        }
        (client, server, now)
    }

    fn pump(from: &mut Session, to: &mut Session, now: Instant) -> usize {
        let datagrams: Vec<Bytes> = from.drain_output().collect();
        let n = datagrams.len();
        for raw in datagrams {
            let _ = to.input(raw, now);
        }
        n
    }

    #[test]
    fn test_login_handshake() {
        let (client, server, _) = pair(CoreConfig::default());
        assert_eq!(client.state(), SessionState::Connected);
        assert_eq!(server.state(), SessionState::Connected);
        assert_eq!(server.login_payload(), &Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_send_before_login() {
        let now = Instant::now();
        let mut client = Session::connect(
            1,
            CoreConfig::default(),
            Arc::new(NoopMetrics),
            Bytes::new(),
            now,
        );
        assert_eq!(client.send(0, 1, b"x"), Err(CoreError::NotConnected));
    }

    #[test]
    fn test_small_messages_share_a_packet() {
        let (mut client, mut server, now) = pair(CoreConfig::default());
        for i in 0..10u16 {
            client.send(0, i, b"tick").unwrap();
        }
        client.flush(now);
        assert_eq!(pump(&mut client, &mut server, now), 1);

        let opcodes: Vec<Opcode> = std::iter::from_fn(|| server.recv()).map(|m| m.opcode).collect();
        assert_eq!(opcodes, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_ack_prunes_cache() {
        let (mut client, mut server, now) = pair(CoreConfig::default());
        client.send(1, 1, &[0u8; 5000]).unwrap();
        client.flush(now);
        pump(&mut client, &mut server, now);
        assert!(client.stats().cached_packets > 0);

        server.update(now);
        pump(&mut server, &mut client, now);
        assert_eq!(client.stats().cached_packets, 0);
    }

    #[test]
    fn test_backpressure_drops_lowest_priority() {
        let config = CoreConfig {
            outbound_queue_limit: 2,
            ..CoreConfig::default()
        };
        let (mut client, _server, _) = pair(config);

        client.send(0, 1, b"a").unwrap();
        client.send(5, 2, b"b").unwrap();
        // Group 5 is the lowest priority queued, so it gives way
        client.send(1, 3, b"c").unwrap();
        assert_eq!(client.stats().outbound_dropped, 1);
        assert_eq!(client.send(7, 4, b"d"), Err(CoreError::Backpressure { group: 7 }));
        assert_eq!(client.stats().queued_fragments, 2);
    }

    #[test]
    fn test_peer_disconnect() {
        let (mut client, mut server, now) = pair(CoreConfig::default());
        client.begin_disconnect(DisconnectReason::Local, now);
        pump(&mut client, &mut server, now);
        assert_eq!(server.state(), SessionState::Disconnecting);
        assert_eq!(server.disconnect_reason(), Some(DisconnectReason::PeerRequested));

        server.update(now + Duration::from_millis(10));
        assert!(server.is_closed());
        assert_eq!(server.send(0, 0, b"late"), Err(CoreError::Closed));
        assert_eq!(server.input(Bytes::new(), now), Err(CoreError::Closed));
    }

    #[test]
    fn test_login_rejected() {
        let now = Instant::now();
        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let mut client = Session::connect(1, CoreConfig::default(), metrics.clone(), Bytes::new(), now);
        let mut server = Session::accept(1, CoreConfig::default(), metrics, Bytes::new(), now);
        pump(&mut client, &mut server, now);

        server.reject_login(now);
        assert_eq!(server.disconnect_reason(), Some(DisconnectReason::LoginRejected));
        pump(&mut server, &mut client, now);
        assert_eq!(client.state(), SessionState::Disconnecting);
        assert_eq!(client.disconnect_reason(), Some(DisconnectReason::LoginRejected));
    }

    #[test]
    fn test_login_timeout() {
        let config = CoreConfig::default();
        let now = Instant::now();
        let mut client = Session::connect(1, config, Arc::new(NoopMetrics), Bytes::new(), now);
        client.drain_output().for_each(drop);

        client.update(now + Duration::from_millis(600));
        assert_eq!(client.drain_output().count(), 1);

        client.update(now + Duration::from_secs(10));
        assert_eq!(client.disconnect_reason(), Some(DisconnectReason::LoginTimeout));
        client.update(now + Duration::from_secs(11));
        assert!(client.is_closed());
    }

    #[test]
    fn test_flush_with_undersized_packets() {
        let (mut client, _server, now) = pair(CoreConfig::default());
        client.config.max_packet_size = 8;
        client.send(0, 1, b"x").unwrap();
        client.flush(now);
        assert_eq!(client.drain_output().count(), 0);
        assert_eq!(client.stats().next_outbound, 0);
    }
}
