//! Listener: one receive loop per bound socket, routing datagrams to
//! per-session actors.

use crate::actor::{spawn_session, ActorParams, SessionHandle, SessionStatus};
use crate::config::TransportConfig;
use crate::dispatch::Collaborators;
use crate::error::{is_transient_io, Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::transport::{LossyTransport, Transport, UdpTransport};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rudp_core::metrics::{Counter, MetricsSink};
use rudp_core::protocol::{Group, Opcode, PacketFlags};
use rudp_core::session::{Session, SessionId, SessionStats};
use rudp_core::PacketCodec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// State shared between the listener, its receive task and session actors.
struct Shared {
    transport: Arc<dyn Transport>,
    config: TransportConfig,
    codec: PacketCodec,
    collaborators: Collaborators,
    /// Routing table, hit on every datagram
    sessions: DashMap<SocketAddr, SessionHandle>,
    /// Session id → peer, for the outbound API
    peers: DashMap<SessionId, SocketAddr>,
    next_id: AtomicU64,
}

/// Accepts logins on one socket and serves every resulting session.
pub struct Listener {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    recv_task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind a UDP socket. A bind failure is fatal and nothing is served.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let udp = UdpTransport::bind(addr)
            .await
            .map_err(|e| TransportError::bind(addr, e))?;
        let transport: Arc<dyn Transport> = match config.simulate_packet_loss {
            Some(loss_rate) => Arc::new(LossyTransport::new(udp, loss_rate)),
            None => Arc::new(udp),
        };
        Self::start(transport, config, collaborators)
    }

    /// Create a listener over a custom [`Transport`].
    pub fn with_transport<T: Transport>(
        transport: Arc<T>,
        config: TransportConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        Self::start(transport, config, collaborators)
    }

    fn start(
        transport: Arc<dyn Transport>,
        config: TransportConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;

        let shared = Arc::new(Shared {
            codec: PacketCodec::from_config(&config.core),
            transport,
            config,
            collaborators,
            sessions: DashMap::new(),
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let recv_task = tokio::spawn(run_recv_loop(shared.clone()));
        info!(addr = %local_addr, "Listener started");

        Ok(Self {
            shared,
            local_addr,
            recv_task: Some(recv_task),
        })
    }

    /// Queue a logical message for a session.
    pub async fn send(
        &self,
        session: SessionId,
        group: Group,
        opcode: Opcode,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.handle(session)?
            .send(group, opcode, payload.into())
            .await
    }

    /// Start tearing a session down; the peer is notified.
    pub fn disconnect(&self, session: SessionId) -> Result<()> {
        self.handle(session)?.close();
        Ok(())
    }

    pub async fn session_stats(&self, session: SessionId) -> Result<SessionStats> {
        self.handle(session)?.stats().await
    }

    pub fn session_status(&self, session: SessionId) -> Option<SessionStatus> {
        self.handle(session).ok().map(|handle| handle.status())
    }

    pub fn session_peer(&self, session: SessionId) -> Option<SocketAddr> {
        self.shared.peers.get(&session).map(|peer| *peer)
    }

    /// Sessions currently in the table, including ones still logging in
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.shared.collaborators.metrics
    }

    /// Stop receiving and disconnect every session.
    pub fn close(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
            for entry in self.shared.sessions.iter() {
                entry.value().close();
            }
            info!(addr = %self.local_addr, "Listener closed");
        }
    }

    fn handle(&self, session: SessionId) -> Result<SessionHandle> {
        let unknown = || TransportError::UnknownSession { id: session };
        let peer = self.session_peer(session).ok_or_else(unknown)?;
        self.shared
            .sessions
            .get(&peer)
            .filter(|handle| handle.id == session)
            .map(|handle| handle.value().clone())
            .ok_or_else(unknown)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background receive loop. Never awaits anything but the socket.
async fn run_recv_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; shared.config.recv_buffer_size];

    loop {
        let (size, peer) = match shared.transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if is_transient_io(&e) => {
                trace!(error = %e, "Transient receive error");
                continue;
            }
            Err(e) => {
                error!(error = %e, "Socket receive failed, listener stopping");
                break;
            }
        };
        let data = Bytes::copy_from_slice(&buf[..size]);

        // Known peer: hand off without waiting
        let data = match route(&shared, peer, data) {
            Some(unrouted) => unrouted,
            None => continue,
        };

        handle_unknown_peer(&shared, peer, data);
    }
}

/// Returns the datagram back if no live session owns `peer`.
fn route(shared: &Shared, peer: SocketAddr, data: Bytes) -> Option<Bytes> {
    let handle = shared.sessions.get(&peer)?;
    match handle.try_input(data) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => {
            shared
                .collaborators
                .metrics
                .incr(Counter::InboundQueueDropped, 1);
            trace!(session = handle.id, peer = %peer, "Session queue full, datagram dropped");
            None
        }
        // Actor already gone; its exit hook has not cleaned up yet
        Err(TrySendError::Closed(data)) => Some(data),
    }
}

fn handle_unknown_peer(shared: &Arc<Shared>, peer: SocketAddr, data: Bytes) {
    let metrics = &shared.collaborators.metrics;
    let packet = match shared.codec.parse(data) {
        Ok(packet) => packet,
        Err(e) => {
            let counter = if e.is_checksum_mismatch() {
                Counter::ChecksumFailures
            } else {
                Counter::MalformedPackets
            };
            metrics.incr(counter, 1);
            trace!(peer = %peer, error = %e, "Dropping invalid datagram");
            return;
        }
    };

    if packet.flags != PacketFlags::LOGIN_REQUEST {
        trace!(peer = %peer, flags = ?packet.flags, "Datagram from unknown peer ignored");
        return;
    }

    if shared.sessions.len() >= shared.config.max_sessions {
        warn!(peer = %peer, max = shared.config.max_sessions, "Session table full, login ignored");
        return;
    }

    let login = packet.control_body().cloned().unwrap_or_default();
    match shared.sessions.entry(peer) {
        Entry::Occupied(mut occupied) if occupied.get().is_closed() => {
            let handle = open_session(shared, peer, login);
            occupied.insert(handle);
        }
        Entry::Occupied(_) => {}
        Entry::Vacant(vacant) => {
            let handle = open_session(shared, peer, login);
            vacant.insert(handle);
        }
    }
}

/// Create a server session for `peer` and spawn its actor.
fn open_session(shared: &Arc<Shared>, peer: SocketAddr, login: Bytes) -> SessionHandle {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let metrics: Arc<dyn MetricsSink> = shared.collaborators.metrics.clone();
    let session = Session::accept(
        id,
        shared.config.core.clone(),
        metrics,
        login,
        tokio::time::Instant::now().into_std(),
    );
    shared.peers.insert(id, peer);
    debug!(session = id, peer = %peer, "Login request, session created");

    // Weak so a lingering actor does not keep a closed listener alive
    let table = Arc::downgrade(shared);
    let on_exit: Box<dyn FnOnce(SessionId) + Send> = Box::new(move |id| {
        if let Some(shared) = table.upgrade() {
            shared.peers.remove(&id);
            shared.sessions.remove_if(&peer, |_, handle| handle.id == id);
        }
    });

    spawn_session(ActorParams {
        session,
        peer,
        transport: shared.transport.clone(),
        tick_interval: shared.config.tick_interval,
        inbound_capacity: shared.config.inbound_queue_capacity,
        command_capacity: shared.config.command_queue_capacity,
        dispatcher: shared.collaborators.dispatcher.clone(),
        authenticator: Some(shared.collaborators.authenticator.clone()),
        on_exit: Some(on_exit),
    })
}
