//! Client side of a session.

use crate::actor::{spawn_session, ActorParams, SessionHandle, SessionStatus};
use crate::config::TransportConfig;
use crate::dispatch::{ChannelDispatcher, Delivery};
use crate::error::{is_transient_io, ConnectionError, Result, TransportError};
use crate::metrics::TransportMetrics;
use crate::transport::{LossyTransport, Transport, UdpTransport};

use bytes::Bytes;
use rudp_core::metrics::{Counter, MetricsSink};
use rudp_core::protocol::{Group, Opcode};
use rudp_core::session::{DisconnectReason, Session, SessionId, SessionState, SessionStats};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// A logged-in session with one listener.
pub struct Connection {
    handle: SessionHandle,
    deliveries: mpsc::Receiver<Delivery>,
    metrics: Arc<TransportMetrics>,
    local_addr: SocketAddr,
    recv_task: JoinHandle<()>,
}

impl Connection {
    /// Bind an ephemeral UDP socket and log in to `addr`.
    pub async fn connect(
        addr: SocketAddr,
        login: impl Into<Bytes>,
        config: TransportConfig,
    ) -> Result<Self> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let udp = UdpTransport::bind(bind_addr)
            .await
            .map_err(|e| TransportError::bind(bind_addr, e))?;
        let transport: Arc<dyn Transport> = match config.simulate_packet_loss {
            Some(loss_rate) => Arc::new(LossyTransport::new(udp, loss_rate)),
            None => Arc::new(udp),
        };
        Self::establish(transport, addr, login.into(), config).await
    }

    /// Log in to `addr` over a custom [`Transport`].
    pub async fn with_transport<T: Transport>(
        transport: Arc<T>,
        addr: SocketAddr,
        login: impl Into<Bytes>,
        config: TransportConfig,
    ) -> Result<Self> {
        Self::establish(transport, addr, login.into(), config).await
    }

    async fn establish(
        transport: Arc<dyn Transport>,
        addr: SocketAddr,
        login: Bytes,
        config: TransportConfig,
    ) -> Result<Self> {
        config.validate()?;
        let local_addr = transport.local_addr()?;
        let metrics = Arc::new(TransportMetrics::new());
        let (dispatcher, deliveries) = ChannelDispatcher::new(config.inbound_queue_capacity);

        let id: SessionId = rand::random();
        let sink: Arc<dyn MetricsSink> = metrics.clone();
        let session = Session::connect(
            id,
            config.core.clone(),
            sink,
            login,
            tokio::time::Instant::now().into_std(),
        );
        let connect_timeout = config.core.connect_timeout;

        let handle = spawn_session(ActorParams {
            session,
            peer: addr,
            transport: transport.clone(),
            tick_interval: config.tick_interval,
            inbound_capacity: config.inbound_queue_capacity,
            command_capacity: config.command_queue_capacity,
            dispatcher: Arc::new(dispatcher),
            authenticator: None,
            on_exit: None,
        });
        let recv_task = tokio::spawn(run_recv_loop(
            transport,
            addr,
            handle.clone(),
            metrics.clone(),
            config.recv_buffer_size,
        ));

        // The session enforces the login deadline itself; this is a backstop
        let status = match tokio::time::timeout(connect_timeout * 2, handle.wait_connected()).await
        {
            Ok(status) => status,
            Err(_) => {
                handle.close();
                recv_task.abort();
                return Err(TransportError::timeout(connect_timeout.as_millis() as u64));
            }
        };

        if status.state != SessionState::Connected {
            recv_task.abort();
            let kind = status
                .reason
                .map_or(ConnectionError::Closed, ConnectionError::from);
            debug!(peer = %addr, error = %kind, "Login failed");
            return Err(TransportError::connection(kind));
        }

        info!(session = id, peer = %addr, local = %local_addr, "Connected");
        Ok(Self {
            handle,
            deliveries,
            metrics,
            local_addr,
            recv_task,
        })
    }

    /// Queue a logical message. Lower groups take priority under backpressure.
    pub async fn send(&self, group: Group, opcode: Opcode, payload: impl Into<Bytes>) -> Result<()> {
        self.handle.send(group, opcode, payload.into()).await
    }

    /// Next message from the listener, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.handle.status().state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.handle.status().reason
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.handle.stats().await
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Disconnect, notifying the listener, and wait for the session to close.
    pub async fn close(self) -> SessionStatus {
        self.handle.close();
        let status = self.handle.wait_closed().await;
        self.recv_task.abort();
        status
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.close();
        self.recv_task.abort();
    }
}

/// Feed datagrams from `peer` to the session actor until it exits.
async fn run_recv_loop(
    transport: Arc<dyn Transport>,
    peer: SocketAddr,
    handle: SessionHandle,
    metrics: Arc<TransportMetrics>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let (size, from) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if is_transient_io(&e) => {
                trace!(error = %e, "Transient receive error");
                continue;
            }
            Err(e) => {
                error!(error = %e, "Socket receive failed");
                handle.close();
                break;
            }
        };
        if from != peer {
            trace!(from = %from, "Datagram from unexpected address ignored");
            continue;
        }

        match handle.try_input(Bytes::copy_from_slice(&buf[..size])) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics.incr(Counter::InboundQueueDropped, 1);
                trace!(session = handle.id, "Session queue full, datagram dropped");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}
