//! Session actor: owns one core `Session` in a dedicated task and talks to
//! the rest of the transport through channels. No locks on the hot path.

use crate::dispatch::{AuthDecision, Authenticator, Delivery, Dispatcher};
use crate::error::{is_transient_io, ConnectionError, Result, TransportError};
use crate::transport::Transport;

use bytes::Bytes;
use rudp_core::protocol::{Group, Opcode};
use rudp_core::session::{DisconnectReason, Session, SessionId, SessionState, SessionStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Commands sent to the session actor.
pub(crate) enum SessionCmd {
    Send {
        group: Group,
        opcode: Opcode,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Lifecycle state published by a session actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reason: Option<DisconnectReason>,
}

impl SessionStatus {
    fn of(session: &Session) -> Self {
        Self {
            state: session.state(),
            reason: session.disconnect_reason(),
        }
    }
}

/// Clonable handle to a session actor.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub peer: SocketAddr,
    cmd_tx: mpsc::Sender<SessionCmd>,
    input_tx: mpsc::Sender<Bytes>,
    status_rx: watch::Receiver<SessionStatus>,
    /// Holds a permit until the actor sees it, however busy its queues are
    close: Arc<Notify>,
}

impl SessionHandle {
    /// Send a command and wait for the reply. Returns a connection-closed error
    /// if the actor has exited.
    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> SessionCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(reply))
            .await
            .map_err(|_| TransportError::connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| TransportError::connection(ConnectionError::Closed))
    }

    pub async fn send(&self, group: Group, opcode: Opcode, payload: Bytes) -> Result<()> {
        self.request(|reply| SessionCmd::Send {
            group,
            opcode,
            payload,
            reply,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(|reply| SessionCmd::Stats { reply }).await
    }

    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Hand a raw datagram to the actor without waiting.
    pub fn try_input(&self, datagram: Bytes) -> std::result::Result<(), TrySendError<Bytes>> {
        self.input_tx.try_send(datagram)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.input_tx.is_closed()
    }

    /// Wait until the session leaves `Connecting`.
    pub async fn wait_connected(&self) -> SessionStatus {
        let mut status_rx = self.status_rx.clone();
        let result = status_rx
            .wait_for(|status| status.state != SessionState::Connecting)
            .await
            .map(|status| *status);
        match result {
            Ok(status) => status,
            Err(_) => *status_rx.borrow(),
        }
    }

    /// Wait until the actor has released the session.
    pub async fn wait_closed(&self) -> SessionStatus {
        let mut status_rx = self.status_rx.clone();
        // The sender is dropped when the actor exits
        while status_rx.changed().await.is_ok() {}
        let status = *status_rx.borrow();
        status
    }
}

/// Everything a session actor needs to run.
pub(crate) struct ActorParams {
    pub session: Session,
    pub peer: SocketAddr,
    pub transport: Arc<dyn Transport>,
    pub tick_interval: Duration,
    pub inbound_capacity: usize,
    pub command_capacity: usize,
    pub dispatcher: Arc<dyn Dispatcher>,
    /// Present for server sessions awaiting login approval
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub on_exit: Option<Box<dyn FnOnce(SessionId) + Send>>,
}

/// Spawn the actor and return its handle.
pub(crate) fn spawn_session(params: ActorParams) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(params.command_capacity.max(1));
    let (input_tx, input_rx) = mpsc::channel(params.inbound_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(SessionStatus::of(&params.session));
    let close = Arc::new(Notify::new());

    let handle = SessionHandle {
        id: params.session.id(),
        peer: params.peer,
        cmd_tx,
        input_tx,
        status_rx,
        close: close.clone(),
    };
    tokio::spawn(run_session_actor(params, cmd_rx, input_rx, status_tx, close));
    handle
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Run the session actor loop.
///
/// - `input_rx`: raw datagrams routed by the listener (server) or the
///   socket receive task (client).
/// - completed messages go to the dispatcher in delivery order.
async fn run_session_actor(
    params: ActorParams,
    mut cmd_rx: mpsc::Receiver<SessionCmd>,
    mut input_rx: mpsc::Receiver<Bytes>,
    status_tx: watch::Sender<SessionStatus>,
    close: Arc<Notify>,
) {
    let ActorParams {
        mut session,
        peer,
        transport,
        tick_interval,
        dispatcher,
        authenticator,
        on_exit,
        ..
    } = params;
    let id = session.id();

    // Initial flush: a client's first login request, or nothing
    flush_output(&mut session, &transport, peer).await;

    if let Some(authenticator) = authenticator {
        authenticate(&mut session, authenticator.as_ref(), peer).await;
        flush_output(&mut session, &transport, peer).await;
        publish_status(&session, &status_tx);
    }

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !session.is_closed() {
        tokio::select! {
            biased;

            _ = close.notified() => {
                session.begin_disconnect(DisconnectReason::Local, now());
                flush_output(&mut session, &transport, peer).await;
                session.shutdown();
            }

            // Timers before traffic to avoid starvation under load
            _ = interval.tick() => {
                session.update(now());
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCmd::Send { group, opcode, payload, reply }) => {
                        let result = session
                            .send(group, opcode, &payload)
                            .map_err(TransportError::from);
                        session.flush(now());
                        let _ = reply.send(result);
                    }
                    Some(SessionCmd::Stats { reply }) => {
                        let _ = reply.send(session.stats());
                    }
                    None => {
                        session.begin_disconnect(DisconnectReason::Local, now());
                        flush_output(&mut session, &transport, peer).await;
                        session.shutdown();
                    }
                }
            }

            datagram = input_rx.recv() => {
                match datagram {
                    Some(data) => {
                        // Invalid datagrams are counted by the session
                        let _ = session.input(data, now());
                        session.flush(now());
                    }
                    None => {
                        trace!(session = id, "Input channel closed, stopping actor");
                        session.shutdown();
                    }
                }
            }
        }

        flush_output(&mut session, &transport, peer).await;
        drain_recv(&mut session, dispatcher.as_ref(), peer).await;
        publish_status(&session, &status_tx);
    }

    flush_output(&mut session, &transport, peer).await;
    publish_status(&session, &status_tx);
    info!(session = id, peer = %peer, reason = ?session.disconnect_reason(), "Session closed");

    if let Some(on_exit) = on_exit {
        on_exit(id);
    }
}

async fn authenticate(session: &mut Session, authenticator: &dyn Authenticator, peer: SocketAddr) {
    let login = session.login_payload().clone();
    let timeout = session.config().connect_timeout;
    let decision = tokio::time::timeout(timeout, authenticator.authenticate(peer, login)).await;

    let now = now();
    match decision {
        Ok(AuthDecision::Accept) => {
            if session.complete_login(now).is_ok() {
                info!(session = session.id(), peer = %peer, "Session connected");
            }
        }
        Ok(AuthDecision::Reject) => {
            debug!(session = session.id(), peer = %peer, "Login rejected");
            session.reject_login(now);
        }
        Err(_) => {
            warn!(session = session.id(), peer = %peer, "Authenticator timed out");
            session.begin_disconnect(DisconnectReason::LoginTimeout, now);
        }
    }
}

/// Send all buffered output datagrams over the transport.
async fn flush_output(session: &mut Session, transport: &Arc<dyn Transport>, peer: SocketAddr) {
    let datagrams: Vec<Bytes> = session.drain_output().collect();
    for datagram in datagrams {
        if let Err(e) = transport.send_to(&datagram, peer).await {
            if is_transient_io(&e) {
                trace!(peer = %peer, error = %e, "Transport send_to failed");
            } else {
                warn!(peer = %peer, error = %e, "Transport send_to failed");
            }
        }
    }
}

/// Hand every completed message to the dispatcher.
async fn drain_recv(session: &mut Session, dispatcher: &dyn Dispatcher, peer: SocketAddr) {
    while let Some(message) = session.recv() {
        dispatcher
            .on_logical_message(Delivery {
                session: session.id(),
                peer,
                group: message.group,
                opcode: message.opcode,
                payload: message.payload,
            })
            .await;
    }
}

fn publish_status(session: &Session, status_tx: &watch::Sender<SessionStatus>) {
    let status = SessionStatus::of(session);
    status_tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ChannelDispatcher;
    use crate::transport::{RecvFuture, SendFuture};
    use rudp_core::{CoreConfig, NoopMetrics};
    use std::io;
    use tokio::sync::Semaphore;

    /// Sends wait for a permit; nothing is ever received.
    struct GatedTransport {
        gate: Semaphore,
    }

    impl Transport for GatedTransport {
        fn send_to<'a>(&'a self, buf: &'a [u8], _target: SocketAddr) -> SendFuture<'a> {
            Box::pin(async move {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                permit.forget();
                Ok(buf.len())
            })
        }

        fn recv_from<'a>(&'a self, _buf: &'a mut [u8]) -> RecvFuture<'a> {
            Box::pin(std::future::pending())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
        }
    }

    #[tokio::test]
    async fn test_close_survives_full_command_queue() {
        let transport = Arc::new(GatedTransport {
            gate: Semaphore::new(0),
        });
        let (dispatcher, _deliveries) = ChannelDispatcher::new(4);
        let session = Session::connect(
            1,
            CoreConfig::default(),
            Arc::new(NoopMetrics),
            Bytes::from_static(b"login"),
            now(),
        );
        let handle = spawn_session(ActorParams {
            session,
            peer: SocketAddr::from(([127, 0, 0, 1], 7)),
            transport: transport.clone(),
            tick_interval: Duration::from_millis(10),
            inbound_capacity: 4,
            command_capacity: 1,
            dispatcher: Arc::new(dispatcher),
            authenticator: None,
            on_exit: None,
        });

        // The actor is stuck sending its login request; fill its queue
        let (reply, _stats) = oneshot::channel();
        handle.cmd_tx.try_send(SessionCmd::Stats { reply }).unwrap();
        let (reply, _stats) = oneshot::channel();
        assert!(matches!(
            handle.cmd_tx.try_send(SessionCmd::Stats { reply }),
            Err(TrySendError::Full(_))
        ));

        handle.close();
        transport.gate.add_permits(1000);

        let status = tokio::time::timeout(Duration::from_secs(2), handle.wait_closed())
            .await
            .expect("Close was lost");
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.reason, Some(DisconnectReason::Local));
    }
}
