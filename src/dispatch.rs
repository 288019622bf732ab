//! External collaborators: message dispatch and login authentication.

use crate::metrics::TransportMetrics;
use bytes::Bytes;
use rudp_core::protocol::{Group, Opcode};
use rudp_core::session::SessionId;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Boxed future returned by [`Dispatcher::on_logical_message`].
pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Boxed future returned by [`Authenticator::authenticate`].
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = AuthDecision> + Send + 'a>>;

/// One reassembled message, as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session: SessionId,
    pub peer: SocketAddr,
    pub group: Group,
    pub opcode: Opcode,
    pub payload: Bytes,
}

/// Receives every logical message of every session.
///
/// Called from the owning session's actor, in delivery order. A slow
/// dispatcher stalls only that session; the listener keeps receiving.
pub trait Dispatcher: Send + Sync + 'static {
    fn on_logical_message(&self, delivery: Delivery) -> DispatchFuture<'_>;
}

/// Forwards deliveries into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<Delivery>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn on_logical_message(&self, delivery: Delivery) -> DispatchFuture<'_> {
        Box::pin(async move {
            if self.tx.send(delivery).await.is_err() {
                tracing::trace!("Delivery receiver dropped");
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    Reject,
}

/// Decides whether a login payload is admitted.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, peer: SocketAddr, login: Bytes) -> AuthFuture<'_>;
}

/// Admits every peer
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&self, _peer: SocketAddr, _login: Bytes) -> AuthFuture<'_> {
        Box::pin(async { AuthDecision::Accept })
    }
}

/// Everything a listener hands to its sessions.
#[derive(Clone)]
pub struct Collaborators {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: Arc<TransportMetrics>,
}

impl Collaborators {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            authenticator: Arc::new(AcceptAll),
            metrics: Arc::new(TransportMetrics::default()),
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn metrics(mut self, metrics: Arc<TransportMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
