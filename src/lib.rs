//! # rudp-tokio: reliable ordered messages over UDP
//!
//! Sessions over a single UDP socket that deliver arbitrarily large logical
//! messages exactly once and in order, recovering loss with receiver-driven
//! retransmit requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  rudp-tokio  (this crate)                  │
//! │                                            │
//! │  Listener / Connection  ← user API         │
//! │  dispatch               ← app callbacks    │
//! │  actor                  ← one per session  │
//! │  transport              ← UDP I/O          │
//! ├────────────────────────────────────────────┤
//! │  rudp-core  (dependency)                   │
//! │                                            │
//! │  Session     ← pure sync state machine     │
//! │  codec, reassembly, tracker, cache         │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rudp_tokio::{ChannelDispatcher, Collaborators, Connection, Listener, TransportConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (dispatcher, mut deliveries) = ChannelDispatcher::new(1024);
//!     let listener = Listener::bind(
//!         "127.0.0.1:0".parse()?,
//!         TransportConfig::default(),
//!         Collaborators::new(Arc::new(dispatcher)),
//!     )
//!     .await?;
//!
//!     let client = Connection::connect(listener.local_addr(), "player-1", TransportConfig::default()).await?;
//!     client.send(0, 7, vec![0u8; 100_000]).await?;
//!
//!     let delivery = deliveries.recv().await.expect("listener running");
//!     assert_eq!(delivery.payload.len(), 100_000);
//!     listener.send(delivery.session, 0, 8, "ok").await?;
//!     Ok(())
//! }
//! ```

// ── Layer 1: Core protocol (re-exported from rudp-core) ─────────────────

/// Wire types, constants, and sequence arithmetic.
pub use rudp_core::protocol;

/// Direct access to the standalone `rudp-core` crate.
pub use rudp_core;

pub use rudp_core::session::{DisconnectReason, SessionId, SessionState, SessionStats};

// ── Layer 2: Transport & metrics ────────────────────────────────────────

pub mod metrics;
pub mod transport;
pub use metrics::{format_metrics, MetricsSnapshot, TransportMetrics};
pub use transport::{LossyTransport, Transport};
#[cfg(feature = "tokio")]
pub use transport::UdpTransport;

// ── Layer 3: Configuration & errors (extends core with I/O concerns) ────

pub mod config;
pub mod error;
pub use config::TransportConfig;
pub use error::{ConnectionError, Result, TransportError};

// ── Layer 4: Sessions (actor + listener + client) ───────────────────────

#[cfg(feature = "tokio")]
pub(crate) mod actor;
#[cfg(feature = "tokio")]
pub mod connection;
#[cfg(feature = "tokio")]
pub mod dispatch;
#[cfg(feature = "tokio")]
pub mod listener;

#[cfg(feature = "tokio")]
pub use actor::SessionStatus;
#[cfg(feature = "tokio")]
pub use connection::Connection;
#[cfg(feature = "tokio")]
pub use dispatch::{
    AcceptAll, AuthDecision, Authenticator, ChannelDispatcher, Collaborators, Delivery, Dispatcher,
};
#[cfg(feature = "tokio")]
pub use listener::Listener;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
