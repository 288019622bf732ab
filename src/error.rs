//! Error types for the async transport.
//!
//! [`TransportError`] extends [`rudp_core::CoreError`] with I/O, timeout,
//! config, and session variants needed by the runtime layer.

use rudp_core::session::{DisconnectReason, SessionId};
use rudp_core::CoreError;
use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

// ── Error types ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be set up; nothing will be served
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Protocol error: {0}")]
    Core(#[from] CoreError),

    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionError },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unknown session {id}")]
    UnknownSession { id: SessionId },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    Closed,
    Rejected,
    LoginTimeout,
    NotConnected,
    Disconnected(DisconnectReason),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Rejected => write!(f, "login rejected"),
            Self::LoginTimeout => write!(f, "login timed out"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Disconnected(reason) => write!(f, "disconnected ({reason})"),
        }
    }
}

impl From<DisconnectReason> for ConnectionError {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::LoginRejected => Self::Rejected,
            DisconnectReason::LoginTimeout => Self::LoginTimeout,
            other => Self::Disconnected(other),
        }
    }
}

// ── Constructors ────────────────────────────────────────────────────────

impl TransportError {
    pub fn bind(addr: impl fmt::Display, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn connection(kind: ConnectionError) -> Self {
        Self::Connection { kind }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

// ── Predicates ──────────────────────────────────────────────────────────

/// Socket errors that affect one datagram and leave the socket usable.
pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => is_transient_io(e),
            Self::Timeout { .. } => true,
            Self::Core(e) => matches!(e, CoreError::Backpressure { .. }),
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::Internal { .. } => true,
            Self::Core(e) => e.is_fatal(),
            _ => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Connection { kind } => !matches!(kind, ConnectionError::NotConnected),
            Self::Core(CoreError::Closed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(is_transient_io(&reset));
        assert!(TransportError::from(reset).is_recoverable());

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(!is_transient_io(&denied));
        assert!(TransportError::bind("0.0.0.0:1", denied).is_fatal());
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            ConnectionError::from(DisconnectReason::LoginRejected),
            ConnectionError::Rejected
        );
        let err = TransportError::connection(DisconnectReason::IdleTimeout.into());
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "Connection error: disconnected (idle timeout)");
    }
}
