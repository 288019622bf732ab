//! Error types for the core protocol engine

use crate::protocol::Group;
use std::fmt;

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Reasons a datagram is rejected by the codec.
///
/// No state is created for a datagram that fails to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the packet header
    TooShort { len: usize },
    /// Longer than the configured maximum packet size
    TooLarge { len: usize, max: usize },
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Unknown flag bits, or a combination no packet may carry
    InvalidFlags { bits: u32 },
    /// Fragment header cut off by the end of the datagram
    TruncatedFragment { offset: usize },
    /// Declared fragment sizes do not add up to the payload length
    FragmentLengthMismatch { declared: usize, actual: usize },
    FragmentIndexOutOfRange { index: u16, count: u16 },
    EmptyFragment { sequence: u32 },
    /// FRAGMENTED flag set but no fragments present
    NoFragments,
    /// Control body does not match the layout its flag requires
    InvalidControlBody { flags: u32, len: usize },
}

impl DecodeError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, DecodeError::ChecksumMismatch { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { len } => write!(f, "datagram too short ({len} bytes)"),
            DecodeError::TooLarge { len, max } => {
                write!(f, "datagram too large ({len} bytes, max {max})")
            }
            DecodeError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected:#010x}, got {actual:#010x})")
            }
            DecodeError::InvalidFlags { bits } => write!(f, "invalid flags {bits:#x}"),
            DecodeError::TruncatedFragment { offset } => {
                write!(f, "truncated fragment at offset {offset}")
            }
            DecodeError::FragmentLengthMismatch { declared, actual } => write!(
                f,
                "fragment sizes declare {declared} bytes but payload has {actual}"
            ),
            DecodeError::FragmentIndexOutOfRange { index, count } => {
                write!(f, "fragment index {index} out of range for count {count}")
            }
            DecodeError::EmptyFragment { sequence } => {
                write!(f, "empty fragment for message {sequence}")
            }
            DecodeError::NoFragments => write!(f, "fragmented packet without fragments"),
            DecodeError::InvalidControlBody { flags, len } => {
                write!(f, "invalid control body of {len} bytes for flags {flags:#x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Reasons a fragment is refused by the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Message would exceed the configured size ceiling
    TooLarge { sequence: u32, size: usize, max: usize },
    /// Fragment disagrees with earlier fragments of the same message
    Inconsistent { sequence: u32, reason: &'static str },
    /// Too many messages already in flight
    Saturated { in_flight: usize },
    /// Completed message is too short to carry an opcode
    MissingOpcode { sequence: u32, group: Group },
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReassemblyError::TooLarge {
                sequence,
                size,
                max,
            } => write!(f, "message {sequence} needs {size} bytes, ceiling is {max}"),
            ReassemblyError::Inconsistent { sequence, reason } => {
                write!(f, "inconsistent fragment for message {sequence}: {reason}")
            }
            ReassemblyError::Saturated { in_flight } => {
                write!(f, "reassembly saturated ({in_flight} messages in flight)")
            }
            ReassemblyError::MissingOpcode { sequence, group } => {
                write!(f, "message {sequence} on group {group} has no opcode")
            }
        }
    }
}

impl std::error::Error for ReassemblyError {}

/// Error types produced by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    Decode(DecodeError),
    Reassembly(ReassemblyError),
    /// Packet would exceed the maximum packet size
    Encode { len: usize, max: usize },
    /// Outgoing message larger than the configured ceiling
    MessageTooLarge { size: usize, max: usize },
    /// Outbound queue over its bound; the message was dropped
    Backpressure { group: Group },
    /// Operation needs a connected session
    NotConnected,
    /// Session has been closed
    Closed,
}

impl CoreError {
    /// Check if this error means the session can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Closed)
    }

    /// Check if this error came from a malformed datagram
    pub fn is_malformed(&self) -> bool {
        matches!(self, CoreError::Decode(e) if !e.is_checksum_mismatch())
            || matches!(self, CoreError::Reassembly(_))
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Decode(e) => write!(f, "Decode error: {e}"),
            CoreError::Reassembly(e) => write!(f, "Reassembly error: {e}"),
            CoreError::Encode { len, max } => {
                write!(f, "Encode error: packet of {len} bytes exceeds {max}")
            }
            CoreError::MessageTooLarge { size, max } => {
                write!(f, "Message of {size} bytes exceeds ceiling of {max}")
            }
            CoreError::Backpressure { group } => {
                write!(f, "Outbound queue full, message on group {group} dropped")
            }
            CoreError::NotConnected => write!(f, "Session not connected"),
            CoreError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Decode(e) => Some(e),
            CoreError::Reassembly(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for CoreError {
    fn from(e: DecodeError) -> Self {
        CoreError::Decode(e)
    }
}

impl From<ReassemblyError> for CoreError {
    fn from(e: ReassemblyError) -> Self {
        CoreError::Reassembly(e)
    }
}
