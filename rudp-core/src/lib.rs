//! Pure synchronous reliable-datagram protocol engine.
//!
//! Turns raw datagrams into ordered, de-duplicated logical messages of any
//! size and back again, recovering loss through receiver-driven retransmit
//! requests. No tokio, no async, no I/O: callers move bytes in and out of a
//! [`Session`] and drive its timers.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  rudp-core                               │
//! │                                          │
//! │  protocol    ← wire types, seq math      │
//! │  checksum    ← CRC-32 / FNV-1a           │
//! │  codec       ← parse / serialize         │
//! │  fragmenter  ← message → fragments       │
//! │  reassembly  ← fragments → message       │
//! │  tracker     ← ordering, gap requests    │
//! │  cache       ← sent packets by sequence  │
//! │  session     ← lifecycle state machine   │
//! └──────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod fragmenter;
pub mod metrics;
pub mod protocol;
pub mod reassembly;
pub mod session;
pub mod tracker;

pub use cache::RetransmitCache;
pub use checksum::{Checksum, Crc32, Fnv1a32};
pub use codec::PacketCodec;
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, DecodeError, ReassemblyError};
pub use fragmenter::Fragmenter;
pub use metrics::{Counter, MetricsSink, NoopMetrics};
pub use protocol::*;
pub use reassembly::{FragmentOutcome, Reassembled, Reassembler};
pub use session::{
    DisconnectReason, LogicalMessage, Role, Session, SessionId, SessionState, SessionStats,
};
pub use tracker::{Admission, GapPoll, SequenceTracker};
