//! Configuration types for the core protocol engine

use crate::checksum::{Checksum, Crc32};
use crate::protocol::constants;
use std::sync::Arc;
use std::time::Duration;

/// Protocol-only configuration for the session engine.
///
/// Contains only the fields the engine reads, no transport or I/O settings.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Largest datagram ever produced or accepted
    pub max_packet_size: usize,
    /// Ceiling for one reassembled logical message (opcode included)
    pub max_message_size: usize,
    /// Partial messages idle longer than this are evicted; never shorter
    /// than `max_gap_age`
    pub reassembly_timeout: Duration,
    /// Partial messages held at once
    pub max_in_flight_messages: usize,
    /// Completed message ids remembered for duplicate suppression
    pub completed_history: usize,
    /// Time before an open gap is requested again
    pub retransmit_timeout: Duration,
    /// Gap age after which the session is considered desynchronised
    pub max_gap_age: Duration,
    /// Out-of-order packets buffered ahead of the expected sequence
    pub max_pending_packets: usize,
    /// Retransmit cache bound by entry count
    pub cache_max_entries: usize,
    /// Retransmit cache bound by bytes
    pub cache_max_bytes: usize,
    /// Cached packets older than this are pruned
    pub cache_ttl: Duration,
    /// Consecutive retransmit-cache misses tolerated before teardown
    pub max_cache_misses: u32,
    /// Unacknowledged sequenced packets allowed in flight
    pub send_window: u32,
    /// Queued outbound fragments before lowest-priority groups are dropped
    pub outbound_queue_limit: usize,
    /// Minimum spacing between cumulative acknowledgments
    pub ack_interval: Duration,
    /// Keep-alive interval (also advertises the send horizon)
    pub keep_alive: Option<Duration>,
    /// Session torn down after this long without a valid packet
    pub idle_timeout: Duration,
    /// Client login retry spacing
    pub login_retry_interval: Duration,
    /// Bound on the whole login exchange
    pub connect_timeout: Duration,
    /// Packet checksum; both peers must use the same one
    pub checksum: Arc<dyn Checksum>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_packet_size: constants::DEFAULT_MAX_PACKET_SIZE,
            max_message_size: 1024 * 1024,
            reassembly_timeout: Duration::from_secs(15),
            max_in_flight_messages: 64,
            completed_history: 1024,
            retransmit_timeout: Duration::from_millis(200),
            max_gap_age: Duration::from_secs(10),
            max_pending_packets: 1024,
            cache_max_entries: 4096,
            cache_max_bytes: 4 * 1024 * 1024,
            cache_ttl: Duration::from_secs(30),
            max_cache_misses: 8,
            send_window: 512,
            outbound_queue_limit: 8192,
            ack_interval: Duration::from_millis(50),
            keep_alive: Some(Duration::from_secs(1)),
            idle_timeout: Duration::from_secs(30),
            login_retry_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            checksum: Arc::new(Crc32),
        }
    }
}

impl CoreConfig {
    /// Largest fragment payload that fits a packet on its own
    pub fn max_fragment_payload(&self) -> usize {
        self.max_packet_size
            .saturating_sub(constants::PACKET_HEADER_SIZE + constants::FRAGMENT_HEADER_SIZE)
            .min(u16::MAX as usize)
    }

    /// Most sequences a single retransmit request can name
    pub fn max_request_len(&self) -> usize {
        self.max_packet_size.saturating_sub(constants::PACKET_HEADER_SIZE)
            / constants::SEQUENCE_SIZE
    }
}
