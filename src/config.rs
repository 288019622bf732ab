//! Configuration types for the transport.
//!
//! [`TransportConfig`] extends the core [`CoreConfig`] with runtime settings
//! (tick rate, queue capacities, listener limits, etc.).

use crate::error::{Result, TransportError};
use rudp_core::protocol::constants;
use std::sync::Arc;
use std::time::Duration;

pub use rudp_core::checksum::{Checksum, Crc32, Fnv1a32};
pub use rudp_core::config::CoreConfig;

// ── TransportConfig ─────────────────────────────────────────────────────

/// Full configuration: protocol settings + transport / runtime settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    // Protocol settings (forwarded to the core session)
    pub core: CoreConfig,

    // Transport / runtime settings
    pub tick_interval: Duration,
    pub inbound_queue_capacity: usize,
    pub command_queue_capacity: usize,
    pub recv_buffer_size: usize,
    pub max_sessions: usize,
    pub simulate_packet_loss: Option<f32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            tick_interval: Duration::from_millis(10),
            inbound_queue_capacity: 1024,
            command_queue_capacity: 256,
            recv_buffer_size: constants::ABSOLUTE_MAX_PACKET_SIZE,
            max_sessions: 4096,
            simulate_packet_loss: None,
        }
    }
}

/// Extracts the protocol-only part the session engine reads.
impl From<TransportConfig> for CoreConfig {
    fn from(c: TransportConfig) -> Self {
        c.core
    }
}

// ── Builder methods ─────────────────────────────────────────────────────

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Protocol tuning --

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.core.max_packet_size = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.core.max_message_size = size;
        self
    }

    pub fn send_window(mut self, packets: u32) -> Self {
        self.core.send_window = packets;
        self
    }

    pub fn retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.core.retransmit_timeout = timeout;
        self
    }

    pub fn reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.core.reassembly_timeout = timeout;
        self
    }

    pub fn max_gap_age(mut self, age: Duration) -> Self {
        self.core.max_gap_age = age;
        self
    }

    pub fn retransmit_cache(mut self, max_entries: usize, max_bytes: usize) -> Self {
        self.core.cache_max_entries = max_entries;
        self.core.cache_max_bytes = max_bytes;
        self
    }

    pub fn outbound_queue_limit(mut self, fragments: usize) -> Self {
        self.core.outbound_queue_limit = fragments;
        self
    }

    pub fn ack_interval(mut self, interval: Duration) -> Self {
        self.core.ack_interval = interval;
        self
    }

    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.core.keep_alive = interval;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.core.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.core.connect_timeout = timeout;
        self
    }

    pub fn checksum(mut self, checksum: Arc<dyn Checksum>) -> Self {
        self.core.checksum = checksum;
        self
    }

    // -- Transport / runtime tuning --

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity;
        self
    }

    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn simulate_packet_loss(mut self, loss_rate: f32) -> Self {
        if (0.0..=1.0).contains(&loss_rate) {
            self.simulate_packet_loss = Some(loss_rate);
        }
        self
    }

    // -- Validation --

    pub fn validate(&self) -> Result<()> {
        let core = &self.core;
        if core.max_packet_size < constants::MIN_MAX_PACKET_SIZE
            || core.max_packet_size > constants::ABSOLUTE_MAX_PACKET_SIZE
        {
            return Err(TransportError::config(format!(
                "Max packet size must be between {} and {}",
                constants::MIN_MAX_PACKET_SIZE,
                constants::ABSOLUTE_MAX_PACKET_SIZE
            )));
        }
        if core.max_message_size <= constants::OPCODE_SIZE {
            return Err(TransportError::config("Max message size too small for an opcode"));
        }
        let window = core.send_window as usize;
        if window == 0
            || window > core.cache_max_entries
            || window.saturating_mul(core.max_packet_size) > core.cache_max_bytes
        {
            return Err(TransportError::config(
                "Send window must be non-zero and fit the retransmit cache",
            ));
        }
        if core.max_pending_packets == 0 || core.max_in_flight_messages == 0 {
            return Err(TransportError::config("Receive buffers must be greater than 0"));
        }
        if core.retransmit_timeout.is_zero() || core.retransmit_timeout >= core.max_gap_age {
            return Err(TransportError::config(
                "Retransmit timeout must be positive and below the max gap age",
            ));
        }
        if core.reassembly_timeout < core.max_gap_age {
            return Err(TransportError::config(
                "Reassembly timeout must not be shorter than the max gap age",
            ));
        }
        if core.idle_timeout.is_zero() || core.connect_timeout.is_zero() {
            return Err(TransportError::config("Timeouts must be greater than 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(TransportError::config("Tick interval must be greater than 0"));
        }
        if self.inbound_queue_capacity == 0 || self.command_queue_capacity == 0 {
            return Err(TransportError::config("Queue capacities must be greater than 0"));
        }
        if self.recv_buffer_size < core.max_packet_size {
            return Err(TransportError::config(
                "Receive buffer must hold a maximum-size packet",
            ));
        }
        if self.max_sessions == 0 {
            return Err(TransportError::config("Max sessions must be greater than 0"));
        }
        Ok(())
    }
}

// ── Presets ──────────────────────────────────────────────────────────────

impl TransportConfig {
    /// Small packets, fast loss recovery, short timeouts.
    pub fn gaming() -> Self {
        Self::default()
            .tick_interval(Duration::from_millis(5))
            .retransmit_timeout(Duration::from_millis(100))
            .ack_interval(Duration::from_millis(20))
            .keep_alive(Some(Duration::from_millis(500)))
            .idle_timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(3))
    }

    /// Larger packets for jumbo-frame local networks.
    pub fn lan() -> Self {
        Self::default()
            .max_packet_size(8192)
            .send_window(1024)
            .retransmit_cache(4096, 8 * 1024 * 1024)
            .retransmit_timeout(Duration::from_millis(50))
            .ack_interval(Duration::from_millis(10))
    }

    pub fn testing(packet_loss: f32) -> Self {
        Self::default()
            .simulate_packet_loss(packet_loss)
            .retransmit_timeout(Duration::from_millis(50))
            .ack_interval(Duration::from_millis(10))
            .keep_alive(Some(Duration::from_millis(200)))
            .connect_timeout(Duration::from_secs(5))
    }
}
