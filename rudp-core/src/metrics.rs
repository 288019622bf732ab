//! Metrics sink interface consumed by the engine.

use std::fmt;

/// Every event the engine counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    PacketsReceived,
    BytesReceived,
    PacketsSent,
    BytesSent,
    ChecksumFailures,
    MalformedPackets,
    DuplicatePackets,
    OutOfWindowPackets,
    RetransmitRequestsSent,
    RetransmitsServed,
    RetransmitCacheMisses,
    MessagesReceived,
    MessagesSent,
    ReassemblyEvictions,
    OutboundDropped,
    InboundQueueDropped,
    SessionsOpened,
    SessionsClosed,
}

impl Counter {
    pub const COUNT: usize = 18;

    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::PacketsReceived,
        Counter::BytesReceived,
        Counter::PacketsSent,
        Counter::BytesSent,
        Counter::ChecksumFailures,
        Counter::MalformedPackets,
        Counter::DuplicatePackets,
        Counter::OutOfWindowPackets,
        Counter::RetransmitRequestsSent,
        Counter::RetransmitsServed,
        Counter::RetransmitCacheMisses,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::ReassemblyEvictions,
        Counter::OutboundDropped,
        Counter::InboundQueueDropped,
        Counter::SessionsOpened,
        Counter::SessionsClosed,
    ];

    /// Dense index, usable for array-backed sinks
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::PacketsReceived => "packets_received",
            Counter::BytesReceived => "bytes_received",
            Counter::PacketsSent => "packets_sent",
            Counter::BytesSent => "bytes_sent",
            Counter::ChecksumFailures => "checksum_failures",
            Counter::MalformedPackets => "malformed_packets",
            Counter::DuplicatePackets => "duplicate_packets",
            Counter::OutOfWindowPackets => "out_of_window_packets",
            Counter::RetransmitRequestsSent => "retransmit_requests_sent",
            Counter::RetransmitsServed => "retransmits_served",
            Counter::RetransmitCacheMisses => "retransmit_cache_misses",
            Counter::MessagesReceived => "messages_received",
            Counter::MessagesSent => "messages_sent",
            Counter::ReassemblyEvictions => "reassembly_evictions",
            Counter::OutboundDropped => "outbound_dropped",
            Counter::InboundQueueDropped => "inbound_queue_dropped",
            Counter::SessionsOpened => "sessions_opened",
            Counter::SessionsClosed => "sessions_closed",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of engine counters. Implementations must be cheap and
/// non-blocking; they are called on the datagram path.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter, by: u64);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter, _by: u64) {}
}
