//! Per-listener transport metrics

use rudp_core::metrics::{Counter, MetricsSink};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Atomic counter set shared by a listener and all of its sessions.
#[derive(Debug)]
pub struct TransportMetrics {
    counters: [AtomicU64; Counter::COUNT],
    /// Sessions currently in the table
    active_sessions: AtomicUsize,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            active_sessions: AtomicUsize::new(0),
        }
    }
}

impl MetricsSink for TransportMetrics {
    fn incr(&self, counter: Counter, by: u64) {
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
        match counter {
            Counter::SessionsOpened => {
                self.active_sessions.fetch_add(by as usize, Ordering::Relaxed);
            }
            Counter::SessionsClosed => {
                self.active_sessions.fetch_sub(by as usize, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
            active_sessions: self.active_sessions(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    counters: [u64; Counter::COUNT],
    pub active_sessions: usize,
}

impl MetricsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()]
    }

    /// Share of sent packets that were retransmissions
    pub fn retransmit_rate(&self) -> f64 {
        let sent = self.get(Counter::PacketsSent);
        if sent == 0 {
            0.0
        } else {
            self.get(Counter::RetransmitsServed) as f64 / sent as f64
        }
    }

    /// Calculate total throughput in bytes per second
    pub fn throughput_bps(&self, duration: Duration) -> f64 {
        let total_bytes = self.get(Counter::BytesSent) + self.get(Counter::BytesReceived);
        total_bytes as f64 / duration.as_secs_f64()
    }

    /// Counters as `(name, value)` pairs, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        Counter::ALL
            .iter()
            .map(move |counter| (counter.name(), self.get(*counter)))
    }
}

/// Format metrics for human-readable display
pub fn format_metrics(snapshot: &MetricsSnapshot) -> String {
    format!(
        "Transport Metrics:\n\
         Sessions: {} opened, {} closed, {} active\n\
         Traffic: {} bytes sent, {} bytes received\n\
         Packets: {} sent, {} received\n\
         Dropped: {} checksum, {} malformed, {} duplicate, {} out of window, {} queue\n\
         Retransmits: {} requested, {} served, {} cache misses (rate: {:.2}%)\n\
         Messages: {} sent, {} received, {} dropped outbound",
        snapshot.get(Counter::SessionsOpened),
        snapshot.get(Counter::SessionsClosed),
        snapshot.active_sessions,
        snapshot.get(Counter::BytesSent),
        snapshot.get(Counter::BytesReceived),
        snapshot.get(Counter::PacketsSent),
        snapshot.get(Counter::PacketsReceived),
        snapshot.get(Counter::ChecksumFailures),
        snapshot.get(Counter::MalformedPackets),
        snapshot.get(Counter::DuplicatePackets),
        snapshot.get(Counter::OutOfWindowPackets),
        snapshot.get(Counter::InboundQueueDropped),
        snapshot.get(Counter::RetransmitRequestsSent),
        snapshot.get(Counter::RetransmitsServed),
        snapshot.get(Counter::RetransmitCacheMisses),
        snapshot.retransmit_rate() * 100.0,
        snapshot.get(Counter::MessagesSent),
        snapshot.get(Counter::MessagesReceived),
        snapshot.get(Counter::OutboundDropped),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gauge() {
        let metrics = TransportMetrics::default();

        metrics.incr(Counter::SessionsOpened, 1);
        assert_eq!(metrics.active_sessions(), 1);

        metrics.incr(Counter::SessionsClosed, 1);
        assert_eq!(metrics.active_sessions(), 0);
        assert_eq!(metrics.get(Counter::SessionsOpened), 1);
    }

    #[test]
    fn test_snapshot_and_format() {
        let metrics = TransportMetrics::new();
        metrics.incr(Counter::PacketsSent, 10);
        metrics.incr(Counter::RetransmitsServed, 1);
        metrics.incr(Counter::ChecksumFailures, 3);

        let snapshot = metrics.snapshot();
        assert!((snapshot.retransmit_rate() - 0.1).abs() < f64::EPSILON);
        assert_eq!(
            snapshot.iter().find(|(name, _)| *name == "checksum_failures"),
            Some(("checksum_failures", 3))
        );
        assert!(format_metrics(&snapshot).contains("3 checksum"));
    }
}
