//! Outgoing packet cache.
//!
//! Serialized data packets are kept in send order so a retransmit request can
//! be answered with the original bytes. Sequences are contiguous, which makes
//! lookup an index computation from the oldest entry.

use crate::config::CoreConfig;
use crate::protocol::{seq_before, seq_distance, SeqNum};

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CachedPacket {
    sequence: SeqNum,
    data: Bytes,
    sent_at: Instant,
}

/// Ring of sent packets bounded by entry count and byte budget.
#[derive(Debug)]
pub struct RetransmitCache {
    entries: VecDeque<CachedPacket>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
}

impl RetransmitCache {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            max_entries: config.cache_max_entries.max(1),
            max_bytes: config.cache_max_bytes,
            ttl: config.cache_ttl,
        }
    }

    /// Store a sent packet. Returns how many old entries were evicted to make
    /// room.
    pub fn insert(&mut self, sequence: SeqNum, data: Bytes, now: Instant) -> usize {
        if let Some(back) = self.entries.back() {
            if back.sequence.wrapping_add(1) != sequence {
                self.clear();
            }
        }

        self.bytes += data.len();
        self.entries.push_back(CachedPacket {
            sequence,
            data,
            sent_at: now,
        });

        let mut evicted = 0;
        while self.entries.len() > self.max_entries
            || (self.bytes > self.max_bytes && self.entries.len() > 1)
        {
            self.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Original bytes of `sequence`, if still held.
    pub fn get(&self, sequence: SeqNum) -> Option<&Bytes> {
        let front = self.entries.front()?;
        let index = seq_distance(front.sequence, sequence);
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize).map(|entry| &entry.data)
    }

    /// Drop every entry before the peer's cumulative acknowledgment.
    pub fn acknowledge(&mut self, cumulative: SeqNum) -> usize {
        let mut pruned = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| seq_before(entry.sequence, cumulative))
        {
            self.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Drop entries older than the TTL.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut pruned = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| now.saturating_duration_since(entry.sent_at) >= self.ttl)
        {
            self.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Whether a packet of `len` bytes fits without evicting anything.
    pub fn has_room(&self, len: usize) -> bool {
        self.entries.is_empty()
            || (self.entries.len() < self.max_entries && self.bytes + len <= self.max_bytes)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn pop_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.bytes -= entry.data.len();
        }
    }
}
