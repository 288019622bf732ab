//! Inbound sequence tracking and gap detection.
//!
//! The tracker releases sequenced packets strictly in order, buffers a bounded
//! window of early arrivals, and decides when missing sequences should be
//! requested from the peer. Each missing sequence is requested once when it is
//! first noticed and then again only after the retransmit timeout elapses with
//! the gap still open.

use crate::config::CoreConfig;
use crate::protocol::{seq_after, seq_before, seq_distance, Packet, SeqNum};

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// What happened to an admitted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The expected packet arrived; releases it and every buffered successor
    Deliver(Vec<Packet>),
    /// Already delivered or already buffered
    Duplicate,
    /// Held until the gap before it closes; `request` names newly missing
    /// sequences to ask the peer for
    Buffered { request: Option<Vec<SeqNum>> },
    /// Too far ahead of the expected sequence to buffer
    OutOfWindow,
}

/// Outcome of a periodic gap check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapPoll {
    /// No gap, or the last request is still fresh
    Idle,
    /// Re-request these sequences
    Request(Vec<SeqNum>),
    /// Gap outlived the allowed age
    Desync,
}

#[derive(Debug, Clone, Copy)]
struct Gap {
    opened_at: Instant,
    last_request: Option<Instant>,
}

#[derive(Debug)]
pub struct SequenceTracker {
    expected_next: SeqNum,
    /// One past the highest sequence known to exist
    horizon: SeqNum,
    pending: HashMap<SeqNum, Packet>,
    requested: HashSet<SeqNum>,
    gap: Option<Gap>,
    retransmit_timeout: Duration,
    max_gap_age: Duration,
    max_pending: usize,
    max_request_len: usize,
}

impl SequenceTracker {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            expected_next: 0,
            horizon: 0,
            pending: HashMap::new(),
            requested: HashSet::new(),
            gap: None,
            retransmit_timeout: config.retransmit_timeout,
            max_gap_age: config.max_gap_age,
            max_pending: config.max_pending_packets.max(1),
            max_request_len: config.max_request_len().max(1),
        }
    }

    pub fn expected_next(&self) -> SeqNum {
        self.expected_next
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_gap(&self) -> bool {
        self.gap.is_some()
    }

    /// Admit one sequenced packet.
    pub fn admit(&mut self, packet: Packet, now: Instant) -> Admission {
        let sequence = packet.sequence;
        let distance = seq_distance(self.expected_next, sequence);

        if distance < 0 || self.pending.contains_key(&sequence) {
            return Admission::Duplicate;
        }

        if distance == 0 {
            let mut run = vec![packet];
            self.expected_next = self.expected_next.wrapping_add(1);
            while let Some(next) = self.pending.remove(&self.expected_next) {
                run.push(next);
                self.expected_next = self.expected_next.wrapping_add(1);
            }
            self.extend_horizon(self.expected_next);
            self.on_progress(now);
            return Admission::Deliver(run);
        }

        self.extend_horizon(sequence.wrapping_add(1));

        if distance as usize >= self.max_pending {
            self.open_gap(now);
            return Admission::OutOfWindow;
        }

        self.pending.insert(sequence, packet);
        Admission::Buffered {
            request: self.request_new(now),
        }
    }

    /// Learn that the peer has sent everything before `horizon`.
    ///
    /// Returns the newly missing sequences when this reveals a tail loss.
    pub fn observe_horizon(&mut self, horizon: SeqNum, now: Instant) -> Option<Vec<SeqNum>> {
        self.extend_horizon(horizon);
        if self.horizon == self.expected_next {
            return None;
        }
        self.request_new(now)
    }

    /// Periodic check for stale gaps.
    pub fn poll(&mut self, now: Instant) -> GapPoll {
        let Some(gap) = self.gap else {
            return GapPoll::Idle;
        };

        if now.saturating_duration_since(gap.opened_at) >= self.max_gap_age {
            return GapPoll::Desync;
        }

        let due = gap
            .last_request
            .map_or(true, |at| now.saturating_duration_since(at) >= self.retransmit_timeout);
        if !due {
            return GapPoll::Idle;
        }

        let missing = self.missing(false);
        if missing.is_empty() {
            return GapPoll::Idle;
        }
        self.requested.extend(missing.iter().copied());
        self.gap = Some(Gap {
            last_request: Some(now),
            ..gap
        });
        GapPoll::Request(missing)
    }

    /// Forget everything, including buffered packets.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.requested.clear();
        self.gap = None;
    }

    fn extend_horizon(&mut self, candidate: SeqNum) {
        if seq_after(candidate, self.horizon) {
            self.horizon = candidate;
        }
    }

    fn open_gap(&mut self, now: Instant) {
        if self.gap.is_none() {
            self.gap = Some(Gap {
                opened_at: now,
                last_request: None,
            });
        }
    }

    /// Progress resets the gap age; a fully closed gap is forgotten.
    fn on_progress(&mut self, now: Instant) {
        let expected = self.expected_next;
        self.requested.retain(|seq| !seq_before(*seq, expected));

        if self.horizon == self.expected_next {
            self.gap = None;
            self.requested.clear();
        } else if let Some(gap) = self.gap.as_mut() {
            gap.opened_at = now;
        } else {
            self.open_gap(now);
        }
    }

    fn request_new(&mut self, now: Instant) -> Option<Vec<SeqNum>> {
        self.open_gap(now);
        let missing = self.missing(true);
        if missing.is_empty() {
            return None;
        }
        self.requested.extend(missing.iter().copied());
        if let Some(gap) = self.gap.as_mut() {
            gap.last_request = Some(now);
        }
        Some(missing)
    }

    /// Missing sequences inside the buffering window, oldest first.
    fn missing(&self, only_new: bool) -> Vec<SeqNum> {
        let span = (seq_distance(self.expected_next, self.horizon).max(0) as usize)
            .min(self.max_pending);
        (0..span)
            .map(|offset| self.expected_next.wrapping_add(offset as u32))
            .filter(|seq| !self.pending.contains_key(seq))
            .filter(|seq| !only_new || !self.requested.contains(seq))
            .take(self.max_request_len)
            .collect()
    }
}
