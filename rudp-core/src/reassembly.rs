//! Fragment reassembly.
//!
//! Each in-flight message owns one arena buffer. Non-final fragments share a
//! common stride, so fragment `i` lands at offset `i * stride` and the final
//! fragment is appended after the fixed region. The arena is allocated once,
//! when the first non-final fragment reveals the stride; a final fragment that
//! arrives earlier is parked until then.

use crate::config::CoreConfig;
use crate::error::ReassemblyError;
use crate::protocol::{Fragment, Group, SeqNum};

use bytes::{Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;

/// A fully reassembled message body (opcode still attached).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub sequence: SeqNum,
    pub group: Group,
    pub data: Bytes,
}

/// Result of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Stored; more fragments needed
    Incomplete,
    /// Last missing piece arrived
    Complete(Reassembled),
    /// Already held or already completed; nothing changed
    Duplicate,
}

#[derive(Debug)]
struct PartialMessage {
    group: Group,
    count: u16,
    stride: Option<usize>,
    buffer: BytesMut,
    present: Vec<u64>,
    received: u16,
    tail: Option<Bytes>,
    last_activity: Instant,
}

impl PartialMessage {
    fn new(group: Group, count: u16, now: Instant) -> Self {
        Self {
            group,
            count,
            stride: None,
            buffer: BytesMut::new(),
            present: vec![0; (count as usize).div_ceil(64)],
            received: 0,
            tail: None,
            last_activity: now,
        }
    }

    fn is_present(&self, index: usize) -> bool {
        self.present[index / 64] & (1 << (index % 64)) != 0
    }

    fn mark_present(&mut self, index: usize) {
        self.present[index / 64] |= 1 << (index % 64);
        self.received += 1;
    }

    fn is_complete(&self) -> bool {
        self.received == self.count
    }

    fn buffered_bytes(&self) -> usize {
        self.buffer.len() + self.tail.as_ref().map_or(0, Bytes::len)
    }

    /// Store `fragment`. Returns `false` for a duplicate index.
    fn accept(
        &mut self,
        sequence: SeqNum,
        fragment: Fragment,
        max_message_size: usize,
        now: Instant,
    ) -> Result<bool, ReassemblyError> {
        if fragment.group != self.group || fragment.count != self.count {
            return Err(ReassemblyError::Inconsistent {
                sequence,
                reason: "group or count changed",
            });
        }

        let index = fragment.index as usize;
        if self.is_present(index) {
            return Ok(false);
        }

        let fixed_slots = self.count as usize - 1;
        let len = fragment.data.len();

        if fragment.is_last() {
            match self.stride {
                Some(stride) => {
                    self.check_final(sequence, stride, len, max_message_size)?;
                    self.buffer.extend_from_slice(&fragment.data);
                }
                None => self.tail = Some(fragment.data),
            }
        } else {
            let stride = match self.stride {
                Some(stride) if stride != len => {
                    return Err(ReassemblyError::Inconsistent {
                        sequence,
                        reason: "fragment size differs from stride",
                    });
                }
                Some(stride) => stride,
                None => {
                    let min_size = len * fixed_slots + 1;
                    if min_size > max_message_size {
                        return Err(ReassemblyError::TooLarge {
                            sequence,
                            size: min_size,
                            max: max_message_size,
                        });
                    }
                    self.stride = Some(len);
                    self.buffer = BytesMut::zeroed(len * fixed_slots);
                    if let Some(tail) = self.tail.take() {
                        self.check_final(sequence, len, tail.len(), max_message_size)?;
                        self.buffer.extend_from_slice(&tail);
                    }
                    len
                }
            };
            let offset = index * stride;
            self.buffer[offset..offset + stride].copy_from_slice(&fragment.data);
        }

        self.mark_present(index);
        self.last_activity = now;
        Ok(true)
    }

    fn check_final(
        &self,
        sequence: SeqNum,
        stride: usize,
        len: usize,
        max_message_size: usize,
    ) -> Result<(), ReassemblyError> {
        if len > stride {
            return Err(ReassemblyError::Inconsistent {
                sequence,
                reason: "final fragment longer than stride",
            });
        }
        let size = stride * (self.count as usize - 1) + len;
        if size > max_message_size {
            return Err(ReassemblyError::TooLarge {
                sequence,
                size,
                max: max_message_size,
            });
        }
        Ok(())
    }
}

/// Per-session reassembly state.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<SeqNum, PartialMessage>,
    completed: VecDeque<SeqNum>,
    completed_set: HashSet<SeqNum>,
    timeout: Duration,
    max_in_flight: usize,
    max_message_size: usize,
    completed_history: usize,
}

impl Reassembler {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            partial: HashMap::new(),
            completed: VecDeque::new(),
            completed_set: HashSet::new(),
            timeout: config.reassembly_timeout,
            max_in_flight: config.max_in_flight_messages,
            max_message_size: config.max_message_size,
            completed_history: config.completed_history,
        }
    }

    /// Feed one fragment.
    ///
    /// A fragment that contradicts its message discards the whole partial
    /// message so a bad sender cannot pin memory.
    pub fn on_fragment(
        &mut self,
        fragment: Fragment,
        now: Instant,
    ) -> Result<FragmentOutcome, ReassemblyError> {
        let sequence = fragment.sequence;
        if self.completed_set.contains(&sequence) {
            return Ok(FragmentOutcome::Duplicate);
        }

        if fragment.count == 1 {
            if fragment.data.len() > self.max_message_size {
                return Err(ReassemblyError::TooLarge {
                    sequence,
                    size: fragment.data.len(),
                    max: self.max_message_size,
                });
            }
            self.mark_completed(sequence);
            return Ok(FragmentOutcome::Complete(Reassembled {
                sequence,
                group: fragment.group,
                data: fragment.data,
            }));
        }

        let in_flight = self.partial.len();
        let entry = match self.partial.entry(sequence) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if in_flight >= self.max_in_flight {
                    return Err(ReassemblyError::Saturated { in_flight });
                }
                if fragment.count as usize > self.max_message_size {
                    return Err(ReassemblyError::TooLarge {
                        sequence,
                        size: fragment.count as usize,
                        max: self.max_message_size,
                    });
                }
                entry.insert(PartialMessage::new(fragment.group, fragment.count, now))
            }
        };

        match entry.accept(sequence, fragment, self.max_message_size, now) {
            Ok(false) => Ok(FragmentOutcome::Duplicate),
            Ok(true) if entry.is_complete() => {
                let Some(message) = self.partial.remove(&sequence) else {
                    return Ok(FragmentOutcome::Incomplete);
                };
                self.mark_completed(sequence);
                Ok(FragmentOutcome::Complete(Reassembled {
                    sequence,
                    group: message.group,
                    data: message.buffer.freeze(),
                }))
            }
            Ok(true) => Ok(FragmentOutcome::Incomplete),
            Err(e) => {
                self.partial.remove(&sequence);
                Err(e)
            }
        }
    }

    /// Drop partial messages that saw no fragment within the timeout.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.partial.len();
        let timeout = self.timeout;
        self.partial.retain(|sequence, message| {
            let keep = now.saturating_duration_since(message.last_activity) < timeout;
            if !keep {
                trace!(
                    seq = sequence,
                    received = message.received,
                    count = message.count,
                    "Evicting stale partial message"
                );
            }
            keep
        });
        before - self.partial.len()
    }

    /// Partial messages currently held
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    /// Bytes held by partial messages
    pub fn buffered_bytes(&self) -> usize {
        self.partial.values().map(PartialMessage::buffered_bytes).sum()
    }

    /// Release every buffer and forget completed ids.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.completed.clear();
        self.completed_set.clear();
    }

    fn mark_completed(&mut self, sequence: SeqNum) {
        if self.completed_set.insert(sequence) {
            self.completed.push_back(sequence);
        }
        while self.completed.len() > self.completed_history {
            if let Some(old) = self.completed.pop_front() {
                self.completed_set.remove(&old);
            }
        }
    }
}
