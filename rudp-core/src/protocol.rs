//! Wire types, constants, and sequence arithmetic.
//!
//! ```text
//! Packet header (12 bytes, little-endian)
//! ┌──────────────┬──────────────┬──────────────┐
//! │ sequence u32 │  flags u32   │ checksum u32 │
//! └──────────────┴──────────────┴──────────────┘
//!
//! Fragment header (12 bytes, repeated while FRAGMENTED is set)
//! ┌──────────────┬───────────┬───────────┬───────────┬──────────┐
//! │ sequence u32 │ index u16 │ count u16 │ group u16 │ size u16 │ + size bytes
//! └──────────────┴───────────┴───────────┴───────────┴──────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Protocol constants
pub mod constants {
    pub const PACKET_HEADER_SIZE: usize = 12; // sequence + flags + checksum
    pub const FRAGMENT_HEADER_SIZE: usize = 12; // sequence + index + count + group + size
    pub const MIN_HEADER_SIZE: usize = PACKET_HEADER_SIZE;
    pub const CHECKSUM_OFFSET: usize = 8; // byte offset of the checksum field
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200; // MTU-safe with tunnel headroom
    pub const MIN_MAX_PACKET_SIZE: usize = 64;
    pub const ABSOLUTE_MAX_PACKET_SIZE: usize = 65507; // largest UDP payload over IPv4
    pub const OPCODE_SIZE: usize = 2;
    pub const SEQUENCE_SIZE: usize = 4;
}

/// Packet (physical datagram) sequence number
pub type SeqNum = u32;

/// Logical message routing tag
pub type Group = u16;

/// Application opcode carried in the first two bytes of every logical message
pub type Opcode = u16;

/// Check if a sequence number is before another (handling wrapping)
pub fn seq_before(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if a sequence number is after another (handling wrapping)
pub fn seq_after(seq1: SeqNum, seq2: SeqNum) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

/// Signed distance from `from` to `to`
pub fn seq_distance(from: SeqNum, to: SeqNum) -> i32 {
    to.wrapping_sub(from) as i32
}

/// Packet flag bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const FRAGMENTED: Self = Self(1 << 0);
    pub const RETRANSMIT_REQUEST: Self = Self(1 << 1);
    pub const ACK: Self = Self(1 << 2);
    pub const LOGIN_REQUEST: Self = Self(1 << 3);
    pub const DISCONNECT: Self = Self(1 << 4);
    pub const LOGIN_ACCEPTED: Self = Self(1 << 5);
    pub const KEEP_ALIVE: Self = Self(1 << 6);

    const KNOWN: u32 = 0x7F;
    const NAMES: [(Self, &'static str); 7] = [
        (Self::FRAGMENTED, "FRAGMENTED"),
        (Self::RETRANSMIT_REQUEST, "RETRANSMIT_REQUEST"),
        (Self::ACK, "ACK"),
        (Self::LOGIN_REQUEST, "LOGIN_REQUEST"),
        (Self::DISCONNECT, "DISCONNECT"),
        (Self::LOGIN_ACCEPTED, "LOGIN_ACCEPTED"),
        (Self::KEEP_ALIVE, "KEEP_ALIVE"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, returning `None` if any unknown bit is set.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Only fragment-carrying packets consume a sequence number.
    pub const fn is_sequenced(self) -> bool {
        self.contains(Self::FRAGMENTED)
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "PacketFlags(empty)");
        }
        let mut first = true;
        write!(f, "PacketFlags(")?;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

/// Fixed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: SeqNum,
    pub flags: PacketFlags,
    pub checksum: u32,
}

impl PacketHeader {
    pub const SIZE: usize = constants::PACKET_HEADER_SIZE;

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.flags.bits());
        buf.put_u32_le(self.checksum);
    }

    /// Decode the raw fields, leaving flag validation to the caller.
    pub fn decode_raw(buf: &mut impl Buf) -> Option<(SeqNum, u32, u32)> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        Some((buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()))
    }
}

/// One piece of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Logical message this fragment belongs to
    pub sequence: SeqNum,
    pub index: u16,
    pub count: u16,
    pub group: Group,
    pub data: Bytes,
}

impl Fragment {
    pub const HEADER_SIZE: usize = constants::FRAGMENT_HEADER_SIZE;

    pub fn new(sequence: SeqNum, index: u16, count: u16, group: Group, data: Bytes) -> Self {
        Self {
            sequence,
            index,
            count,
            group,
            data,
        }
    }

    /// Advertised payload length
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes occupied on the wire, header included
    pub fn wire_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence);
        buf.put_u16_le(self.index);
        buf.put_u16_le(self.count);
        buf.put_u16_le(self.group);
        buf.put_u16_le(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
    }
}

/// Packet body: either fragments or an opaque control body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Fragments(Vec<Fragment>),
    Control(Bytes),
}

/// One physical datagram, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: SeqNum,
    pub flags: PacketFlags,
    pub payload: Payload,
}

impl Packet {
    /// Sequenced data packet
    pub fn data(sequence: SeqNum, fragments: Vec<Fragment>) -> Self {
        Self {
            sequence,
            flags: PacketFlags::FRAGMENTED,
            payload: Payload::Fragments(fragments),
        }
    }

    /// Unsequenced control packet. `sequence` is informational only.
    pub fn control(sequence: SeqNum, flags: PacketFlags, body: Bytes) -> Self {
        Self {
            sequence,
            flags,
            payload: Payload::Control(body),
        }
    }

    pub fn login_request(login: Bytes) -> Self {
        Self::control(0, PacketFlags::LOGIN_REQUEST, login)
    }

    pub fn login_accepted(sequence: SeqNum) -> Self {
        Self::control(sequence, PacketFlags::LOGIN_ACCEPTED, Bytes::new())
    }

    pub fn disconnect(sequence: SeqNum) -> Self {
        Self::control(sequence, PacketFlags::DISCONNECT, Bytes::new())
    }

    /// Cumulative acknowledgment: every sequence before `expected_next` arrived.
    pub fn ack(sequence: SeqNum, expected_next: SeqNum) -> Self {
        Self::control(sequence, PacketFlags::ACK, u32_body(expected_next))
    }

    /// Keep-alive advertising the sender's next outbound sequence.
    pub fn keep_alive(horizon: SeqNum) -> Self {
        Self::control(horizon, PacketFlags::KEEP_ALIVE, u32_body(horizon))
    }

    pub fn retransmit_request(sequence: SeqNum, missing: &[SeqNum]) -> Self {
        let mut body = BytesMut::with_capacity(missing.len() * constants::SEQUENCE_SIZE);
        for seq in missing {
            body.put_u32_le(*seq);
        }
        Self::control(sequence, PacketFlags::RETRANSMIT_REQUEST, body.freeze())
    }

    pub fn is_sequenced(&self) -> bool {
        self.flags.is_sequenced()
    }

    pub fn fragments(&self) -> &[Fragment] {
        match &self.payload {
            Payload::Fragments(fragments) => fragments,
            Payload::Control(_) => &[],
        }
    }

    pub fn control_body(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Control(body) => Some(body),
            Payload::Fragments(_) => None,
        }
    }

    /// Payload length on the wire
    pub fn payload_len(&self) -> usize {
        match &self.payload {
            Payload::Fragments(fragments) => fragments.iter().map(Fragment::wire_len).sum(),
            Payload::Control(body) => body.len(),
        }
    }

    /// Read the single `u32` carried by ACK and KEEP_ALIVE bodies.
    pub fn body_u32(&self) -> Option<u32> {
        let body = self.control_body()?;
        if body.len() != constants::SEQUENCE_SIZE {
            return None;
        }
        Some(body.clone().get_u32_le())
    }

    /// Decode the sequence list of a RETRANSMIT_REQUEST body.
    pub fn requested_sequences(&self) -> Option<Vec<SeqNum>> {
        let body = self.control_body()?;
        if body.len() % constants::SEQUENCE_SIZE != 0 {
            return None;
        }
        let mut body = body.clone();
        let mut out = Vec::with_capacity(body.len() / constants::SEQUENCE_SIZE);
        while body.has_remaining() {
            out.push(body.get_u32_le());
        }
        Some(out)
    }
}

fn u32_body(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}
