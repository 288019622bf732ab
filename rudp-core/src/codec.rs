//! Packet codec: datagram validation, parsing and serialization.

use crate::checksum::Checksum;
use crate::config::CoreConfig;
use crate::error::{CoreError, DecodeError};
use crate::protocol::{constants, Fragment, Packet, PacketFlags, PacketHeader, Payload};

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

/// Stateless packet codec shared by every session of a listener.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    checksum: Arc<dyn Checksum>,
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(checksum: Arc<dyn Checksum>, max_packet_size: usize) -> Self {
        Self {
            checksum,
            max_packet_size,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.checksum.clone(), config.max_packet_size)
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Validate and decode one datagram.
    ///
    /// Checks run cheapest first: length bounds, checksum, flags, then
    /// payload structure. Nothing is allocated beyond the fragment list; every
    /// fragment shares the datagram's buffer.
    pub fn parse(&self, raw: Bytes) -> Result<Packet, DecodeError> {
        let len = raw.len();
        if len < constants::MIN_HEADER_SIZE {
            return Err(DecodeError::TooShort { len });
        }
        if len > self.max_packet_size {
            return Err(DecodeError::TooLarge {
                len,
                max: self.max_packet_size,
            });
        }

        let mut cursor = &raw[..];
        let (sequence, bits, expected) =
            PacketHeader::decode_raw(&mut cursor).ok_or(DecodeError::TooShort { len })?;

        let actual = self.checksum.compute(&[
            &raw[..constants::CHECKSUM_OFFSET],
            &[0u8; 4],
            &raw[constants::PACKET_HEADER_SIZE..],
        ]);
        if actual != expected {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        let flags = PacketFlags::from_bits(bits).ok_or(DecodeError::InvalidFlags { bits })?;
        let body = raw.slice(constants::PACKET_HEADER_SIZE..);

        let payload = if flags == PacketFlags::FRAGMENTED {
            Payload::Fragments(decode_fragments(&body)?)
        } else if bits.count_ones() == 1 {
            validate_control(flags, &body)?;
            Payload::Control(body)
        } else {
            return Err(DecodeError::InvalidFlags { bits });
        };

        Ok(Packet {
            sequence,
            flags,
            payload,
        })
    }

    /// Exact inverse of [`parse`](Self::parse): header with a zeroed checksum
    /// field, payload, then the checksum backpatched.
    pub fn serialize(&self, packet: &Packet) -> Result<Bytes, CoreError> {
        let len = constants::PACKET_HEADER_SIZE + packet.payload_len();
        if len > self.max_packet_size {
            return Err(CoreError::Encode {
                len,
                max: self.max_packet_size,
            });
        }

        let mut buf = BytesMut::with_capacity(len);
        PacketHeader {
            sequence: packet.sequence,
            flags: packet.flags,
            checksum: 0,
        }
        .encode(&mut buf);

        match &packet.payload {
            Payload::Fragments(fragments) => {
                for fragment in fragments {
                    fragment.encode(&mut buf);
                }
            }
            Payload::Control(body) => buf.extend_from_slice(body),
        }

        let checksum = self.checksum.compute(&[&buf]);
        buf[constants::CHECKSUM_OFFSET..constants::PACKET_HEADER_SIZE]
            .copy_from_slice(&checksum.to_le_bytes());

        Ok(buf.freeze())
    }
}

fn decode_fragments(body: &Bytes) -> Result<Vec<Fragment>, DecodeError> {
    let total = body.len();
    let mut fragments = Vec::new();
    let mut offset = 0;

    while offset < total {
        if total - offset < Fragment::HEADER_SIZE {
            return Err(DecodeError::TruncatedFragment { offset });
        }

        let mut header = &body[offset..offset + Fragment::HEADER_SIZE];
        let sequence = header.get_u32_le();
        let index = header.get_u16_le();
        let count = header.get_u16_le();
        let group = header.get_u16_le();
        let size = header.get_u16_le() as usize;

        let start = offset + Fragment::HEADER_SIZE;
        let end = start + size;
        if end > total {
            return Err(DecodeError::FragmentLengthMismatch {
                declared: end,
                actual: total,
            });
        }
        if index >= count {
            return Err(DecodeError::FragmentIndexOutOfRange { index, count });
        }
        if size == 0 {
            return Err(DecodeError::EmptyFragment { sequence });
        }

        fragments.push(Fragment::new(sequence, index, count, group, body.slice(start..end)));
        offset = end;
    }

    if fragments.is_empty() {
        return Err(DecodeError::NoFragments);
    }
    Ok(fragments)
}

fn validate_control(flags: PacketFlags, body: &Bytes) -> Result<(), DecodeError> {
    let len = body.len();
    let valid = if flags == PacketFlags::ACK || flags == PacketFlags::KEEP_ALIVE {
        len == constants::SEQUENCE_SIZE
    } else if flags == PacketFlags::RETRANSMIT_REQUEST {
        len > 0 && len % constants::SEQUENCE_SIZE == 0
    } else {
        true
    };

    if valid {
        Ok(())
    } else {
        Err(DecodeError::InvalidControlBody {
            flags: flags.bits(),
            len,
        })
    }
}
