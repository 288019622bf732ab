//! Pluggable 32-bit packet checksums.
//!
//! The checksum covers the packet header with its checksum field zeroed,
//! followed by the payload. Both peers must agree on the implementation.

use std::fmt;

/// Deterministic 32-bit hash over a sequence of byte chunks.
///
/// Chunks are hashed as if concatenated, so the codec can skip the checksum
/// field without copying the datagram.
pub trait Checksum: Send + Sync + fmt::Debug + 'static {
    fn compute(&self, chunks: &[&[u8]]) -> u32;
}

/// CRC-32 (IEEE). Default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32;

impl Checksum for Crc32 {
    fn compute(&self, chunks: &[&[u8]]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        hasher.finalize()
    }
}

/// 32-bit FNV-1a.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1a32;

impl Fnv1a32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
}

impl Checksum for Fnv1a32 {
    fn compute(&self, chunks: &[&[u8]]) -> u32 {
        let mut hash = Self::OFFSET_BASIS;
        for chunk in chunks {
            for byte in chunk.iter() {
                hash ^= *byte as u32;
                hash = hash.wrapping_mul(Self::PRIME);
            }
        }
        hash
    }
}
