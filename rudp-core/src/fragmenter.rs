//! Outbound message fragmentation.

use crate::error::CoreError;
use crate::protocol::{constants, Fragment, Group, Opcode, SeqNum};

use bytes::{BufMut, BytesMut};

/// Splits logical messages into MTU-safe fragments.
///
/// Every fragment except the last carries exactly `max_fragment_payload`
/// bytes; receivers derive fragment offsets from that stride.
#[derive(Debug)]
pub struct Fragmenter {
    next_message: SeqNum,
    max_fragment_payload: usize,
    max_message_size: usize,
}

impl Fragmenter {
    pub fn new(max_fragment_payload: usize, max_message_size: usize) -> Self {
        Self {
            next_message: 0,
            max_fragment_payload: max_fragment_payload.max(1),
            max_message_size,
        }
    }

    /// Id the next message will receive
    pub fn next_message(&self) -> SeqNum {
        self.next_message
    }

    /// Prepend `opcode` to `payload` and cut the result into fragments.
    pub fn split(
        &mut self,
        group: Group,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<Vec<Fragment>, CoreError> {
        let size = constants::OPCODE_SIZE + payload.len();
        if size > self.max_message_size {
            return Err(CoreError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        let count = size.div_ceil(self.max_fragment_payload);
        if count > u16::MAX as usize {
            return Err(CoreError::MessageTooLarge {
                size,
                max: self.max_fragment_payload * u16::MAX as usize,
            });
        }

        let mut message = BytesMut::with_capacity(size);
        message.put_u16_le(opcode);
        message.extend_from_slice(payload);
        let message = message.freeze();

        let sequence = self.next_message;
        self.next_message = self.next_message.wrapping_add(1);

        let fragments = (0..count)
            .map(|i| {
                let start = i * self.max_fragment_payload;
                let end = (start + self.max_fragment_payload).min(size);
                Fragment::new(sequence, i as u16, count as u16, group, message.slice(start..end))
            })
            .collect();

        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fragment() {
        let mut fragmenter = Fragmenter::new(100, 1024);
        let fragments = fragmenter.split(1, 0x0102, b"abc").unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(&fragments[0].data[..], &[0x02, 0x01, b'a', b'b', b'c']);
        assert_eq!(fragmenter.next_message(), 1);
    }

    #[test]
    fn test_uniform_stride() {
        let mut fragmenter = Fragmenter::new(468, 4096);
        let payload = vec![7u8; 1998];
        let fragments = fragmenter.split(9, 1, &payload).unwrap();
        let sizes: Vec<usize> = fragments.iter().map(|f| f.size()).collect();
        assert_eq!(sizes, vec![468, 468, 468, 468, 128]);
        assert!(fragments.iter().all(|f| f.count == 5 && f.group == 9));
        assert!(fragments[4].is_last());
    }

    #[test]
    fn test_exact_multiple() {
        let mut fragmenter = Fragmenter::new(4, 1024);
        let fragments = fragmenter.split(0, 0, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].size(), 4);
    }

    #[test]
    fn test_too_large() {
        let mut fragmenter = Fragmenter::new(100, 10);
        assert_eq!(
            fragmenter.split(0, 0, &[0u8; 9]),
            Err(CoreError::MessageTooLarge { size: 11, max: 10 })
        );
        assert_eq!(fragmenter.next_message(), 0);
    }
}
