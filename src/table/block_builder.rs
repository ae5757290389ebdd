use std::sync::Arc;

use bytes::BufMut;

use crate::{comparator::Comparator, utils::varint::VarInt};

use super::SIZE_U32;

/// Builds a prefix compressed block.
///
/// ```text
///     | entry 1 | ... | entry n | restart 1: u32 le | ... | restart k: u32 le | k: u32 le |
///
///     entry: | shared key len | non-shared key len | value len | non-shared key | value |
/// ```
///
/// Every `restart_interval` entries the full key is stored and its offset is recorded as a
/// restart point, so readers can binary search them.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,

    last_key: Vec<u8>,

    restart_interval: usize,
    comparator: Arc<dyn Comparator>,
    counter: usize,

    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize, comparator: Arc<dyn Comparator>) -> Self {
        assert!(restart_interval > 0, "required restart_interval > 0");

        Self {
            buf: Vec::new(),
            restarts: vec![0], // First restart point is at offset 0,
            last_key: Vec::new(),
            restart_interval,
            comparator,
            counter: 0,
            finished: false,
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(
            !self.finished,
            "block builder finished, should not add more"
        );
        debug_assert!(self.counter <= self.restart_interval);
        debug_assert!(
            self.buf.is_empty() || self.comparator.compare(key, &self.last_key).is_gt(),
            "key is not greater than last key, key: {:?}, last key: {:?}",
            key,
            self.last_key
        );

        let mut shared = 0;
        if self.counter < self.restart_interval {
            // try match
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // new restart
            self.restarts.push(self.buf.len() as u32);
            self.counter = 0;
        }

        let non_shared = key.len() - shared;

        // | shared key len | non-shared key len | value len | non-shared key | value |
        (shared as u32).put_varint(&mut self.buf);
        (non_shared as u32).put_varint(&mut self.buf);
        (value.len() as u32).put_varint(&mut self.buf);

        self.buf.put(&key[shared..]);
        self.buf.put(value);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);

        self.counter += 1;
    }

    pub fn finish(&mut self) -> &[u8] {
        assert!(!self.finished);
        for offset in self.restarts.iter() {
            self.buf.put_u32_le(*offset);
        }
        self.buf.put_u32_le(self.restarts.len() as u32);
        self.finished = true;
        &self.buf
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * SIZE_U32 + SIZE_U32
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.finished = false;
        self.counter = 0;
        self.restarts.clear();
        self.restarts.push(0);
        self.last_key.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::comparator::BytewiseComparator;

    use super::BlockBuilder;

    #[test]
    fn build_new_block() {
        let inputs = vec!["a", "ab", "abc", "acd", "adc", "bcd", "bde", "eee"];

        let mut builder = BlockBuilder::new(3, Arc::new(BytewiseComparator));

        for input in inputs.iter() {
            builder.add(input.as_bytes(), input.as_bytes());
        }
        let size_estimate = builder.current_size_estimate();
        let block_len = builder.finish().len();

        assert_eq!(builder.restarts, vec![0, 18, 44]);
        assert_eq!(block_len, size_estimate);
    }

    #[test]
    fn reset_reuses_builder() {
        let mut builder = BlockBuilder::new(16, Arc::new(BytewiseComparator));
        builder.add(b"k", b"v");
        builder.finish();
        builder.reset();
        assert!(builder.is_empty());
        builder.add(b"a", b"v");
        assert_eq!(builder.finish().len(), 5 + 4 + 4);
    }
}
