use crate::utils::bloom::Bloom;

/// Builds compact summaries of a set of keys that can answer "definitely absent".
pub trait FilterPolicy: Send + Sync {
    /// Persisted in the table's meta-index; a table whose filter was built by a policy
    /// with another name simply isn't filtered.
    fn name(&self) -> &str;

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Must return `true` for every key that was passed to `create_filter`.
    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool;
}

pub struct BloomFilterPolicy {
    bloom: Bloom,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bloom: Bloom::new(bits_per_key),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &str {
        "arisdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        self.bloom.build(keys)
    }

    fn may_contain(&self, filter: &[u8], key: &[u8]) -> bool {
        Bloom::key_may_match(filter, key)
    }
}
