use std::cmp::Ordering;

/// A total order over user keys.
///
/// The name is persisted in the manifest when a database is created and checked on every
/// later open, so two comparators with different orders must never share a name.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn name(&self) -> &str;

    /// Returns a key `k` with `start <= k < limit`, preferably shorter than `start`.
    /// Returning `start` unchanged is always correct.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a key `k >= key`, preferably short. Returning `key` is always correct.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &str {
        "arisdb.BytewiseComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let min_len = start.len().min(limit.len());
        let mut diff_index = 0;
        while diff_index < min_len && start[diff_index] == limit[diff_index] {
            diff_index += 1;
        }

        // one key is a prefix of the other
        if diff_index >= min_len {
            return start.to_vec();
        }

        let diff = start[diff_index];
        if diff != 0xff && diff + 1 < limit[diff_index] {
            let mut res = start[..=diff_index].to_vec();
            res[diff_index] += 1;
            return res;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        for (i, &b) in key.iter().enumerate() {
            if b != 0xff {
                let mut res = key[..=i].to_vec();
                res[i] += 1;
                return res;
            }
        }
        key.to_vec()
    }
}
