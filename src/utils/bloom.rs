use super::hash::BasicHash;

/// Largest hash count a filter may record. Larger values in the trailing byte are left for
/// other encodings and match everything.
const MAX_HASHES: u8 = 30;

/// Filter bits are never fewer than this, tiny key sets would see a high false positive
/// rate otherwise.
const MIN_FILTER_BITS: usize = 64;

/// Parameters of the bloom filters built for table filter blocks.
///
/// An encoded filter is the bit array followed by one byte holding the hash count, so a
/// reader never needs the parameters it was built with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bloom {
    hashes: u8,
    bits_per_key: usize,
}

impl Bloom {
    pub(crate) fn new(bits_per_key: usize) -> Self {
        // ln(2) * bits per key minimizes the false positive rate
        let hashes = (bits_per_key as f64 * 0.69) as usize;
        Self {
            hashes: hashes.clamp(1, MAX_HASHES as usize) as u8,
            bits_per_key,
        }
    }

    #[cfg(test)]
    pub(crate) fn hashes(&self) -> u8 {
        self.hashes
    }

    /// Encodes a filter over `keys`.
    pub(crate) fn build<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<u8> {
        let bytes = (keys.len() * self.bits_per_key).max(MIN_FILTER_BITS).div_ceil(8);
        let bits = (bytes * 8) as u32;

        let mut filter = vec![0u8; bytes + 1];
        for key in keys {
            for bit in bit_positions(key.as_ref(), self.hashes, bits) {
                filter[bit as usize / 8] |= 1 << (bit % 8);
            }
        }
        filter[bytes] = self.hashes;
        filter
    }

    /// `false` only when `key` was certainly not passed to `build`.
    pub(crate) fn key_may_match(filter: &[u8], key: &[u8]) -> bool {
        let Some((&hashes, array)) = filter.split_last() else {
            return false;
        };
        if array.is_empty() {
            return false;
        }
        if hashes > MAX_HASHES {
            return true;
        }

        let bits = (array.len() * 8) as u32;
        bit_positions(key, hashes, bits)
            .all(|bit| array[bit as usize / 8] & (1 << (bit % 8)) != 0)
    }
}

/// Double hashing: one hash, rotated into the step between positions.
fn bit_positions(key: &[u8], hashes: u8, bits: u32) -> impl Iterator<Item = u32> {
    let mut h = key.gen_basic_hash();
    let delta = h.rotate_right(17);
    (0..hashes).map(move |_| {
        let bit = h % bits;
        h = h.wrapping_add(delta);
        bit
    })
}
