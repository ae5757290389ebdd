const SEED: u32 = 0xbc9f1d34;
const M: u32 = 0xc6a4a793;
const R: u32 = 24;

/// Murmur-like 32 bit hash used by the bloom filter.
pub(crate) fn basic_hash(data: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ M.wrapping_mul(data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if rest.len() == 3 {
        h = h.wrapping_add((rest[2] as u32) << 16);
    }
    if rest.len() >= 2 {
        h = h.wrapping_add((rest[1] as u32) << 8);
    }
    if !rest.is_empty() {
        h = h.wrapping_add(rest[0] as u32);
        h = h.wrapping_mul(M);
        h ^= h >> R;
    }
    h
}

pub(crate) trait BasicHash {
    fn gen_basic_hash(&self) -> u32;
}

impl<T> BasicHash for T
where
    T: AsRef<[u8]> + ?Sized,
{
    fn gen_basic_hash(&self) -> u32 {
        basic_hash(self.as_ref(), SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::{basic_hash, BasicHash};

    #[test]
    fn stable_values() {
        assert_eq!(basic_hash(b"", 0xbc9f1d34), 0xbc9f1d34);
        assert_eq!(b"".gen_basic_hash(), 0xbc9f1d34);
        // every tail length goes through a different branch
        let hashes: Vec<u32> = (0..8)
            .map(|n| basic_hash(&b"abcdefgh"[..n], 0xbc9f1d34))
            .collect();
        for i in 0..hashes.len() {
            for j in i + 1..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }

    #[test]
    fn same_bytes_same_hash() {
        let v = b"hello".to_vec();
        assert_eq!(v.gen_basic_hash(), "hello".gen_basic_hash());
        assert_eq!(basic_hash(b"hello", 1), basic_hash(b"hello", 1));
        assert_ne!(basic_hash(b"hello", 1), basic_hash(b"hello", 2));
    }
}
