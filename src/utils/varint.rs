use bytes::BufMut;

pub(crate) const MAX_VARINT_LEN_U32: usize = 5;
pub(crate) const MAX_VARINT_LEN_U64: usize = 10;

/// LEB128 style variable length integers: 7 bits per byte, low bits first, the high bit of
/// every byte except the last one is set.
pub(crate) trait VarInt: Sized + Copy {
    fn put_varint(&self, buf: &mut impl BufMut);

    /// Decodes a value from the front of `data`, returning it with the number of bytes read.
    /// `None` when `data` ends early or the encoding overflows `Self`.
    fn from_varint(data: &[u8]) -> Option<(Self, usize)>;
}

macro_rules! impl_varint {
    ($ty:ty, $max_len:expr) => {
        impl VarInt for $ty {
            fn put_varint(&self, buf: &mut impl BufMut) {
                let mut value = *self;
                while value >= 0b1000_0000 {
                    buf.put_u8((value as u8) | 0b1000_0000);
                    value >>= 7;
                }
                buf.put_u8(value as u8);
            }

            fn from_varint(data: &[u8]) -> Option<(Self, usize)> {
                let mut result: $ty = 0;
                for (i, &byte) in data.iter().take($max_len).enumerate() {
                    let shift = 7 * i as u32;
                    let part = ((byte & 0b0111_1111) as $ty).checked_shl(shift)?;
                    if (part >> shift) != (byte & 0b0111_1111) as $ty {
                        return None;
                    }
                    result |= part;
                    if byte & 0b1000_0000 == 0 {
                        return Some((result, i + 1));
                    }
                }
                None
            }
        }
    };
}

impl_varint!(u32, MAX_VARINT_LEN_U32);
impl_varint!(u64, MAX_VARINT_LEN_U64);

/// `| varint len | bytes |`
pub(crate) fn put_length_prefixed_slice(buf: &mut impl BufMut, data: &[u8]) {
    (data.len() as u32).put_varint(buf);
    buf.put_slice(data);
}

/// Reads a length prefixed slice, returning it with the total number of bytes consumed.
pub(crate) fn get_length_prefixed_slice(data: &[u8]) -> Option<(&[u8], usize)> {
    let (len, n) = u32::from_varint(data)?;
    let end = n.checked_add(len as usize)?;
    if end > data.len() {
        return None;
    }
    Some((&data[n..end], end))
}

#[cfg(test)]
mod tests {
    use super::{get_length_prefixed_slice, put_length_prefixed_slice, VarInt};

    #[test]
    fn trans_and_read_u32() {
        let cases: Vec<(u32, Vec<u8>)> = vec![
            (0b0_1111111, vec![0b0111_1111]),
            (0b1_1111111, vec![0xFF, 0x01]),
            (0b0010100_0101010, vec![0b10101010, 0b00010100]),
            (
                0b0010000_1010101_0101010,
                vec![0b10101010, 0b11010101, 0b00010000],
            ),
            (u32::MAX, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        ];

        for (value, expected) in cases {
            let mut buf = Vec::new();
            value.put_varint(&mut buf);
            assert_eq!(buf, expected);
            assert_eq!(u32::from_varint(&buf), Some((value, expected.len())));
        }
    }

    #[test]
    fn trans_and_read_u64() {
        let mut buf = Vec::new();
        u64::MAX.put_varint(&mut buf);
        assert_eq!(
            buf,
            vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]
        );
        assert_eq!(u64::from_varint(&buf), Some((u64::MAX, 10)));
    }

    #[test]
    fn overflow_and_truncation() {
        let mut buf = Vec::new();
        0xFF_FFFF_FFFFu64.put_varint(&mut buf);
        assert_eq!(u32::from_varint(&buf), None);

        // continuation bit set on the last available byte
        assert_eq!(u64::from_varint(&[0x80, 0x80]), None);
        assert_eq!(u64::from_varint(&[]), None);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let slice = [0xFF, 0x01, 0xAA, 0xBB];
        assert_eq!(u32::from_varint(&slice), Some((255, 2)));
    }

    #[test]
    fn length_prefixed() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, b"hello");
        put_length_prefixed_slice(&mut buf, b"");
        let (first, n) = get_length_prefixed_slice(&buf).unwrap();
        assert_eq!(first, b"hello");
        let (second, m) = get_length_prefixed_slice(&buf[n..]).unwrap();
        assert_eq!(second, b"");
        assert_eq!(n + m, buf.len());

        assert!(get_length_prefixed_slice(&buf[..3]).is_none());
    }
}
