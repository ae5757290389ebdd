pub mod internal_key;
pub mod lookup_key;

pub use internal_key::{
    extract_user_key, parse_internal_key, InternalKey, InternalKeyComparator, ParsedInternalKey,
    INTERNAL_KEY_TAIL_SIZE,
};
pub use lookup_key::LookupKey;

/// Only the lower 7 bytes are used, the last byte of the packed tag holds the value type.
///
/// ```text
///     +-------------------------------------------+
///     | seq number: 7 bytes | value type: 1 byte  |
///     +-------------------------------------------+
/// ```
pub type SeqNumber = u64;

pub const MAX_SEQ: SeqNumber = 0x00FF_FFFF_FFFF_FFFF;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Mark the key is deleted. The value is not used (zero length).
    Deletion = 0,

    /// This means that the key is inserted or update with the value.
    Value = 1,
}

/// The type used when building a key to seek to. Tags sort descending, so with an equal
/// sequence number the highest type comes first.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(other),
        }
    }
}

pub(crate) fn pack_value_type_and_seq(seq: SeqNumber, value_type: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQ);
    (seq << 8) | value_type as u64
}

pub(crate) fn unpack_value_type_and_seq(data: u64) -> Option<(SeqNumber, ValueType)> {
    let seq = data >> 8;
    let value_type = ValueType::try_from((data & 0xFF) as u8).ok()?;

    Some((seq, value_type))
}

#[cfg(test)]
mod tests {
    use super::{pack_value_type_and_seq, unpack_value_type_and_seq, ValueType, MAX_SEQ};

    #[test]
    fn pack_and_unpack() {
        for seq in [0, 1, 100, MAX_SEQ] {
            for ty in [ValueType::Deletion, ValueType::Value] {
                let packed = pack_value_type_and_seq(seq, ty);
                assert_eq!(unpack_value_type_and_seq(packed), Some((seq, ty)));
            }
        }
        assert_eq!(unpack_value_type_and_seq((7 << 8) | 9), None);
    }
}
