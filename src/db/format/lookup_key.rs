use bytes::{Bytes, BytesMut};

use super::{internal_key::InternalKey, SeqNumber, INTERNAL_KEY_TAIL_SIZE, VALUE_TYPE_FOR_SEEK};

/// A key used to look up a value in a memtable or a table.
///
/// It is an internal key built with the sequence ceiling and the seek type, so seeking to it
/// lands on the newest entry of the user key that is visible at `seq`.
///
/// | user key | seq, vtype |
#[derive(Clone)]
pub struct LookupKey {
    bytes: Bytes,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SeqNumber) -> Self {
        let mut buf = BytesMut::with_capacity(user_key.len() + INTERNAL_KEY_TAIL_SIZE);
        InternalKey::extern_buf(&mut buf, user_key, seq, VALUE_TYPE_FOR_SEEK);

        Self {
            bytes: buf.freeze(),
        }
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.bytes
    }

    pub fn user_key(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - INTERNAL_KEY_TAIL_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use crate::db::format::{internal_key::InternalKey, lookup_key::LookupKey, ValueType};

    #[test]
    fn new_lookup_key() {
        let user_key = b"hello";
        let seq = 100;

        let lookup_key = LookupKey::new(user_key, seq);
        let internal_key = InternalKey::new(user_key, seq, ValueType::Value);

        assert_eq!(lookup_key.internal_key(), internal_key.as_slice());
        assert_eq!(lookup_key.user_key(), user_key);
    }
}
