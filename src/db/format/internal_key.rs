use std::{cmp::Ordering, fmt, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::comparator::Comparator;

use super::{pack_value_type_and_seq, unpack_value_type_and_seq, SeqNumber, ValueType, MAX_SEQ};

pub const INTERNAL_KEY_TAIL_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub seq: SeqNumber,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    pub fn new(user_key: &'a [u8], seq: SeqNumber, value_type: ValueType) -> Self {
        Self {
            user_key,
            seq,
            value_type,
        }
    }

    pub fn encode(&self) -> InternalKey {
        InternalKey::new(self.user_key, self.seq, self.value_type)
    }
}

/// `None` when the key is too short or the type byte is unknown.
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if internal_key.len() < INTERNAL_KEY_TAIL_SIZE {
        return None;
    }
    let split = internal_key.len() - INTERNAL_KEY_TAIL_SIZE;
    let (seq, value_type) = unpack_value_type_and_seq((&internal_key[split..]).get_u64())?;
    Some(ParsedInternalKey::new(&internal_key[..split], seq, value_type))
}

pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_TAIL_SIZE);
    &internal_key[..internal_key.len().saturating_sub(INTERNAL_KEY_TAIL_SIZE)]
}

fn extract_tag(internal_key: &[u8]) -> u64 {
    if internal_key.len() < INTERNAL_KEY_TAIL_SIZE {
        return 0;
    }
    (&internal_key[internal_key.len() - INTERNAL_KEY_TAIL_SIZE..]).get_u64()
}

/// The internal key is used to store the key and value type.
///
/// The format like this:
///
/// | user key | seq, vtype |
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    bytes: Bytes,
}

impl InternalKey {
    pub fn extern_buf(buf: &mut impl BufMut, key: &[u8], seq: SeqNumber, value_type: ValueType) {
        buf.put(key);
        buf.put_u64(pack_value_type_and_seq(seq, value_type));
    }

    pub fn new(key: &[u8], seq: SeqNumber, value_type: ValueType) -> Self {
        let mut buf = BytesMut::with_capacity(key.len() + INTERNAL_KEY_TAIL_SIZE);
        Self::extern_buf(&mut buf, key, seq, value_type);

        Self {
            bytes: buf.freeze(),
        }
    }

    /// Wraps already encoded bytes. The caller is responsible for the format, use
    /// `parse` to validate.
    pub fn decode_from(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.bytes)
    }

    pub fn parse(&self) -> Option<ParsedInternalKey<'_>> {
        parse_internal_key(&self.bytes)
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parse() {
            Some(p) => write!(
                f,
                "'{}' @ {} : {:?}",
                p.user_key.escape_ascii(),
                p.seq,
                p.value_type
            ),
            None => write!(f, "(bad){:?}", self.bytes),
        }
    }
}

/// Orders internal keys by user key ascending (per the user comparator), then by sequence
/// number descending, so the newest version of a user key comes first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    pub fn compare_internal_key(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.as_slice(), b.as_slice())
    }
}

impl Comparator for InternalKeyComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
            .then_with(|| extract_tag(b).cmp(&extract_tag(a)))
    }

    fn name(&self) -> &str {
        "arisdb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = self
            .user_comparator
            .find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len() && self.user_comparator.compare(user_start, &tmp).is_lt()
        {
            // The user key became shorter but larger; the earliest possible tag keeps the
            // separator below every entry of `limit`'s user key.
            tmp.put_u64(pack_value_type_and_seq(MAX_SEQ, super::VALUE_TYPE_FOR_SEEK));
            debug_assert!(self.compare(start, &tmp).is_lt());
            debug_assert!(self.compare(&tmp, limit).is_lt());
            return tmp;
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let mut tmp = self.user_comparator.find_short_successor(user_key);
        if tmp.len() < user_key.len() && self.user_comparator.compare(user_key, &tmp).is_lt() {
            tmp.put_u64(pack_value_type_and_seq(MAX_SEQ, super::VALUE_TYPE_FOR_SEEK));
            debug_assert!(self.compare(key, &tmp).is_lt());
            return tmp;
        }
        key.to_vec()
    }
}
