use std::{
    cmp::Ordering,
    ops::Bound,
    sync::{
        atomic::{self, AtomicUsize},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use crossbeam_skiplist::SkipMap;

use crate::{
    comparator::Comparator,
    db::format::{
        parse_internal_key, InternalKey, InternalKeyComparator, LookupKey, SeqNumber, ValueType,
        INTERNAL_KEY_TAIL_SIZE,
    },
    error::Result,
    iterator::DBIterator,
};

/// Skip list key, an internal key carrying the comparator that orders it.
#[derive(Clone)]
struct MemKey {
    key: Bytes,
    cmp: InternalKeyComparator,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.key, &other.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(Bytes),
    /// The newest visible entry is a tombstone, older layers must not be consulted.
    Deleted,
}

/// In-memory write buffer, sorted by internal key.
///
/// Entries are never updated or removed, a delete is an insert of a tombstone.
#[derive(Clone)]
pub struct MemTable {
    inner: Arc<MemTableInner>,
}

impl MemTable {
    #[inline]
    pub fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            inner: Arc::new(MemTableInner::new(cmp)),
        }
    }

    #[inline]
    pub fn approximate_memory_usage(&self) -> usize {
        self.inner.approximate_memory_usage()
    }

    #[inline]
    pub fn add(&self, seq: SeqNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        self.inner.add(seq, value_type, key, value);
    }

    #[inline]
    pub fn get(&self, key: &LookupKey) -> Option<LookupResult> {
        self.inner.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    pub fn iter(&self) -> MemTableIterator {
        MemTableIterator {
            mem: self.clone(),
            current: None,
        }
    }
}

struct MemTableInner {
    table: SkipMap<MemKey, Bytes>,
    cmp: InternalKeyComparator,
    mem_usage: AtomicUsize,
}

impl MemTableInner {
    fn new(cmp: InternalKeyComparator) -> Self {
        Self {
            table: SkipMap::new(),
            cmp,
            mem_usage: AtomicUsize::new(0),
        }
    }

    fn approximate_memory_usage(&self) -> usize {
        self.mem_usage.load(atomic::Ordering::Acquire)
    }

    fn make_key(&self, key: Bytes) -> MemKey {
        MemKey {
            key,
            cmp: self.cmp.clone(),
        }
    }

    /// Insert an internal key into the memtable.
    ///
    /// Key format like this:
    ///
    /// ```text
    ///     +-----------------------------------------------+
    ///     | key bytes | seq num: 7 bytes | type: 1 byte   |
    ///     +-----------------------------------------------+
    /// ```
    fn add(&self, seq: SeqNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        let mut buf = BytesMut::with_capacity(key.len() + INTERNAL_KEY_TAIL_SIZE);
        InternalKey::extern_buf(&mut buf, key, seq, value_type);

        // Node overhead: tower pointers and the refcounted handles.
        let mem_use = buf.len() + value.len() + 64;
        self.table
            .insert(self.make_key(buf.freeze()), Bytes::copy_from_slice(value));
        self.mem_usage.fetch_add(mem_use, atomic::Ordering::Release);
    }

    fn get(&self, key: &LookupKey) -> Option<LookupResult> {
        let target = self.make_key(Bytes::copy_from_slice(key.internal_key()));
        let entry = self.table.lower_bound(Bound::Included(&target))?;

        let parsed = parse_internal_key(&entry.key().key)?;
        if self
            .cmp
            .user_comparator()
            .compare(parsed.user_key, key.user_key())
            .is_ne()
        {
            return None;
        }

        match parsed.value_type {
            ValueType::Value => Some(LookupResult::Found(entry.value().clone())),
            ValueType::Deletion => Some(LookupResult::Deleted),
        }
    }
}

/// Yields internal keys in comparator order. Keeps the memtable alive.
pub struct MemTableIterator {
    mem: MemTable,
    current: Option<(MemKey, Bytes)>,
}

impl MemTableIterator {
    fn set_current(
        &mut self,
        entry: Option<crossbeam_skiplist::map::Entry<'_, MemKey, Bytes>>,
    ) {
        self.current = entry.map(|e| (e.key().clone(), e.value().clone()));
    }
}

impl DBIterator for MemTableIterator {
    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let table = &self.mem.inner.table;
        self.current = table.front().map(|e| (e.key().clone(), e.value().clone()));
    }

    fn seek_to_last(&mut self) {
        let table = &self.mem.inner.table;
        self.current = table.back().map(|e| (e.key().clone(), e.value().clone()));
    }

    fn seek(&mut self, target: &[u8]) {
        let mem = self.mem.clone();
        let target = mem.inner.make_key(Bytes::copy_from_slice(target));
        self.set_current(mem.inner.table.lower_bound(Bound::Included(&target)));
    }

    fn next(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        let mem = self.mem.clone();
        self.set_current(mem.inner.table.lower_bound(Bound::Excluded(&cur)));
    }

    fn prev(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        let mem = self.mem.clone();
        self.set_current(mem.inner.table.upper_bound(Bound::Excluded(&cur)));
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        self.current
            .as_ref()
            .map(|(k, _)| k.key.as_ref())
            .unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        self.current
            .as_ref()
            .map(|(_, v)| v.as_ref())
            .unwrap_or_default()
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cmp::Ordering, sync::Arc};

    use bytes::Bytes;

    use crate::{
        comparator::{BytewiseComparator, Comparator},
        db::format::{extract_user_key, InternalKeyComparator, LookupKey, ValueType},
        iterator::DBIterator,
    };

    use super::{LookupResult, MemTable};

    fn new_memtable() -> MemTable {
        MemTable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    #[test]
    fn get_respects_sequence() {
        let mem = new_memtable();
        mem.add(1, ValueType::Value, b"k1", b"v1");
        mem.add(2, ValueType::Value, b"k1", b"v2");
        mem.add(3, ValueType::Deletion, b"k1", b"");
        mem.add(4, ValueType::Value, b"k2", b"x");

        assert_eq!(mem.get(&LookupKey::new(b"k1", 0)), None);
        assert_eq!(
            mem.get(&LookupKey::new(b"k1", 1)),
            Some(LookupResult::Found(Bytes::from_static(b"v1")))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k1", 2)),
            Some(LookupResult::Found(Bytes::from_static(b"v2")))
        );
        assert_eq!(
            mem.get(&LookupKey::new(b"k1", 10)),
            Some(LookupResult::Deleted)
        );
        assert_eq!(mem.get(&LookupKey::new(b"k0", 10)), None);
        assert_eq!(mem.get(&LookupKey::new(b"k3", 10)), None);
        assert_eq!(mem.len(), 4);
        assert!(mem.approximate_memory_usage() > 0);
    }

    #[test]
    fn iterate_both_directions() {
        let mem = new_memtable();
        for (seq, key) in [b"c", b"a", b"b"].iter().enumerate() {
            mem.add(seq as u64 + 1, ValueType::Value, *key, *key);
        }
        mem.add(9, ValueType::Value, b"b", b"b9");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut forward = vec![];
        while iter.is_valid() {
            forward.push((extract_user_key(iter.key()).to_vec(), iter.value().to_vec()));
            iter.next();
        }
        assert_eq!(
            forward,
            vec![
                (b"a".to_vec(), b"a".to_vec()),
                (b"b".to_vec(), b"b9".to_vec()),
                (b"b".to_vec(), b"b".to_vec()),
                (b"c".to_vec(), b"c".to_vec()),
            ]
        );

        iter.seek_to_last();
        let mut backward = vec![];
        while iter.is_valid() {
            backward.push((extract_user_key(iter.key()).to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        backward.reverse();
        assert_eq!(forward, backward);

        iter.seek(LookupKey::new(b"b", 5).internal_key());
        assert!(iter.is_valid());
        assert_eq!(iter.value(), b"b");
        iter.prev();
        assert_eq!(iter.value(), b"b9");
    }

    struct ReverseComparator;

    impl Comparator for ReverseComparator {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }

        fn name(&self) -> &str {
            "test.Reverse"
        }

        fn find_shortest_separator(&self, start: &[u8], _limit: &[u8]) -> Vec<u8> {
            start.to_vec()
        }

        fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
            key.to_vec()
        }
    }

    #[test]
    fn custom_comparator_order() {
        let mem = MemTable::new(InternalKeyComparator::new(Arc::new(ReverseComparator)));
        mem.add(1, ValueType::Value, b"a", b"");
        mem.add(2, ValueType::Value, b"c", b"");
        mem.add(3, ValueType::Value, b"b", b"");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut keys = vec![];
        while iter.is_valid() {
            keys.push(extract_user_key(iter.key()).to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }
}
