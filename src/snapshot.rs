use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::db::format::SeqNumber;

/// Registry of live snapshots, a multiset of sequence numbers.
#[derive(Debug, Default)]
pub(crate) struct SnapshotList {
    seqs: Mutex<BTreeMap<SeqNumber, usize>>,
}

impl SnapshotList {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn acquire(self: &Arc<Self>, seq: SeqNumber) -> Snapshot {
        *self.seqs.lock().entry(seq).or_insert(0) += 1;
        Snapshot {
            inner: Arc::new(SnapshotInner {
                seq,
                list: Arc::downgrade(self),
            }),
        }
    }

    fn release(&self, seq: SeqNumber) {
        let mut seqs = self.seqs.lock();
        if let Some(count) = seqs.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                seqs.remove(&seq);
            }
        }
    }

    /// The oldest sequence number still visible to some reader.
    pub(crate) fn oldest(&self) -> Option<SeqNumber> {
        self.seqs.lock().keys().next().copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.seqs.lock().values().sum()
    }
}

struct SnapshotInner {
    seq: SeqNumber,
    list: Weak<SnapshotList>,
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.release(self.seq);
        }
    }
}

/// A consistent read view of the database.
///
/// Reads through a snapshot see exactly the writes committed before it was taken. Clones
/// share the registration, which is released when the last clone is dropped.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn sequence(&self) -> SeqNumber {
        self.inner.seq
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("seq", &self.inner.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::SnapshotList;

    #[test]
    fn oldest_follows_releases() {
        let list = SnapshotList::new();
        assert_eq!(list.oldest(), None);

        let s5 = list.acquire(5);
        let s3 = list.acquire(3);
        let s3_again = list.acquire(3);
        let s3_clone = s3.clone();
        assert_eq!(list.oldest(), Some(3));
        assert_eq!(list.len(), 3);

        drop(s3);
        assert_eq!(list.oldest(), Some(3));
        drop(s3_clone);
        assert_eq!(list.oldest(), Some(3));
        drop(s3_again);
        assert_eq!(list.oldest(), Some(5));
        assert_eq!(s5.sequence(), 5);

        drop(s5);
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn outlives_list() {
        let list = SnapshotList::new();
        let snapshot = list.acquire(1);
        drop(list);
        assert_eq!(snapshot.sequence(), 1);
    }
}
