use bytes::{Buf, BufMut, Bytes};

use crate::{
    db::format::{SeqNumber, ValueType},
    error::{Error, Result},
    memtable::MemTable,
    utils::varint::{get_length_prefixed_slice, put_length_prefixed_slice},
};

/// `| seq: 8 bytes | count: 4 bytes |`
pub(crate) const WRITE_BATCH_HEADER_SIZE: usize = 12;

/// Callbacks for the operations of a batch, in insertion order.
pub trait WriteBatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);
}

/// A group of updates applied atomically.
///
/// The encoded form is also the payload of a log record:
///
/// ```text
///     +--------------------------------------------+
///     | seq: u64 le | count: u32 le | records ...  |
///     +--------------------------------------------+
///
///     record: | type: u8 | varint key len | key | (varint value len | value) |
/// ```
///
/// The value part only exists for puts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self {
            rep: vec![0; WRITE_BATCH_HEADER_SIZE],
        }
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
        put_length_prefixed_slice(&mut self.rep, value.as_ref());
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(WRITE_BATCH_HEADER_SIZE, 0);
    }

    pub fn count(&self) -> u32 {
        (&self.rep[8..WRITE_BATCH_HEADER_SIZE]).get_u32_le()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size of the encoded batch.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends the operations of `other` after the ones in `self`.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep
            .extend_from_slice(&other.rep[WRITE_BATCH_HEADER_SIZE..]);
    }

    pub fn iterate(&self, handler: &mut impl WriteBatchHandler) -> Result<()> {
        let mut input = &self.rep[WRITE_BATCH_HEADER_SIZE..];
        let mut found = 0;

        while !input.is_empty() {
            found += 1;
            let tag = input.get_u8();
            let (key, n) = get_length_prefixed_slice(input)
                .ok_or_else(|| Error::Corruption("bad WriteBatch key".into()))?;
            input = &input[n..];

            match ValueType::try_from(tag) {
                Ok(ValueType::Value) => {
                    let (value, n) = get_length_prefixed_slice(input)
                        .ok_or_else(|| Error::Corruption("bad WriteBatch value".into()))?;
                    input = &input[n..];
                    handler.put(key, value);
                }
                Ok(ValueType::Deletion) => handler.delete(key),
                Err(tag) => {
                    return Err(Error::Corruption(format!("unknown WriteBatch tag: {tag}")))
                }
            }
        }

        if found != self.count() {
            return Err(Error::Corruption("WriteBatch has wrong count".into()));
        }
        Ok(())
    }

    pub(crate) fn sequence(&self) -> SeqNumber {
        (&self.rep[..8]).get_u64_le()
    }

    pub(crate) fn set_sequence(&mut self, seq: SeqNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..WRITE_BATCH_HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuilds a batch from a log record payload.
    pub(crate) fn decode_from(contents: &[u8]) -> Result<Self> {
        if contents.len() < WRITE_BATCH_HEADER_SIZE {
            return Err(Error::Corruption("log record too small".into()));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }

    /// Inserts every operation into `mem`, numbered from the batch's sequence.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter {
            seq: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

impl From<WriteBatch> for Bytes {
    fn from(batch: WriteBatch) -> Self {
        Bytes::from(batch.rep)
    }
}

struct MemTableInserter<'a> {
    seq: SeqNumber,
    mem: &'a MemTable,
}

impl WriteBatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.seq, ValueType::Value, key, value);
        self.seq += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.seq, ValueType::Deletion, key, &[]);
        self.seq += 1;
    }
}
