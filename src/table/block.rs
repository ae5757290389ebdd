use std::{cmp::Ordering, sync::Arc};

use bytes::{Buf, Bytes};

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    iterator::DBIterator,
    utils::varint::VarInt,
};

use super::SIZE_U32;

/// A decoded (uncompressed) block, see `BlockBuilder` for the layout.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    restart_count: usize,
}

impl Block {
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < SIZE_U32 {
            return Err(Error::Corruption("block data too short".into()));
        }

        let max_restarts_allowed = (data.len() - SIZE_U32) / SIZE_U32;
        let restart_count = (&data[data.len() - SIZE_U32..]).get_u32_le() as usize;

        if restart_count > max_restarts_allowed {
            return Err(Error::Corruption("block restart count invalid".into()));
        }

        let restart_offset = data.len() - (1 + restart_count) * SIZE_U32;
        Ok(Self {
            data,
            restart_offset,
            restart_count,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self, comparator: Arc<dyn Comparator>) -> BlockIter {
        BlockIter {
            comparator,
            data: self.data.clone(),
            restart_offset: self.restart_offset,
            restart_count: self.restart_count,
            current: self.restart_offset,
            restart_index: self.restart_count,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: None,
        }
    }
}

/// Decodes the entry header at `data[offset..limit]`.
///
/// Returns `(shared, non_shared, value_len, header_len)`.
fn decode_entry(data: &[u8], offset: usize, limit: usize) -> Option<(usize, usize, usize, usize)> {
    let mut p = offset;
    let (shared, n) = u32::from_varint(data.get(p..limit)?)?;
    p += n;
    let (non_shared, n) = u32::from_varint(data.get(p..limit)?)?;
    p += n;
    let (value_len, n) = u32::from_varint(data.get(p..limit)?)?;
    p += n;

    if limit - p < non_shared as usize + value_len as usize {
        return None;
    }
    Some((
        shared as usize,
        non_shared as usize,
        value_len as usize,
        p - offset,
    ))
}

pub struct BlockIter {
    comparator: Arc<dyn Comparator>,
    data: Bytes,

    restart_offset: usize,
    restart_count: usize,

    // Offset of the current entry, `restart_offset` when invalid.
    current: usize,
    // Index of the restart block `current` falls in.
    restart_index: usize,

    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,

    status: Option<Error>,
}

impl BlockIter {
    fn next_entry_offset(&self) -> usize {
        self.value_offset + self.value_len
    }

    fn get_restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.restart_count);
        let pos = self.restart_offset + index * SIZE_U32;
        (&self.data[pos..pos + SIZE_U32]).get_u32_le() as usize
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;

        // `parse_next_entry` starts at `next_entry_offset`
        self.value_offset = self.get_restart_point(index);
        self.value_len = 0;
    }

    fn mark_invalid(&mut self) {
        self.current = self.restart_offset;
        self.restart_index = self.restart_count;
    }

    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restart_offset {
            // no more entries, the restart array follows
            self.mark_invalid();
            return false;
        }

        let Some((shared, non_shared, value_len, header_len)) =
            decode_entry(&self.data, self.current, self.restart_offset)
        else {
            self.corruption();
            return false;
        };
        if shared > self.key.len() {
            self.corruption();
            return false;
        }

        let key_offset = self.current + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.data[key_offset..key_offset + non_shared]);
        self.value_offset = key_offset + non_shared;
        self.value_len = value_len;

        while self.restart_index + 1 < self.restart_count
            && self.get_restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    fn corruption(&mut self) {
        self.mark_invalid();
        self.key.clear();
        self.status = Some(Error::Corruption("bad entry in block".into()));
    }

    /// Full key stored at a restart point.
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.get_restart_point(index);
        let (shared, non_shared, _, header_len) =
            decode_entry(&self.data, offset, self.restart_offset)?;
        if shared != 0 {
            return None;
        }
        let key_offset = offset + header_len;
        Some(&self.data[key_offset..key_offset + non_shared])
    }
}

impl DBIterator for BlockIter {
    fn is_valid(&self) -> bool {
        self.current < self.restart_offset
    }

    fn next(&mut self) {
        debug_assert!(self.is_valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.is_valid());

        // scan backwards to a restart point before current
        let original = self.current;
        while self.get_restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.mark_invalid();
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        &self.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn seek_to_first(&mut self) {
        if self.restart_count == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.restart_count == 0 {
            self.mark_invalid();
            return;
        }
        self.seek_to_restart_point(self.restart_count - 1);
        while self.parse_next_entry() && self.next_entry_offset() < self.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.restart_count == 0 {
            self.mark_invalid();
            return;
        }

        // last restart point with a key < target
        let mut l = 0;
        let mut r = self.restart_count - 1;
        while l < r {
            let mid = (l + r + 1) / 2;
            let Some(mid_key) = self.restart_key(mid) else {
                self.corruption();
                return;
            };
            match self.comparator.compare(mid_key, target) {
                Ordering::Less => l = mid,
                _ => r = mid - 1,
            }
        }

        self.seek_to_restart_point(l);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target).is_ge() {
                return;
            }
        }
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }
}
