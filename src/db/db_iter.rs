use std::sync::Arc;

use crate::{
    comparator::Comparator,
    error::{Error, Result},
    iterator::{BoxedIterator, DBIterator},
    snapshot::Snapshot,
    version::Version,
};

use super::format::{extract_user_key, parse_internal_key, LookupKey, SeqNumber, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The inner iterator is positioned at the entry yielding `key()`.
    Forward,
    /// The inner iterator is positioned before all entries of `key()`, which is kept in
    /// `saved_key` together with `saved_value`.
    Reverse,
}

/// Iterates the user-visible state of the database as of one sequence number.
///
/// Wraps a merging iterator over internal keys: entries newer than the sequence number are
/// skipped, only the newest version of each user key is yielded, and keys whose newest
/// version is a tombstone are hidden.
pub struct DBIter {
    ucmp: Arc<dyn Comparator>,
    iter: BoxedIterator,
    sequence: SeqNumber,

    direction: Direction,
    valid: bool,
    err: Option<Error>,

    saved_key: Vec<u8>,
    saved_value: Vec<u8>,

    // keeps the files read by `iter` from being deleted
    _version: Option<Arc<Version>>,
    // entries visible at `sequence` survive compaction while this is held
    _snapshot: Option<Snapshot>,
}

impl DBIter {
    pub(crate) fn new(
        ucmp: Arc<dyn Comparator>,
        iter: BoxedIterator,
        sequence: SeqNumber,
        version: Option<Arc<Version>>,
        snapshot: Option<Snapshot>,
    ) -> Self {
        Self {
            ucmp,
            iter,
            sequence,
            direction: Direction::Forward,
            valid: false,
            err: None,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            _version: version,
            _snapshot: snapshot,
        }
    }

    fn parse_current(&mut self) -> Option<(SeqNumber, ValueType)> {
        match parse_internal_key(self.iter.key()) {
            Some(parsed) => Some((parsed.seq, parsed.value_type)),
            None => {
                if self.err.is_none() {
                    self.err = Some(Error::Corruption(
                        "corrupted internal key in DBIter".to_string(),
                    ));
                }
                None
            }
        }
    }

    fn clear_saved(&mut self) {
        self.saved_key.clear();
        self.saved_value.clear();
    }

    /// Moves forward to the first visible entry. With `skipping`, entries of user keys up
    /// to `saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.iter.is_valid());
        debug_assert_eq!(self.direction, Direction::Forward);

        loop {
            if let Some((seq, value_type)) = self.parse_current() {
                if seq <= self.sequence {
                    let user_key = extract_user_key(self.iter.key());
                    match value_type {
                        ValueType::Deletion => {
                            // hide every older entry of this key
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(user_key);
                            skipping = true;
                        }
                        ValueType::Value => {
                            if !(skipping && self.ucmp.compare(user_key, &self.saved_key).is_le()) {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }

            self.iter.next();
            if !self.iter.is_valid() {
                break;
            }
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Moves backward to the previous visible user key, collecting its newest visible
    /// value into `saved_value`.
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);

        let mut value_type = ValueType::Deletion;
        while self.iter.is_valid() {
            if let Some((seq, ty)) = self.parse_current() {
                if seq <= self.sequence {
                    let user_key = extract_user_key(self.iter.key());
                    if value_type != ValueType::Deletion
                        && self.ucmp.compare(user_key, &self.saved_key).is_lt()
                    {
                        // a visible value of the next key in reverse order was found
                        break;
                    }
                    value_type = ty;
                    match ty {
                        ValueType::Deletion => self.clear_saved(),
                        ValueType::Value => {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(user_key);
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                }
            }
            self.iter.prev();
        }

        if value_type == ValueType::Deletion {
            // ran off the front
            self.valid = false;
            self.clear_saved();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl DBIterator for DBIter {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.clear_saved();
        self.iter.seek_to_first();
        if self.iter.is_valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.clear_saved();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Positions at the first user key at or past `target`.
    fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.clear_saved();
        let lookup = LookupKey::new(target, self.sequence);
        self.iter.seek(lookup.internal_key());
        if self.iter.is_valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator is before the entries of `key()`, step into them and let
            // the skipping below pass over them. `saved_key` already holds the key.
            if self.iter.is_valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }
            if !self.iter.is_valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            self.iter.next();
            if !self.iter.is_valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // The inner iterator is at the current entry, step back until the user key
            // changes.
            self.saved_key.clear();
            self.saved_key
                .extend_from_slice(extract_user_key(self.iter.key()));
            loop {
                self.iter.prev();
                if !self.iter.is_valid() {
                    self.valid = false;
                    self.clear_saved();
                    return;
                }
                if self
                    .ucmp
                    .compare(extract_user_key(self.iter.key()), &self.saved_key)
                    .is_lt()
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.duplicate()),
            None => self.iter.status(),
        }
    }
}
