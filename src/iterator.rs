mod merging;
mod two_level;

pub(crate) use merging::MergingIterator;
pub(crate) use two_level::{BlockSource, TwoLevelIterator};

use crate::error::{Error, Result};

/// A seekable, bidirectional cursor over sorted key-value pairs.
///
/// `key` and `value` may only be called while `is_valid` returns `true`. Errors are not
/// returned by the movement methods, the iterator becomes invalid and `status` reports them.
pub trait DBIterator {
    fn is_valid(&self) -> bool;

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Positions at the first entry with a key at or past `target`.
    fn seek(&mut self, target: &[u8]);

    fn next(&mut self);

    fn prev(&mut self);

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];

    fn status(&self) -> Result<()>;
}

pub(crate) type BoxedIterator = Box<dyn DBIterator + Send>;

/// Never valid, optionally carrying an error.
#[derive(Debug, Default)]
pub(crate) struct EmptyIterator {
    err: Option<Error>,
}

impl EmptyIterator {
    pub(crate) fn with_error(err: Error) -> Self {
        Self { err: Some(err) }
    }
}

impl DBIterator for EmptyIterator {
    fn is_valid(&self) -> bool {
        false
    }

    fn seek_to_first(&mut self) {}

    fn seek_to_last(&mut self) {}

    fn seek(&mut self, _target: &[u8]) {}

    fn next(&mut self) {}

    fn prev(&mut self) {}

    fn key(&self) -> &[u8] {
        &[]
    }

    fn value(&self) -> &[u8] {
        &[]
    }

    fn status(&self) -> Result<()> {
        match &self.err {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }
}
