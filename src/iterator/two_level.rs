use crate::error::{Error, Result};

use super::{BoxedIterator, DBIterator, EmptyIterator};

/// Opens the second level iterator for a value of the index iterator.
pub(crate) trait BlockSource {
    fn open(&self, index_value: &[u8]) -> Result<BoxedIterator>;
}

/// Iterates an index whose values point at sorted runs: the blocks of a table, or the
/// tables of a level.
pub(crate) struct TwoLevelIterator<I, S> {
    index: I,
    source: S,

    data: Option<BoxedIterator>,
    // index value the data iterator was opened from
    data_handle: Vec<u8>,

    err: Option<Error>,
}

impl<I: DBIterator, S: BlockSource> TwoLevelIterator<I, S> {
    pub(crate) fn new(index: I, source: S) -> Self {
        Self {
            index,
            source,
            data: None,
            data_handle: Vec::new(),
            err: None,
        }
    }

    fn set_data(&mut self, data: Option<BoxedIterator>) {
        if let Some(old) = self.data.take() {
            if let (Err(e), None) = (old.status(), self.err.as_ref()) {
                self.err = Some(e);
            }
        }
        self.data = data;
    }

    fn init_data_block(&mut self) {
        if !self.index.is_valid() {
            self.set_data(None);
            return;
        }

        let handle = self.index.value();
        if self.data.is_some() && handle == self.data_handle.as_slice() {
            // already opened
            return;
        }

        let data = match self.source.open(handle) {
            Ok(iter) => iter,
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        };
        self.data_handle = handle.to_vec();
        self.set_data(Some(data));
    }

    fn data_valid(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.is_valid())
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            if !self.index.is_valid() {
                self.set_data(None);
                return;
            }
            self.index.next();
            self.init_data_block();
            if let Some(data) = self.data.as_mut() {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            if !self.index.is_valid() {
                self.set_data(None);
                return;
            }
            self.index.prev();
            self.init_data_block();
            if let Some(data) = self.data.as_mut() {
                data.seek_to_last();
            }
        }
    }
}

impl<I: DBIterator, S: BlockSource> DBIterator for TwoLevelIterator<I, S> {
    fn is_valid(&self) -> bool {
        self.data_valid()
    }

    fn seek_to_first(&mut self) {
        self.index.seek_to_first();
        self.init_data_block();
        if let Some(data) = self.data.as_mut() {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index.seek_to_last();
        self.init_data_block();
        if let Some(data) = self.data.as_mut() {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index.seek(target);
        self.init_data_block();
        if let Some(data) = self.data.as_mut() {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.is_valid());
        if let Some(data) = self.data.as_mut() {
            data.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.is_valid());
        if let Some(data) = self.data.as_mut() {
            data.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.key(),
            None => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.value(),
            None => &[],
        }
    }

    fn status(&self) -> Result<()> {
        self.index.status()?;
        if let Some(data) = &self.data {
            data.status()?;
        }
        match &self.err {
            Some(e) => Err(e.duplicate()),
            None => Ok(()),
        }
    }
}
