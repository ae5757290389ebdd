use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;

use crate::{
    db::{filename::table_file_name, format::InternalKeyComparator},
    error::Result,
    iterator::{BoxedIterator, EmptyIterator},
    options::{Options, ReadOptions},
    table::{table_reader::BlockCache, Table},
};

/// Keeps recently used tables open, keyed by file number.
pub(crate) struct TableCache {
    db_path: PathBuf,
    options: Options,
    comparator: InternalKeyComparator,
    cache: quick_cache::sync::Cache<u64, Arc<Table>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    pub(crate) fn new(db_path: &Path, options: &Options, comparator: InternalKeyComparator) -> Self {
        let block_cache = (options.block_cache_capacity > 0).then(|| {
            let blocks = (options.block_cache_capacity / options.block_size).max(1);
            Arc::new(BlockCache::new(blocks))
        });

        Self {
            db_path: db_path.to_path_buf(),
            options: options.clone(),
            comparator,
            cache: quick_cache::sync::Cache::new(options.table_cache_capacity()),
            block_cache,
        }
    }

    pub(crate) fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }

        let path = table_file_name(&self.db_path, file_number);
        let file = File::open(&path)?;
        let table = Arc::new(Table::open(
            &self.options,
            self.comparator.clone(),
            file,
            file_size,
            file_number,
            self.block_cache.clone(),
        )?);
        tracing::debug!("open table {:?}, size: {}", path, file_size);

        self.cache.insert(file_number, table.clone());
        Ok(table)
    }

    /// See `Table::internal_get`.
    pub(crate) fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(read_options, internal_key)
    }

    pub(crate) fn new_iterator(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> BoxedIterator {
        match self.find_table(file_number, file_size) {
            Ok(table) => Box::new(table.iter(read_options)),
            Err(e) => Box::new(EmptyIterator::with_error(e)),
        }
    }

    pub(crate) fn approximate_offset_of(
        &self,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> u64 {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.approximate_offset_of(internal_key),
            Err(_) => 0,
        }
    }

    /// Drops the cached handle of a deleted file.
    pub(crate) fn evict(&self, file_number: u64) {
        self.cache.remove(&file_number);
    }
}
