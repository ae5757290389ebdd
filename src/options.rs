use std::{fmt, sync::Arc};

use crate::{
    comparator::{BytewiseComparator, Comparator},
    filter::{BloomFilterPolicy, FilterPolicy},
    snapshot::Snapshot,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            other => Err(other),
        }
    }
}

#[derive(Clone)]
pub struct Options {
    /// Create the database if it's missing.
    pub create_if_missing: bool,

    /// Fail to open if the database already exists.
    pub error_if_exists: bool,

    /// Turn every detected corruption (WAL replay, block checksums) into an error.
    pub paranoid_checks: bool,

    /// Defines the order of user keys. Must keep the same name across opens.
    pub comparator: Arc<dyn Comparator>,

    /// Bytes buffered in the memtable before it is flushed to a level-0 table.
    pub write_buffer_size: usize,

    pub max_open_files: usize,

    /// Approximate size of uncompressed user data per block.
    pub block_size: usize,

    pub block_restart_interval: usize,

    pub compression: CompressionType,

    /// Bytes of uncompressed blocks kept in the block cache, `0` disables it.
    pub block_cache_capacity: usize,

    /// Bloom filter bits per key, `None` writes tables without a filter block.
    pub filter_bits_per_key: Option<usize>,

    /// Target size of a single table file produced by compaction.
    pub max_file_size: usize,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    pub(crate) fn filter_policy(&self) -> Option<Arc<dyn FilterPolicy>> {
        self.filter_bits_per_key
            .map(|bits| Arc::new(BloomFilterPolicy::new(bits)) as Arc<dyn FilterPolicy>)
    }

    pub(crate) fn table_cache_capacity(&self) -> usize {
        self.max_open_files.saturating_sub(10).max(64)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            comparator: Arc::new(BytewiseComparator),
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            compression: CompressionType::Lz4,
            block_cache_capacity: 8 * 1024 * 1024,
            filter_bits_per_key: Some(10),
            max_file_size: 2 * 1024 * 1024,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("comparator", &self.comparator.name())
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("compression", &self.compression)
            .field("block_cache_capacity", &self.block_cache_capacity)
            .field("filter_bits_per_key", &self.filter_bits_per_key)
            .field("max_file_size", &self.max_file_size)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct OptionsBuilder {
    options: Options,
}

macro_rules! builder_setter {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(mut self, $name: $ty) -> Self {
                self.options.$name = $name;
                self
            }
        )*
    };
}

impl OptionsBuilder {
    builder_setter! {
        create_if_missing: bool,
        error_if_exists: bool,
        paranoid_checks: bool,
        write_buffer_size: usize,
        max_open_files: usize,
        block_size: usize,
        block_restart_interval: usize,
        compression: CompressionType,
        block_cache_capacity: usize,
        filter_bits_per_key: Option<usize>,
        max_file_size: usize,
    }

    pub fn comparator(mut self, comparator: impl Comparator + 'static) -> Self {
        self.options.comparator = Arc::new(comparator);
        self
    }

    pub fn build(self) -> Options {
        let mut options = self.options;
        options.block_restart_interval = options.block_restart_interval.max(1);
        options.block_size = options.block_size.max(1);
        options.write_buffer_size = options.write_buffer_size.max(1024);
        options.max_file_size = options.max_file_size.max(1);
        options
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Flush and fsync the log before the write returns.
    pub sync: bool,
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest state.
    pub snapshot: Option<Snapshot>,

    /// Keep blocks read by this operation in the block cache.
    pub fill_cache: bool,

    pub verify_checksums: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            fill_cache: true,
            verify_checksums: false,
        }
    }
}
