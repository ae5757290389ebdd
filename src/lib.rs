pub mod comparator;
pub(crate) mod compaction;
pub mod db;
pub(crate) mod db_impl;
pub mod error;
pub mod filter;
pub mod iterator;
pub mod memtable;
pub mod options;
pub(crate) mod snapshot;
pub mod table;
pub(crate) mod table_cache;
pub(crate) mod utils;
pub(crate) mod version;
pub mod write_batch;

pub use comparator::{BytewiseComparator, Comparator};
pub use db::db_iter::DBIter;
pub use db_impl::{destroy_db, Range, DB};
pub use error::{Error, Result};
pub use iterator::DBIterator;
pub use options::{CompressionType, Options, OptionsBuilder, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;
pub use write_batch::WriteBatch;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    color_backtrace::install();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_file(true)
        .with_level(true)
        .without_time()
        .with_thread_ids(true)
        .with_test_writer()
        .try_init()
        .ok();
}
