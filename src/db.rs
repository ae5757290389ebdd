pub mod db_iter;
pub(crate) mod filename;
pub mod format;
pub(crate) mod wal;
