pub(crate) mod bloom;
pub(crate) mod file_lock;
pub(crate) mod hash;
pub(crate) mod varint;
