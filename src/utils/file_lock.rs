use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

/// Advisory exclusive lock on the database's `LOCK` file.
///
/// The lock is tied to the open file description, so it's released when this value is
/// dropped (or the process dies).
#[derive(Debug)]
pub(crate) struct FileLock {
    _lock: fd_lock::RwLock<File>,
    path: PathBuf,
}

impl FileLock {
    pub(crate) fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let mut lock = fd_lock::RwLock::new(file);
        match lock.try_write() {
            // The guard only borrows `lock`; forgetting it keeps the OS lock until the file
            // is closed together with `lock`.
            Ok(guard) => std::mem::forget(guard),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(Error::LockHeld(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("acquired lock: {:?}", path);
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
