use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock held on {0:?}, the database is already open")]
    LockHeld(PathBuf),

    #[error("Background error: {0}")]
    BackgroundError(String),

    #[error("Database is shutting down")]
    ShutDown,
}

impl Error {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// Clones the error for fan-out to multiple callers. `io::Error` is not `Clone`,
    /// so the kind and message are kept.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::IO(e) => Error::IO(std::io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(s) => Error::Corruption(s.clone()),
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::LockHeld(p) => Error::LockHeld(p.clone()),
            Error::BackgroundError(s) => Error::BackgroundError(s.clone()),
            Error::ShutDown => Error::ShutDown,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
