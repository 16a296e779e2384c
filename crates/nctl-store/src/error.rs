use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested entry or group does not exist.
    #[error("not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// A create-only write found an existing entry.
    #[error("already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    /// A key segment is not a safe path component.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// An operation that needs the bucket lock ran while nobody held it.
    ///
    /// This is a programming error in the caller, not a user error.
    #[error("no lock held on {} (operation must run inside a lock scope)", path.display())]
    LockNotHeld { path: PathBuf },

    /// A bounded lock wait expired.
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Entry content failed structural validation.
    #[error("corrupt entry {}: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    /// Serialization of a value before writing failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Access-control failure from the OS.
    #[error("permission denied: {}: {source}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure from the OS.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Classify an `io::Error` raised while touching `path`.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound { path },
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied { path, source },
            _ => StoreError::Io { path, source },
        }
    }

    pub fn corruption(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        StoreError::Corruption {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
