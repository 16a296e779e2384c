//! Error types for domain store operations.

use nctl_store::StoreError;
use nctl_types::TypeError;
use thiserror::Error;

/// Errors that can occur in the domain stores.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The name is already claimed by a container.
    #[error("name {name:?} is already in use by container {id}")]
    NameTaken { name: String, id: String },

    /// The name is claimed, but by a different container than the caller's.
    #[error("name {name:?} is used by container {holder}, not {id}")]
    NameNotOwned {
        name: String,
        holder: String,
        id: String,
    },

    /// The name is not claimed by anyone.
    #[error("no container named {name:?}")]
    NameNotFound { name: String },

    #[error("no such volume: {name}")]
    VolumeNotFound { name: String },

    #[error("no such container: {id}")]
    ContainerNotFound { id: String },

    #[error("container already exists: {id}")]
    ContainerExists { id: String },

    /// A short ID prefix matched more than one container.
    #[error("multiple containers match {prefix:?}")]
    AmbiguousId { prefix: String },

    #[error("namespace {namespace} is not empty ({detail})")]
    NamespaceNotEmpty { namespace: String, detail: String },

    /// An identifier failed validation.
    #[error(transparent)]
    Invalid(#[from] TypeError),

    /// Failure in the underlying store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias for domain store results.
pub type MetaResult<T> = Result<T, MetaError>;
