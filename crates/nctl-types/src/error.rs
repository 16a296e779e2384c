use thiserror::Error;

/// Errors produced by identifier parsing and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid identifier {value:?}: {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("invalid namespace {value:?}: {reason}")]
    InvalidNamespace { value: String, reason: String },

    #[error("invalid container ID {value:?}: {reason}")]
    InvalidContainerId { value: String, reason: String },
}
