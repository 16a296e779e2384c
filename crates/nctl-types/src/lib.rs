//! Foundation types for nctl.
//!
//! Every other nctl crate depends on `nctl-types`. It owns the identifiers
//! that end up as path components in the on-disk store, so validation lives
//! here rather than in each consumer.
//!
//! # Key Types
//!
//! - [`Namespace`]: containerd-style isolation scope (`default`, `k8s.io`, ...)
//! - [`ContainerId`]: a containerd identifier; generated IDs are 64 hex characters
//! - [`validate_docker_compat`]: the `[a-zA-Z0-9][a-zA-Z0-9_.-]+` rule used for
//!   container and volume names

pub mod error;
pub mod identifier;

pub use error::TypeError;
pub use identifier::{validate_docker_compat, validate_namespace, ContainerId, Namespace};
