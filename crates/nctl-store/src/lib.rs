//! Durable namespaced store for nctl.
//!
//! Every nctl invocation is a separate short-lived process, and there is no
//! client-side daemon to arbitrate between them. This crate keeps shared
//! client state (container names, container metadata, volumes, hosts files)
//! on disk in a way that survives concurrent invocations, crashes, and
//! SIGKILL without a recovery pass.
//!
//! # Layers
//!
//! - [`atomic`]: temp-file + fsync + rename writes; idempotent removal;
//!   in-place rewrite for bind-mounted files
//! - [`lock`]: [`DirLock`], an exclusive `flock` on a bucket directory that
//!   the kernel drops when the holder exits
//! - [`bucket`]: [`Bucket`], entries and groups under one directory, with
//!   explicit caller-held lock scopes ([`BucketLock`])
//! - [`layout`]: [`DataStore`], mapping `(kind, namespace)` to buckets
//!   under `<data_root>/<addr_hash>/`
//!
//! # Design Rules
//!
//! 1. Writes of one entry are atomic with respect to readers and crashes.
//! 2. Bucket methods never lock implicitly. Read-then-write sequences and
//!    multi-entry changes run inside a caller-held lock scope.
//! 3. Lock granularity is one bucket: independent namespaces never contend.
//! 4. Errors are always returned; corrupt content is reported with its path
//!    and left on disk.
//!
//! Unix only: locking is built on `flock(2)`.

pub mod atomic;
pub mod bucket;
pub mod error;
pub mod layout;
pub mod lock;

pub use bucket::{Bucket, BucketLock};
pub use error::{StoreError, StoreResult};
pub use layout::{addr_hash, BucketKind, DataStore, StoreConfig};
pub use lock::{is_locked, DirLock};
