//! Domain stores for nctl.
//!
//! Each store wraps the bucket of one kind for one namespace and owns the
//! locking discipline for its entries. Callers never lock buckets directly,
//! except through the `*_locked` variants used by composite operations.
//!
//! # Modules
//!
//! - [`error`]: [`MetaError`] and the [`MetaResult`] alias
//! - [`namestore`]: the [`NameStore`] trait and [`FileNameStore`]
//! - [`containerstore`]: [`ContainerStore`], per-container metadata and log paths
//! - [`volumestore`]: [`VolumeStore`], named and anonymous volumes
//! - [`etchosts`]: [`HostsStore`], generated `/etc/hosts` files
//! - [`namespace`]: inventory and removal of whole namespaces
//! - [`container_ops`]: [`NamespaceStores`], operations spanning several buckets

pub mod container_ops;
pub mod containerstore;
pub mod error;
pub mod etchosts;
pub mod namespace;
pub mod namestore;
pub mod volumestore;

pub use container_ops::{CreateRequest, NamespaceStores, ANONYMOUS_VOLUME_LABEL};
pub use containerstore::{default_name, ContainerMeta, ContainerState, ContainerStore};
pub use error::{MetaError, MetaResult};
pub use etchosts::{HostsMeta, HostsStore};
pub use namespace::{list_namespaces, remove_namespace, NamespaceSummary};
pub use namestore::{FileNameStore, NameStore};
pub use volumestore::{RemoveReport, Volume, VolumeStore};
