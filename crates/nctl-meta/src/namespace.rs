//! Namespace inventory across all bucket kinds.

use std::collections::BTreeSet;

use nctl_store::{BucketKind, DataStore};
use nctl_types::Namespace;
use serde::Serialize;
use tracing::debug;

use crate::containerstore::ContainerStore;
use crate::error::{MetaError, MetaResult};
use crate::namestore::{FileNameStore, NameStore};
use crate::volumestore::VolumeStore;

/// Counts of what a namespace holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NamespaceSummary {
    pub name: Namespace,
    pub containers: usize,
    pub volumes: usize,
    pub names: usize,
}

impl NamespaceSummary {
    pub fn is_empty(&self) -> bool {
        self.containers == 0 && self.volumes == 0 && self.names == 0
    }
}

/// Every namespace with a bucket of any kind, sorted.
pub fn list_namespaces(store: &DataStore) -> MetaResult<Vec<NamespaceSummary>> {
    let mut found = BTreeSet::new();
    for kind in BucketKind::ALL {
        found.extend(store.namespaces(kind)?);
    }
    found.iter().map(|ns| summarize(store, ns)).collect()
}

pub fn summarize(store: &DataStore, namespace: &Namespace) -> MetaResult<NamespaceSummary> {
    Ok(NamespaceSummary {
        name: namespace.clone(),
        containers: ContainerStore::new(store, namespace).list()?.len(),
        volumes: VolumeStore::new(store, namespace).list(false)?.len(),
        names: FileNameStore::new(store, namespace).list()?.len(),
    })
}

/// Bucket kinds in lock order.
const LOCK_ORDER: [BucketKind; 4] = [
    BucketKind::Names,
    BucketKind::Containers,
    BucketKind::Volumes,
    BucketKind::EtcHosts,
];

/// Delete every bucket of `namespace`.
///
/// Without `force`, a namespace still holding containers, volumes, or names
/// is refused with [`MetaError::NamespaceNotEmpty`]. All four buckets stay
/// locked from the emptiness check until the last one is gone.
pub fn remove_namespace(store: &DataStore, namespace: &Namespace, force: bool) -> MetaResult<()> {
    let buckets = LOCK_ORDER.map(|kind| store.bucket(kind, namespace));
    let mut guards = Vec::with_capacity(buckets.len());
    for bucket in &buckets {
        guards.push(bucket.lock()?);
    }

    let summary = summarize(store, namespace)?;
    if !force && !summary.is_empty() {
        return Err(MetaError::NamespaceNotEmpty {
            namespace: namespace.to_string(),
            detail: format!(
                "{} containers, {} volumes, {} names",
                summary.containers, summary.volumes, summary.names
            ),
        });
    }
    for (kind, guard) in LOCK_ORDER.into_iter().zip(&guards) {
        store.remove_namespace_bucket(kind, namespace, guard)?;
    }
    debug!(namespace = %namespace, force, "namespace removed");
    Ok(())
}
