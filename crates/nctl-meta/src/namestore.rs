//! Container name reservation.
//!
//! Each namespace has a `names/<namespace>/` bucket in which the entry
//! `<name>` holds the ID of the container that owns the name. Claiming a
//! name is check-then-act, so every mutating operation runs under the
//! bucket lock.
//!
//! [`NameStore::rename`] writes the new entry before deleting the old one.
//! A crash between those two steps leaves both names pointing at the same
//! container until one is released by hand; it never leaves the container
//! with no name at all.

use nctl_store::{Bucket, BucketKind, BucketLock, DataStore, StoreError};
use nctl_types::{validate_docker_compat, ContainerId, Namespace};
use tracing::debug;

use crate::error::{MetaError, MetaResult};

/// Storage interface for container names within one namespace.
pub trait NameStore: Send + Sync {
    /// Claim `name` for `id`. Fails with [`MetaError::NameTaken`] if any
    /// container already holds it (including `id` itself).
    fn acquire(&self, name: &str, id: &ContainerId) -> MetaResult<()>;

    /// Drop the claim on `name`. Releasing an unclaimed name succeeds.
    fn release(&self, name: &str) -> MetaResult<()>;

    /// Drop the claim on `name` only if `id` holds it.
    fn release_owned(&self, name: &str, id: &ContainerId) -> MetaResult<()>;

    /// Move `id`'s claim from `old` to `new`.
    fn rename(&self, old: &str, new: &str, id: &ContainerId) -> MetaResult<()>;

    /// The container holding `name`, if any.
    fn lookup(&self, name: &str) -> MetaResult<Option<ContainerId>>;

    /// All claims, sorted by name.
    fn list(&self) -> MetaResult<Vec<(String, ContainerId)>>;
}

/// [`NameStore`] backed by the on-disk `names` bucket.
#[derive(Debug)]
pub struct FileNameStore {
    namespace: Namespace,
    bucket: Bucket,
}

impl FileNameStore {
    pub fn new(store: &DataStore, namespace: &Namespace) -> Self {
        Self {
            namespace: namespace.clone(),
            bucket: store.bucket(BucketKind::Names, namespace),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Lock the names bucket for a composite operation.
    pub fn lock(&self) -> MetaResult<BucketLock<'_>> {
        Ok(self.bucket.lock()?)
    }

    /// [`NameStore::acquire`] for callers already holding [`Self::lock`].
    pub fn acquire_locked(
        &self,
        guard: &BucketLock<'_>,
        name: &str,
        id: &ContainerId,
    ) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        validate_docker_compat(name)?;
        if let Some(holder) = self.read(name)? {
            return Err(MetaError::NameTaken {
                name: name.to_string(),
                id: holder.to_string(),
            });
        }
        self.bucket.create(name, id.as_str().as_bytes())?;
        debug!(namespace = %self.namespace, name, id = id.short(), "name acquired");
        Ok(())
    }

    /// [`NameStore::release_owned`] for callers already holding [`Self::lock`].
    pub fn release_owned_locked(
        &self,
        guard: &BucketLock<'_>,
        name: &str,
        id: &ContainerId,
    ) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        validate_docker_compat(name)?;
        match self.read(name)? {
            None => Ok(()),
            Some(holder) if holder == *id => {
                self.bucket.ensure_locked()?;
                self.bucket.delete(name)?;
                debug!(namespace = %self.namespace, name, id = id.short(), "name released");
                Ok(())
            }
            Some(holder) => Err(MetaError::NameNotOwned {
                name: name.to_string(),
                holder: holder.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// [`NameStore::rename`] for callers already holding [`Self::lock`].
    pub fn rename_locked(
        &self,
        guard: &BucketLock<'_>,
        old: &str,
        new: &str,
        id: &ContainerId,
    ) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        validate_docker_compat(old)?;
        validate_docker_compat(new)?;

        match self.read(old)? {
            None => {
                return Err(MetaError::NameNotFound {
                    name: old.to_string(),
                })
            }
            Some(holder) if holder != *id => {
                return Err(MetaError::NameNotOwned {
                    name: old.to_string(),
                    holder: holder.to_string(),
                    id: id.to_string(),
                })
            }
            Some(_) => {}
        }
        if old == new {
            return Ok(());
        }
        if let Some(holder) = self.read(new)? {
            return Err(MetaError::NameTaken {
                name: new.to_string(),
                id: holder.to_string(),
            });
        }

        // New first: an interruption here leaves two names, never zero.
        self.bucket.create(new, id.as_str().as_bytes())?;
        self.bucket.delete(old)?;
        debug!(namespace = %self.namespace, old, new, id = id.short(), "name renamed");
        Ok(())
    }

    /// Read the holder of `name` without locking.
    fn read(&self, name: &str) -> MetaResult<Option<ContainerId>> {
        let raw = match self.bucket.get(name) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| ContainerId::new(s.trim()).ok());
        match parsed {
            Some(id) => Ok(Some(id)),
            None => {
                let path = self.bucket.location(name)?;
                Err(StoreError::corruption(path, "name entry does not hold a container ID").into())
            }
        }
    }
}

impl NameStore for FileNameStore {
    fn acquire(&self, name: &str, id: &ContainerId) -> MetaResult<()> {
        validate_docker_compat(name)?;
        let guard = self.lock()?;
        self.acquire_locked(&guard, name, id)
    }

    fn release(&self, name: &str) -> MetaResult<()> {
        validate_docker_compat(name)?;
        let _guard = self.lock()?;
        self.bucket.delete(name)?;
        debug!(namespace = %self.namespace, name, "name released");
        Ok(())
    }

    fn release_owned(&self, name: &str, id: &ContainerId) -> MetaResult<()> {
        validate_docker_compat(name)?;
        let guard = self.lock()?;
        self.release_owned_locked(&guard, name, id)
    }

    fn rename(&self, old: &str, new: &str, id: &ContainerId) -> MetaResult<()> {
        let guard = self.lock()?;
        self.rename_locked(&guard, old, new, id)
    }

    fn lookup(&self, name: &str) -> MetaResult<Option<ContainerId>> {
        validate_docker_compat(name)?;
        self.read(name)
    }

    fn list(&self) -> MetaResult<Vec<(String, ContainerId)>> {
        let mut claims = Vec::new();
        for name in self.bucket.list("")? {
            // Entries can vanish between the listing and the read.
            if let Some(id) = self.read(&name)? {
                claims.push((name, id));
            }
        }
        Ok(claims)
    }
}
