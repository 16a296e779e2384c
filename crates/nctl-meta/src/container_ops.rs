//! Operations spanning several buckets of one namespace.
//!
//! Buckets are always locked in the order names, containers, volumes,
//! etchosts. Every composite operation here follows it, so two of them can
//! never wait on each other.

use std::collections::BTreeMap;
use std::net::IpAddr;

use nctl_store::{BucketLock, DataStore};
use nctl_types::{validate_docker_compat, ContainerId, Namespace};
use tracing::{debug, warn};

use crate::containerstore::{default_name, ContainerMeta, ContainerStore};
use crate::error::{MetaError, MetaResult};
use crate::etchosts::{HostsMeta, HostsStore};
use crate::namestore::{FileNameStore, NameStore};
use crate::volumestore::{RemoveReport, VolumeStore};

/// Label placed on volumes created for a single container.
pub const ANONYMOUS_VOLUME_LABEL: &str = "nctl/anonymous-for";

/// What to create.
#[derive(Clone, Debug, Default)]
pub struct CreateRequest {
    /// Container name; generated from the image when absent.
    pub name: Option<String>,
    pub image: String,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Named volumes to mount, created when missing.
    pub volumes: Vec<String>,
    /// How many anonymous volumes to provision.
    pub anonymous_volumes: usize,
    pub networks: BTreeMap<String, Vec<IpAddr>>,
    pub extra_hosts: BTreeMap<String, IpAddr>,
}

/// The four domain stores of one namespace.
#[derive(Debug)]
pub struct NamespaceStores {
    pub names: FileNameStore,
    pub containers: ContainerStore,
    pub volumes: VolumeStore,
    pub hosts: HostsStore,
}

/// Locks held for the whole of a create, in lock order.
struct CreateGuards<'a> {
    names: BucketLock<'a>,
    containers: BucketLock<'a>,
    volumes: BucketLock<'a>,
    hosts: BucketLock<'a>,
}

/// Entries written so far by a create, undone if a later step fails.
#[derive(Default)]
struct Written {
    name: Option<String>,
    volumes: Vec<String>,
    container: bool,
    hosts: bool,
}

impl NamespaceStores {
    pub fn open(store: &DataStore, namespace: &Namespace) -> Self {
        Self {
            names: FileNameStore::new(store, namespace),
            containers: ContainerStore::new(store, namespace),
            volumes: VolumeStore::new(store, namespace),
            hosts: HostsStore::new(store, namespace),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        self.containers.namespace()
    }

    /// Create a container: claim its name, provision volumes, register its
    /// metadata and hosts entry. Nothing is left behind on failure.
    pub fn create_container(&self, req: &CreateRequest) -> MetaResult<ContainerMeta> {
        let id = ContainerId::generate();
        let name = match &req.name {
            Some(name) => name.clone(),
            None => default_name(&req.image, &id),
        };
        validate_docker_compat(&name)?;
        for volume in &req.volumes {
            validate_docker_compat(volume)?;
        }

        let guards = CreateGuards {
            names: self.names.lock()?,
            containers: self.containers.lock()?,
            volumes: self.volumes.lock()?,
            hosts: self.hosts.lock()?,
        };

        let mut written = Written::default();
        match self.create_steps(req, &id, &name, &guards, &mut written) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                self.roll_back(&guards, &id, &written);
                Err(e)
            }
        }
    }

    fn create_steps(
        &self,
        req: &CreateRequest,
        id: &ContainerId,
        name: &str,
        guards: &CreateGuards<'_>,
        written: &mut Written,
    ) -> MetaResult<ContainerMeta> {
        self.names.acquire_locked(&guards.names, name, id)?;
        written.name = Some(name.to_string());

        let mut meta = ContainerMeta::new(id.clone(), name, self.namespace(), &req.image);
        if let Some(hostname) = &req.hostname {
            meta.hostname = hostname.clone();
        }
        meta.labels = req.labels.clone();

        for volume in &req.volumes {
            if !self.volumes.exists(volume)? {
                self.volumes.create_locked(&guards.volumes, volume, BTreeMap::new())?;
                written.volumes.push(volume.clone());
            }
            meta.volumes.push(volume.clone());
        }
        let anon_labels = BTreeMap::from([(ANONYMOUS_VOLUME_LABEL.to_string(), id.to_string())]);
        for _ in 0..req.anonymous_volumes {
            let volume = self
                .volumes
                .create_anonymous_locked(&guards.volumes, anon_labels.clone())?;
            written.volumes.push(volume.name.clone());
            meta.anonymous_volumes.push(volume.name);
        }

        self.containers.create_locked(&guards.containers, &meta)?;
        written.container = true;

        // The entry is recorded before peers are refreshed, so a failed
        // refresh still has something to undo.
        written.hosts = true;
        self.hosts.acquire_locked(
            &guards.hosts,
            &HostsMeta {
                id: id.clone(),
                name: name.to_string(),
                hostname: meta.hostname.clone(),
                networks: req.networks.clone(),
                extra_hosts: req.extra_hosts.clone(),
            },
        )?;

        debug!(namespace = %self.namespace(), id = id.short(), name, "container created");
        Ok(meta)
    }

    fn roll_back(&self, guards: &CreateGuards<'_>, id: &ContainerId, written: &Written) {
        // The original error is what the caller sees; undo failures are logged.
        if written.hosts {
            if let Err(e) = self.hosts.release_locked(&guards.hosts, id) {
                warn!(id = id.short(), error = %e, "rollback: hosts entry not fully released");
            }
        }
        if written.container {
            if let Err(e) = self.containers.remove_locked(&guards.containers, id) {
                warn!(id = id.short(), error = %e, "rollback: container metadata left behind");
            }
        }
        for volume in &written.volumes {
            if let Err(e) = self.volumes.remove_locked(&guards.volumes, volume) {
                warn!(volume = %volume, error = %e, "rollback: volume left behind");
            }
        }
        if let Some(name) = &written.name {
            if let Err(e) = self.names.release_owned_locked(&guards.names, name, id) {
                warn!(name = %name, error = %e, "rollback: name left claimed");
            }
        }
        debug!(id = id.short(), "container create rolled back");
    }

    /// Resolve a registered container ID, a name, or a unique ID prefix, in
    /// that order.
    pub fn resolve(&self, id_or_name: &str) -> MetaResult<ContainerId> {
        if let Ok(id) = ContainerId::new(id_or_name) {
            if self.containers.exists(&id)? {
                return Ok(id);
            }
        }
        if validate_docker_compat(id_or_name).is_ok() {
            if let Some(id) = self.names.lookup(id_or_name)? {
                return Ok(id);
            }
        }
        self.containers.find_by_prefix(id_or_name)
    }

    /// Remove a container with its name, hosts entry and, on request, its
    /// anonymous volumes.
    pub fn remove_container(&self, id_or_name: &str, remove_anonymous: bool) -> MetaResult<ContainerMeta> {
        let id = self.resolve(id_or_name)?;

        let names = self.names.lock()?;
        let containers = self.containers.lock()?;
        let volumes = self.volumes.lock()?;
        let hosts = self.hosts.lock()?;

        let meta = self.containers.get(&id)?;
        match self.names.release_owned_locked(&names, &meta.name, &id) {
            Ok(()) => {}
            Err(MetaError::NameNotOwned { holder, .. }) => {
                warn!(name = %meta.name, holder = %holder, "name now held by another container; keeping it");
            }
            Err(e) => return Err(e),
        }
        self.hosts.release_locked(&hosts, &id)?;
        if remove_anonymous {
            for volume in &meta.anonymous_volumes {
                self.volumes.remove_locked(&volumes, volume)?;
            }
        }
        // Metadata goes last so an interrupted remove can be retried.
        self.containers.remove_locked(&containers, &id)?;
        debug!(namespace = %self.namespace(), id = id.short(), name = %meta.name, "container removed");
        Ok(meta)
    }

    /// Give a container a new name.
    pub fn rename_container(&self, id_or_name: &str, new_name: &str) -> MetaResult<ContainerMeta> {
        validate_docker_compat(new_name)?;
        let id = self.resolve(id_or_name)?;

        let names = self.names.lock()?;
        let containers = self.containers.lock()?;

        let meta = self.containers.get(&id)?;
        self.names.rename_locked(&names, &meta.name, new_name, &id)?;
        let renamed = match self.containers.set_name_locked(&containers, &id, new_name) {
            Ok(meta) => meta,
            Err(e) => {
                if let Err(undo) = self.names.rename_locked(&names, new_name, &meta.name, &id) {
                    warn!(name = new_name, error = %undo, "rollback: rename left in place");
                }
                return Err(e);
            }
        };

        // Hosts files are derived from the metadata above and are rebuilt on
        // the next refresh, so a failure here does not undo the rename.
        let hosts = self.hosts.lock()?;
        let refreshed = match self.hosts.meta(&id) {
            Ok(mut entry) => {
                entry.name = new_name.to_string();
                self.hosts.acquire_locked(&hosts, &entry).map(|_| ())
            }
            Err(MetaError::ContainerNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = refreshed {
            warn!(id = id.short(), name = new_name, error = %e, "renamed, but hosts files were not updated");
        }
        Ok(renamed)
    }

    /// Remove volumes no container uses. Volumes in use are reported and kept.
    pub fn remove_volumes(&self, names: &[String]) -> MetaResult<RemoveReport> {
        for name in names {
            validate_docker_compat(name)?;
        }
        let _containers = self.containers.lock()?;
        let volumes = self.volumes.lock()?;

        let users = self.containers.list()?;
        let mut report = RemoveReport::default();
        for name in names {
            let user = users
                .iter()
                .find(|c| c.volumes.contains(name) || c.anonymous_volumes.contains(name));
            if let Some(container) = user {
                report.in_use.push((name.clone(), container.id.to_string()));
                continue;
            }
            if self.volumes.remove_locked(&volumes, name)? {
                report.removed.push(name.clone());
            } else {
                report.missing.push(name.clone());
            }
        }
        Ok(report)
    }
}
