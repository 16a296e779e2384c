//! Per-container metadata directories.
//!
//! Each container owns the group `containers/<namespace>/<id>/` holding
//! `meta.json`, the JSON log `<id>-json.log` and one
//! `oci-hook.<event>.log` per runtime hook event.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use nctl_store::{Bucket, BucketKind, BucketLock, DataStore, StoreError};
use nctl_types::{ContainerId, Namespace};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};

const META_FILE: &str = "meta.json";

/// Characters of the ID appended to generated names.
const NAME_SUFFIX_LEN: usize = 5;

/// Lifecycle state recorded for a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    #[default]
    Created,
    Running,
    Paused,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "exited" => Ok(Self::Exited),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown container state: {other}")),
        }
    }
}

/// Content of `meta.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub id: ContainerId,
    pub name: String,
    pub namespace: Namespace,
    pub image: String,
    #[serde(default)]
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Named volumes mounted by the container.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Volumes created for this container and removed with it on request.
    #[serde(default)]
    pub anonymous_volumes: Vec<String>,
}

impl ContainerMeta {
    /// Metadata for a freshly created container.
    pub fn new(id: ContainerId, name: &str, namespace: &Namespace, image: &str) -> Self {
        Self {
            hostname: id.short().to_string(),
            id,
            name: name.to_string(),
            namespace: namespace.clone(),
            image: image.to_string(),
            created_at: Utc::now(),
            state: ContainerState::Created,
            labels: BTreeMap::new(),
            volumes: Vec::new(),
            anonymous_volumes: Vec::new(),
        }
    }
}

/// Name given to a container created without one: the image's last path
/// component (tag and digest stripped) and the start of the ID.
///
/// ```
/// use nctl_meta::default_name;
/// use nctl_types::ContainerId;
///
/// let id = ContainerId::new("ab12cd".repeat(10) + "ef01").unwrap();
/// assert_eq!(default_name("docker.io/library/nginx:1.27", &id), "nginx-ab12c");
/// ```
pub fn default_name(image: &str, id: &ContainerId) -> String {
    let base = image.rsplit('/').next().unwrap_or(image);
    let base = base.split(['@', ':']).next().unwrap_or(base);
    let suffix = &id.as_str()[..NAME_SUFFIX_LEN];
    if base.is_empty() {
        format!("container-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

/// Container metadata of one namespace.
#[derive(Debug)]
pub struct ContainerStore {
    namespace: Namespace,
    bucket: Bucket,
}

impl ContainerStore {
    pub fn new(store: &DataStore, namespace: &Namespace) -> Self {
        Self {
            namespace: namespace.clone(),
            bucket: store.bucket(BucketKind::Containers, namespace),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn lock(&self) -> MetaResult<BucketLock<'_>> {
        Ok(self.bucket.lock()?)
    }

    /// Register a new container.
    pub fn create(&self, meta: &ContainerMeta) -> MetaResult<()> {
        let guard = self.lock()?;
        self.create_locked(&guard, meta)
    }

    /// [`Self::create`] for callers already holding [`Self::lock`].
    pub fn create_locked(&self, guard: &BucketLock<'_>, meta: &ContainerMeta) -> MetaResult<()> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        let data = serde_json::to_vec_pretty(meta)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        match self.bucket.create(&meta_key(&meta.id), &data) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                return Err(MetaError::ContainerExists {
                    id: meta.id.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        debug!(namespace = %self.namespace, id = meta.id.short(), name = %meta.name, "container registered");
        Ok(())
    }

    pub fn get(&self, id: &ContainerId) -> MetaResult<ContainerMeta> {
        match self.bucket.get_json(&meta_key(id)) {
            Ok(meta) => Ok(meta),
            Err(e) if e.is_not_found() => Err(MetaError::ContainerNotFound { id: id.to_string() }),
            Err(e) => Err(e.into()),
        }
    }

    /// All registered containers, sorted by ID.
    pub fn list(&self) -> MetaResult<Vec<ContainerMeta>> {
        let mut containers = Vec::new();
        for entry in self.bucket.list("")? {
            let Ok(id) = ContainerId::new(entry.as_str()) else {
                warn!(namespace = %self.namespace, entry = %entry, "ignoring unexpected container entry");
                continue;
            };
            match self.get(&id) {
                Ok(meta) => containers.push(meta),
                Err(MetaError::ContainerNotFound { .. }) => {
                    debug!(namespace = %self.namespace, id = id.short(), "skipping container without metadata");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(containers)
    }

    /// Whether `id` has registered metadata.
    pub fn exists(&self, id: &ContainerId) -> MetaResult<bool> {
        Ok(self.bucket.exists(&meta_key(id))?)
    }

    /// Resolve a full ID or a unique ID prefix.
    pub fn find_by_prefix(&self, prefix: &str) -> MetaResult<ContainerId> {
        if let Ok(id) = ContainerId::new(prefix) {
            if self.exists(&id)? {
                return Ok(id);
            }
        }
        let not_found = || MetaError::ContainerNotFound {
            id: prefix.to_string(),
        };
        if prefix.is_empty() {
            return Err(not_found());
        }
        let mut matches = self
            .list()?
            .into_iter()
            .filter(|meta| meta.id.as_str().starts_with(prefix));
        let first = matches.next().ok_or_else(not_found)?;
        if matches.next().is_some() {
            return Err(MetaError::AmbiguousId {
                prefix: prefix.to_string(),
            });
        }
        Ok(first.id)
    }

    /// Record a lifecycle transition.
    pub fn update_state(&self, id: &ContainerId, state: ContainerState) -> MetaResult<ContainerMeta> {
        self.modify(id, |meta| meta.state = state)
    }

    /// Record a new name. The name store claim is the caller's business.
    pub fn set_name(&self, id: &ContainerId, name: &str) -> MetaResult<ContainerMeta> {
        let guard = self.lock()?;
        self.set_name_locked(&guard, id, name)
    }

    /// [`Self::set_name`] for callers already holding [`Self::lock`].
    pub fn set_name_locked(
        &self,
        guard: &BucketLock<'_>,
        id: &ContainerId,
        name: &str,
    ) -> MetaResult<ContainerMeta> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        self.modify_locked(id, |meta| meta.name = name.to_string())
    }

    /// Remove the container's whole group. Returns whether it existed.
    pub fn remove(&self, id: &ContainerId) -> MetaResult<bool> {
        let guard = self.lock()?;
        self.remove_locked(&guard, id)
    }

    /// [`Self::remove`] for callers already holding [`Self::lock`].
    pub fn remove_locked(&self, guard: &BucketLock<'_>, id: &ContainerId) -> MetaResult<bool> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        if !self.bucket.exists(id.as_str())? {
            return Ok(false);
        }
        self.bucket.remove_group(id.as_str())?;
        debug!(namespace = %self.namespace, id = id.short(), "container removed");
        Ok(true)
    }

    pub fn container_dir(&self, id: &ContainerId) -> MetaResult<PathBuf> {
        Ok(self.bucket.location(id.as_str())?)
    }

    /// JSON log written by the log driver.
    pub fn log_path(&self, id: &ContainerId) -> MetaResult<PathBuf> {
        Ok(self.bucket.location(&format!("{id}/{id}-json.log"))?)
    }

    /// Log of one OCI hook event, e.g. `createRuntime`.
    pub fn hook_log_path(&self, id: &ContainerId, event: &str) -> MetaResult<PathBuf> {
        Ok(self.bucket.location(&format!("{id}/oci-hook.{event}.log"))?)
    }

    fn modify(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut ContainerMeta),
    ) -> MetaResult<ContainerMeta> {
        let _guard = self.lock()?;
        self.modify_locked(id, f)
    }

    fn modify_locked(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut ContainerMeta),
    ) -> MetaResult<ContainerMeta> {
        let key = meta_key(id);
        let path = self.bucket.location(&key)?;
        let mut updated = None;
        let result = self.bucket.update(&key, |current| {
            let Some(raw) = current else {
                return Err(StoreError::NotFound { path: path.clone() });
            };
            let mut meta: ContainerMeta = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::corruption(&path, e.to_string()))?;
            f(&mut meta);
            let data = serde_json::to_vec_pretty(&meta)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            updated = Some(meta);
            Ok(Some(data))
        });
        match (result, updated) {
            (Ok(()), Some(meta)) => Ok(meta),
            (Err(e), _) if e.is_not_found() => Err(MetaError::ContainerNotFound { id: id.to_string() }),
            (Err(e), _) => Err(e.into()),
            (Ok(()), None) => Err(MetaError::ContainerNotFound { id: id.to_string() }),
        }
    }
}

fn meta_key(id: &ContainerId) -> String {
    format!("{id}/{META_FILE}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, ContainerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::at(dir.path());
        let containers = ContainerStore::new(&store, &Namespace::default());
        (dir, containers)
    }

    fn meta(id: ContainerId, name: &str) -> ContainerMeta {
        ContainerMeta::new(id, name, &Namespace::default(), "alpine:3")
    }

    fn id_with_prefix(prefix: &str) -> ContainerId {
        let mut s = prefix.to_string();
        s.push_str(&"0".repeat(64 - prefix.len()));
        ContainerId::new(s).unwrap()
    }

    #[test]
    fn create_and_get() {
        let (dir, containers) = setup();
        let id = ContainerId::generate();
        let m = meta(id.clone(), "web");
        containers.create(&m).unwrap();

        assert_eq!(containers.get(&id).unwrap(), m);
        let on_disk = dir
            .path()
            .join("containers/default")
            .join(id.as_str())
            .join("meta.json");
        assert!(on_disk.is_file());
    }

    #[test]
    fn duplicate_id_rejected() {
        let (_dir, containers) = setup();
        let id = ContainerId::generate();
        containers.create(&meta(id.clone(), "web")).unwrap();
        assert!(matches!(
            containers.create(&meta(id.clone(), "other")).unwrap_err(),
            MetaError::ContainerExists { .. }
        ));
        assert_eq!(containers.get(&id).unwrap().name, "web");
    }

    #[test]
    fn get_missing() {
        let (_dir, containers) = setup();
        assert!(matches!(
            containers.get(&ContainerId::generate()).unwrap_err(),
            MetaError::ContainerNotFound { .. }
        ));
    }

    #[test]
    fn update_state_persists() {
        let (_dir, containers) = setup();
        let id = ContainerId::generate();
        containers.create(&meta(id.clone(), "web")).unwrap();

        let updated = containers.update_state(&id, ContainerState::Running).unwrap();
        assert_eq!(updated.state, ContainerState::Running);
        assert_eq!(containers.get(&id).unwrap().state, ContainerState::Running);

        assert!(matches!(
            containers
                .update_state(&ContainerId::generate(), ContainerState::Exited)
                .unwrap_err(),
            MetaError::ContainerNotFound { .. }
        ));
    }

    #[test]
    fn set_name_persists() {
        let (_dir, containers) = setup();
        let id = ContainerId::generate();
        containers.create(&meta(id.clone(), "web")).unwrap();
        containers.set_name(&id, "api").unwrap();
        assert_eq!(containers.get(&id).unwrap().name, "api");
    }

    #[test]
    fn list_skips_groups_without_metadata() {
        let (dir, containers) = setup();
        let a = id_with_prefix("aa");
        let b = id_with_prefix("bb");
        containers.create(&meta(b.clone(), "b1")).unwrap();
        containers.create(&meta(a.clone(), "a1")).unwrap();
        let orphan = id_with_prefix("cc");
        fs::create_dir_all(dir.path().join("containers/default").join(orphan.as_str())).unwrap();

        let ids: Vec<_> = containers.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn find_by_prefix_resolves_unique_prefixes() {
        let (_dir, containers) = setup();
        let a = id_with_prefix("abc1");
        let b = id_with_prefix("abc2");
        containers.create(&meta(a.clone(), "a1")).unwrap();
        containers.create(&meta(b.clone(), "b1")).unwrap();

        assert_eq!(containers.find_by_prefix("abc1").unwrap(), a);
        assert_eq!(containers.find_by_prefix(b.as_str()).unwrap(), b);
        assert!(matches!(
            containers.find_by_prefix("abc").unwrap_err(),
            MetaError::AmbiguousId { .. }
        ));
        assert!(matches!(
            containers.find_by_prefix("ffff").unwrap_err(),
            MetaError::ContainerNotFound { .. }
        ));
        assert!(containers.find_by_prefix("").is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, containers) = setup();
        let id = ContainerId::generate();
        containers.create(&meta(id.clone(), "web")).unwrap();
        fs::write(containers.log_path(&id).unwrap(), b"{}\n").unwrap();

        assert!(containers.remove(&id).unwrap());
        assert!(!containers.remove(&id).unwrap());
        assert!(!containers.container_dir(&id).unwrap().exists());
    }

    #[test]
    fn log_paths_live_in_container_dir() {
        let (_dir, containers) = setup();
        let id = ContainerId::generate();
        let dir = containers.container_dir(&id).unwrap();
        assert_eq!(
            containers.log_path(&id).unwrap(),
            dir.join(format!("{id}-json.log"))
        );
        assert_eq!(
            containers.hook_log_path(&id, "createRuntime").unwrap(),
            dir.join("oci-hook.createRuntime.log")
        );
    }

    #[test]
    fn default_names() {
        let id = id_with_prefix("1234567");
        assert_eq!(default_name("alpine", &id), "alpine-12345");
        assert_eq!(default_name("ghcr.io/org/app:v1", &id), "app-12345");
        assert_eq!(default_name("busybox@sha256:abcd", &id), "busybox-12345");
        assert_eq!(default_name("", &id), "container-12345");
    }

    #[test]
    fn state_parses() {
        for state in [
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Exited,
            ContainerState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<ContainerState>().unwrap(), state);
        }
        assert!("zombie".parse::<ContainerState>().is_err());
    }
}
