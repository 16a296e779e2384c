//! Named and anonymous volumes.
//!
//! A volume is the group `volumes/<namespace>/<name>/` holding the data
//! directory `_data/` and the descriptor `volume.json`. The descriptor is
//! written last and removed first, so a directory without one is an
//! incomplete create or remove and is not reported as a volume.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use nctl_store::{Bucket, BucketKind, BucketLock, DataStore, StoreError};
use nctl_types::{validate_docker_compat, Namespace};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MetaError, MetaResult};

const DATA_DIR: &str = "_data";
const DESCRIPTOR: &str = "volume.json";
const DATA_DIR_MODE: u32 = 0o755;

/// Length in bytes of the random part of an anonymous volume name.
const ANONYMOUS_NAME_BYTES: usize = 32;

/// A volume as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Host path of the data directory.
    pub mountpoint: PathBuf,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Bytes used under `_data`, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// On-disk content of `volume.json`.
#[derive(Debug, Serialize, Deserialize)]
struct Descriptor {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

/// Outcome of removing a batch of volumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub missing: Vec<String>,
    /// Volumes kept because a container still uses them, with that container.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub in_use: Vec<(String, String)>,
}

/// Volumes of one namespace.
#[derive(Debug)]
pub struct VolumeStore {
    namespace: Namespace,
    bucket: Bucket,
}

impl VolumeStore {
    pub fn new(store: &DataStore, namespace: &Namespace) -> Self {
        Self {
            namespace: namespace.clone(),
            bucket: store.bucket(BucketKind::Volumes, namespace),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn lock(&self) -> MetaResult<BucketLock<'_>> {
        Ok(self.bucket.lock()?)
    }

    /// Create a volume, or return the existing one unchanged.
    pub fn create(&self, name: &str, labels: BTreeMap<String, String>) -> MetaResult<Volume> {
        validate_docker_compat(name)?;
        let guard = self.lock()?;
        self.create_locked(&guard, name, labels)
    }

    /// [`Self::create`] for callers already holding [`Self::lock`].
    pub fn create_locked(
        &self,
        guard: &BucketLock<'_>,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> MetaResult<Volume> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        validate_docker_compat(name)?;
        if self.bucket.exists(&descriptor_key(name))? {
            debug!(namespace = %self.namespace, name, "volume exists; returning it");
            return self.get(name, false);
        }

        let data = self.bucket.group_ensure(&data_key(name))?;
        fs::set_permissions(&data, fs::Permissions::from_mode(DATA_DIR_MODE))
            .map_err(|e| StoreError::io(&data, e))?;

        let descriptor = Descriptor {
            labels,
            created_at: Some(Utc::now()),
        };
        self.bucket.set_json(&descriptor_key(name), &descriptor)?;
        debug!(namespace = %self.namespace, name, "volume created");

        Ok(Volume {
            name: name.to_string(),
            mountpoint: data,
            labels: descriptor.labels,
            created_at: descriptor.created_at,
            size: None,
        })
    }

    /// Create a volume with a random 64-hex-character name.
    pub fn create_anonymous(&self, labels: BTreeMap<String, String>) -> MetaResult<Volume> {
        let guard = self.lock()?;
        self.create_anonymous_locked(&guard, labels)
    }

    /// [`Self::create_anonymous`] for callers already holding [`Self::lock`].
    pub fn create_anonymous_locked(
        &self,
        guard: &BucketLock<'_>,
        labels: BTreeMap<String, String>,
    ) -> MetaResult<Volume> {
        let mut bytes = [0u8; ANONYMOUS_NAME_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.create_locked(guard, &hex::encode(bytes), labels)
    }

    /// Look up one volume. `with_size` walks its data directory.
    pub fn get(&self, name: &str, with_size: bool) -> MetaResult<Volume> {
        validate_docker_compat(name)?;
        let descriptor: Descriptor = match self.bucket.get_json(&descriptor_key(name)) {
            Ok(d) => d,
            Err(e) if e.is_not_found() => {
                return Err(MetaError::VolumeNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let size = if with_size {
            Some(self.bucket.group_size(&data_key(name))?)
        } else {
            None
        };
        Ok(Volume {
            name: name.to_string(),
            mountpoint: self.bucket.location(&data_key(name))?,
            labels: descriptor.labels,
            created_at: descriptor.created_at,
            size,
        })
    }

    pub fn exists(&self, name: &str) -> MetaResult<bool> {
        validate_docker_compat(name)?;
        Ok(self.bucket.exists(&descriptor_key(name))?)
    }

    /// All complete volumes, sorted by name.
    pub fn list(&self, with_size: bool) -> MetaResult<Vec<Volume>> {
        let mut volumes = Vec::new();
        for name in self.bucket.list("")? {
            if validate_docker_compat(&name).is_err() {
                warn!(namespace = %self.namespace, entry = %name, "ignoring unexpected volume entry");
                continue;
            }
            match self.get(&name, with_size) {
                Ok(volume) => volumes.push(volume),
                Err(MetaError::VolumeNotFound { .. }) => {
                    debug!(namespace = %self.namespace, name = %name, "skipping incomplete volume");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(volumes)
    }

    /// Remove volumes by name. Missing names are reported, not fatal.
    pub fn remove(&self, names: &[String]) -> MetaResult<RemoveReport> {
        for name in names {
            validate_docker_compat(name)?;
        }
        let guard = self.lock()?;
        let mut report = RemoveReport::default();
        for name in names {
            if self.remove_locked(&guard, name)? {
                report.removed.push(name.clone());
            } else {
                report.missing.push(name.clone());
            }
        }
        Ok(report)
    }

    /// Remove one volume under a held lock. Returns whether it existed.
    pub fn remove_locked(&self, guard: &BucketLock<'_>, name: &str) -> MetaResult<bool> {
        debug_assert_eq!(guard.path(), self.bucket.root());
        validate_docker_compat(name)?;
        if !self.bucket.exists(name)? {
            return Ok(false);
        }
        let complete = self.bucket.exists(&descriptor_key(name))?;
        self.bucket.delete(&descriptor_key(name))?;
        self.bucket.remove_group(name)?;
        debug!(namespace = %self.namespace, name, complete, "volume removed");
        Ok(complete)
    }
}

fn data_key(name: &str) -> String {
    format!("{name}/{DATA_DIR}")
}

fn descriptor_key(name: &str) -> String {
    format!("{name}/{DESCRIPTOR}")
}
