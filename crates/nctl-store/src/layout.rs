//! On-disk layout of the data store.
//!
//! ```text
//! <data_root>/<addr_hash>/
//!   containers/<namespace>/<container-id>/
//!   names/<namespace>/<name>
//!   etchosts/<namespace>/<container-id>/{hosts,meta.json}
//!   volumes/<namespace>/<volume-name>/{_data/,volume.json}
//! ```
//!
//! `addr_hash` keeps stores for different containerd instances apart: it is
//! the first 8 hex characters of the SHA-256 of the socket path (symlinks
//! resolved when the socket exists).

use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nctl_types::Namespace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::bucket::{Bucket, BucketLock, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use crate::error::{StoreError, StoreResult};

/// Number of hex characters of the address digest used in the path.
const ADDR_HASH_LEN: usize = 8;

/// Where the store lives and which containerd it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for all persistent client state.
    pub data_root: PathBuf,
    /// containerd socket address (`unix://` prefix optional).
    pub address: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/var/lib/nctl"),
            address: "/run/containerd/containerd.sock".to_string(),
        }
    }
}

/// The kinds of bucket kept per namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKind {
    Containers,
    Names,
    EtcHosts,
    Volumes,
}

impl BucketKind {
    pub const ALL: [BucketKind; 4] = [
        BucketKind::Containers,
        BucketKind::Names,
        BucketKind::EtcHosts,
        BucketKind::Volumes,
    ];

    /// Directory name under the store root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Containers => "containers",
            Self::Names => "names",
            Self::EtcHosts => "etchosts",
            Self::Volumes => "volumes",
        }
    }

    /// Permission bits (directory, file) for buckets of this kind.
    ///
    /// Hosts files are bind-mounted into containers and volume data is
    /// traversed by container processes, so those are world-readable.
    fn modes(self) -> (u32, u32) {
        match self {
            Self::EtcHosts => (0o755, 0o644),
            Self::Volumes => (0o711, DEFAULT_FILE_MODE),
            Self::Containers | Self::Names => (DEFAULT_DIR_MODE, DEFAULT_FILE_MODE),
        }
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for BucketKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.dir_name() == s)
            .ok_or_else(|| StoreError::InvalidKey {
                key: s.to_string(),
                reason: "unknown bucket kind".into(),
            })
    }
}

/// Compute the per-address directory name.
pub fn addr_hash(address: &str) -> String {
    let trimmed = address.strip_prefix("unix://").unwrap_or(address);
    let resolved = match fs::canonicalize(trimmed) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(e) => {
            debug!(address = trimmed, error = %e, "address not resolvable; hashing as given");
            trimmed.to_string()
        }
    };
    let digest = Sha256::digest(resolved.as_bytes());
    hex::encode(digest)[..ADDR_HASH_LEN].to_string()
}

/// Handle on the store root for one containerd address.
#[derive(Clone, Debug)]
pub struct DataStore {
    root: PathBuf,
}

impl DataStore {
    /// Open (creating if needed) the store described by `config`.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let root = config.data_root.join(addr_hash(&config.address));
        DirBuilder::new()
            .recursive(true)
            .mode(DEFAULT_DIR_MODE)
            .create(&root)
            .map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "opened data store");
        Ok(Self { root })
    }

    /// Use an already-resolved root directory as is.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every namespace bucket of `kind`.
    pub fn kind_dir(&self, kind: BucketKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// The bucket of `kind` for `namespace`.
    pub fn bucket(&self, kind: BucketKind, namespace: &Namespace) -> Bucket {
        let (dir_mode, file_mode) = kind.modes();
        Bucket::new(self.kind_dir(kind).join(namespace.as_str())).with_modes(dir_mode, file_mode)
    }

    /// Namespaces that have a bucket of `kind`, sorted.
    ///
    /// Directory names that are not valid namespaces are skipped with a
    /// warning.
    pub fn namespaces(&self, kind: BucketKind) -> StoreResult<Vec<Namespace>> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(Namespace::new) {
                Some(Ok(ns)) => namespaces.push(ns),
                _ => warn!(dir = %dir.display(), entry = ?name, "ignoring unexpected directory"),
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    /// Remove one namespace's bucket of `kind`.
    ///
    /// `guard` must be the caller's lock on that very bucket, so the removal
    /// can be part of a larger locked sequence.
    pub fn remove_namespace_bucket(
        &self,
        kind: BucketKind,
        namespace: &Namespace,
        guard: &BucketLock<'_>,
    ) -> StoreResult<()> {
        let bucket = self.bucket(kind, namespace);
        if guard.path() != bucket.root() {
            return Err(StoreError::LockNotHeld {
                path: bucket.root().to_path_buf(),
            });
        }
        bucket.remove_group("")?;
        debug!(kind = %kind, namespace = %namespace, "removed namespace bucket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(name: &str) -> Namespace {
        Namespace::new(name).unwrap()
    }

    #[test]
    fn addr_hash_is_short_hex() {
        let h = addr_hash("/nonexistent/containerd.sock");
        assert_eq!(h.len(), ADDR_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn addr_hash_ignores_unix_scheme() {
        assert_eq!(
            addr_hash("unix:///nonexistent/containerd.sock"),
            addr_hash("/nonexistent/containerd.sock")
        );
        assert_ne!(addr_hash("/a.sock"), addr_hash("/b.sock"));
    }

    #[test]
    fn addr_hash_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.sock");
        fs::write(&real, b"").unwrap();
        let link = dir.path().join("link.sock");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        assert_eq!(
            addr_hash(link.to_str().unwrap()),
            addr_hash(real.to_str().unwrap())
        );
    }

    #[test]
    fn open_creates_root_under_addr_hash() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            data_root: dir.path().to_path_buf(),
            address: "/nonexistent/containerd.sock".into(),
        };
        let store = DataStore::open(&config).unwrap();
        assert!(store.root().is_dir());
        assert_eq!(
            store.root(),
            dir.path().join(addr_hash("/nonexistent/containerd.sock"))
        );
    }

    #[test]
    fn bucket_paths_follow_layout() {
        let store = DataStore::at("/data/abcd1234");
        let bucket = store.bucket(BucketKind::Names, &ns("default"));
        assert_eq!(bucket.root(), Path::new("/data/abcd1234/names/default"));
        let bucket = store.bucket(BucketKind::EtcHosts, &ns("k8s.io"));
        assert_eq!(bucket.root(), Path::new("/data/abcd1234/etchosts/k8s.io"));
    }

    #[test]
    fn bucket_kind_parses() {
        for kind in BucketKind::ALL {
            assert_eq!(kind.dir_name().parse::<BucketKind>().unwrap(), kind);
        }
        assert!("networks".parse::<BucketKind>().is_err());
    }

    #[test]
    fn namespaces_lists_sorted_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::at(dir.path());
        store.bucket(BucketKind::Names, &ns("zeta")).set("web", b"x").unwrap();
        store.bucket(BucketKind::Names, &ns("alpha")).set("db", b"y").unwrap();
        fs::create_dir_all(store.kind_dir(BucketKind::Names).join("..bad")).unwrap();
        fs::write(store.kind_dir(BucketKind::Names).join("stray-file"), b"").unwrap();

        let found = store.namespaces(BucketKind::Names).unwrap();
        assert_eq!(found, vec![ns("alpha"), ns("zeta")]);
        assert!(store.namespaces(BucketKind::Volumes).unwrap().is_empty());
    }

    #[test]
    fn remove_namespace_bucket_leaves_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::at(dir.path());
        store.bucket(BucketKind::Names, &ns("one")).set("web", b"x").unwrap();
        store.bucket(BucketKind::Names, &ns("two")).set("web", b"y").unwrap();

        for _ in 0..2 {
            let bucket = store.bucket(BucketKind::Names, &ns("one"));
            let guard = bucket.lock().unwrap();
            store
                .remove_namespace_bucket(BucketKind::Names, &ns("one"), &guard)
                .unwrap();
        }

        assert_eq!(store.namespaces(BucketKind::Names).unwrap(), vec![ns("two")]);
    }

    #[test]
    fn remove_namespace_bucket_needs_that_bucket_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::at(dir.path());
        store.bucket(BucketKind::Names, &ns("one")).set("web", b"x").unwrap();

        let other = store.bucket(BucketKind::Volumes, &ns("one"));
        let guard = other.lock().unwrap();
        let err = store
            .remove_namespace_bucket(BucketKind::Names, &ns("one"), &guard)
            .unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld { .. }), "got: {err}");
        assert!(store.bucket(BucketKind::Names, &ns("one")).exists("web").unwrap());
    }
}
