//! Buckets: one directory of entries per (kind, namespace).
//!
//! # Locking contract
//!
//! Bucket methods never take the bucket lock themselves. Single-entry
//! operations ([`Bucket::get`], [`Bucket::set`], [`Bucket::delete`], ...) are
//! safe on their own because the atomic file primitive backs them. Anything
//! that reads before it writes, or touches several entries as a unit, must
//! run inside a lock scope obtained from [`Bucket::lock`] or
//! [`Bucket::with_lock`] and held across the whole sequence.
//!
//! The check-then-act methods ([`Bucket::create`], [`Bucket::update`],
//! [`Bucket::remove_group`]) probe for the lock and fail with
//! [`StoreError::LockNotHeld`] if nobody holds it. The probe sees lock
//! presence, not ownership, so it catches a forgotten lock but not a lock
//! held by some other process.
//!
//! # Keys
//!
//! A key is a `/`-separated path of segments relative to the bucket root,
//! e.g. `"web"` or `"<container-id>/meta.json"`. The empty key names the
//! bucket root itself, which is meaningful for [`Bucket::list`],
//! [`Bucket::group_size`] and [`Bucket::remove_group`].

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::atomic::{self, TEMP_PREFIX};
use crate::error::{StoreError, StoreResult};
use crate::lock::{self, DirLock};

/// Longest key segment accepted (the usual `NAME_MAX`).
const MAX_SEGMENT_LEN: usize = 255;

/// Default permission bits for bucket directories.
pub const DEFAULT_DIR_MODE: u32 = 0o700;

/// Default permission bits for entry files.
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// A directory of entries scoped to one namespace.
///
/// Cheap to construct; nothing touches disk until the first write or lock.
#[derive(Debug)]
pub struct Bucket {
    root: PathBuf,
    dir_mode: u32,
    file_mode: u32,
    /// Serializes threads sharing this handle. The directory lock handles
    /// other processes.
    local: Mutex<()>,
}

/// A held bucket lock.
///
/// Holds both the in-process mutex and the cross-process directory lock.
/// Both are released on drop.
#[derive(Debug)]
pub struct BucketLock<'a> {
    dir: DirLock,
    _local: MutexGuard<'a, ()>,
}

impl BucketLock<'_> {
    /// The locked bucket directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Release early. Dropping the guard has the same effect.
    pub fn release(mut self) -> StoreResult<()> {
        self.dir.release()
    }
}

impl Bucket {
    /// A bucket rooted at `root` with default permissions.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
            local: Mutex::new(()),
        }
    }

    /// Override the permission bits used for new directories and entries.
    pub fn with_modes(mut self, dir_mode: u32, file_mode: u32) -> Self {
        self.dir_mode = dir_mode;
        self.file_mode = file_mode;
        self
    }

    /// The bucket directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ---------------------------------------------------------------
    // Lock scopes
    // ---------------------------------------------------------------

    /// Block until this bucket is locked against other threads and processes.
    pub fn lock(&self) -> StoreResult<BucketLock<'_>> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        self.create_dirs(&self.root)?;
        let dir = DirLock::acquire(&self.root)?;
        Ok(BucketLock { dir, _local: local })
    }

    /// Lock the bucket only if that can be done without waiting.
    pub fn try_lock(&self) -> StoreResult<Option<BucketLock<'_>>> {
        let local = match self.local.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        self.create_dirs(&self.root)?;
        Ok(DirLock::try_acquire(&self.root)?.map(|dir| BucketLock { dir, _local: local }))
    }

    /// Run `f` with the bucket locked; the lock is released on every exit
    /// path, including early returns and panics.
    pub fn with_lock<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.lock()?;
        f(self)
    }

    /// Fail with [`StoreError::LockNotHeld`] unless some holder has the lock.
    pub fn ensure_locked(&self) -> StoreResult<()> {
        if lock::is_locked(&self.root)? {
            Ok(())
        } else {
            Err(StoreError::LockNotHeld {
                path: self.root.clone(),
            })
        }
    }

    // ---------------------------------------------------------------
    // Single-entry operations (no lock required)
    // ---------------------------------------------------------------

    /// Resolve a key to its on-disk path after validating every segment.
    pub fn location(&self, key: &str) -> StoreResult<PathBuf> {
        let mut path = self.root.clone();
        if key.is_empty() {
            return Ok(path);
        }
        for segment in key.split('/') {
            validate_segment(key, segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Read an entry's raw content.
    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.entry_path(key)?;
        atomic::read_file(&path)
    }

    /// Read an entry and decode it as JSON.
    ///
    /// Undecodable content is reported as [`StoreError::Corruption`] with the
    /// entry's path; it is never repaired or removed here.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        let path = self.entry_path(key)?;
        let bytes = atomic::read_file(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corruption(&path, e.to_string()))
    }

    /// Atomically write an entry, creating parent groups as needed.
    pub fn set(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.entry_path(key)?;
        self.ensure_parent(&path)?;
        atomic::write_file(&path, data, self.file_mode)
    }

    /// Atomically write an entry as pretty-printed JSON.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.set(key, &data)
    }

    /// Whether an entry or group exists at `key`.
    pub fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.location(key)?;
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Remove an entry. Removing an absent entry succeeds.
    ///
    /// Groups are rejected; use [`Bucket::remove_group`] under the lock.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.entry_path(key)?;
        if path.is_dir() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key names a group, not an entry".into(),
            });
        }
        atomic::remove_file(&path)
    }

    /// Names directly under `key`, sorted. An absent group lists as empty.
    ///
    /// The listing is a point-in-time view; callers needing a consistent
    /// snapshot across entries must hold the lock.
    pub fn list(&self, key: &str) -> StoreResult<Vec<String>> {
        let path = self.location(key)?;
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                trace!(path = %path.display(), "skipping non-UTF-8 entry");
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Create the group at `key` (and its parents) if missing.
    pub fn group_ensure(&self, key: &str) -> StoreResult<PathBuf> {
        let path = self.location(key)?;
        self.create_dirs(&path)?;
        Ok(path)
    }

    /// Total size in bytes of all files under `key`. Absent groups are 0.
    pub fn group_size(&self, key: &str) -> StoreResult<u64> {
        let path = self.location(key)?;
        if !path.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in WalkDir::new(&path) {
            let entry = entry.map_err(|e| {
                let at = e.path().unwrap_or(&path).to_path_buf();
                StoreError::io(&at, e.into())
            })?;
            if entry.file_type().is_file() {
                let meta = entry
                    .metadata()
                    .map_err(|e| StoreError::io(entry.path(), e.into()))?;
                total += meta.len();
            }
        }
        Ok(total)
    }

    // ---------------------------------------------------------------
    // Check-then-act operations (lock required)
    // ---------------------------------------------------------------

    /// Write an entry that must not exist yet.
    pub fn create(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.ensure_locked()?;
        let path = self.entry_path(key)?;
        if self.exists(key)? {
            return Err(StoreError::AlreadyExists { path });
        }
        self.set(key, data)
    }

    /// Read-modify-write an entry.
    ///
    /// `f` receives the current content (`None` if absent) and returns the
    /// new content; returning `None` deletes the entry.
    pub fn update<F>(&self, key: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(Option<Vec<u8>>) -> StoreResult<Option<Vec<u8>>>,
    {
        self.ensure_locked()?;
        let current = match self.get(key) {
            Ok(data) => Some(data),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        match f(current)? {
            Some(data) => self.set(key, &data),
            None => self.delete(key),
        }
    }

    /// Recursively remove the group at `key`; the empty key removes the
    /// whole bucket. Absent groups succeed.
    pub fn remove_group(&self, key: &str) -> StoreResult<()> {
        self.ensure_locked()?;
        let path = self.location(key)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed group");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn entry_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey {
                key: String::new(),
                reason: "entry key must not be empty".into(),
            });
        }
        self.location(key)
    }

    fn ensure_parent(&self, path: &Path) -> StoreResult<()> {
        match path.parent() {
            Some(parent) => self.create_dirs(parent),
            None => Ok(()),
        }
    }

    fn create_dirs(&self, path: &Path) -> StoreResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(self.dir_mode)
            .create(path)
            .map_err(|e| StoreError::io(path, e))
    }
}

/// Check that one key segment is a safe, plain path component.
pub fn validate_segment(key: &str, segment: &str) -> StoreResult<()> {
    let invalid = |reason: String| StoreError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if segment.is_empty() {
        return Err(invalid("empty path segment".into()));
    }
    if segment == "." || segment == ".." {
        return Err(invalid(format!("segment {segment:?} is not allowed")));
    }
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(invalid(format!(
            "segment longer than {MAX_SEGMENT_LEN} bytes"
        )));
    }
    if segment.contains('\0') || segment.contains('\\') {
        return Err(invalid(format!("segment {segment:?} contains a forbidden character")));
    }
    if segment.starts_with(TEMP_PREFIX) {
        return Err(invalid(format!("segment must not start with {TEMP_PREFIX:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;
    use std::thread;

    fn bucket() -> (tempfile::TempDir, Bucket) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Bucket::new(dir.path().join("names").join("default"));
        (dir, bucket)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let (_dir, bucket) = bucket();
        bucket.set("web", b"cid123").unwrap();
        assert_eq!(bucket.get("web").unwrap(), b"cid123");
        assert!(bucket.exists("web").unwrap());

        bucket.delete("web").unwrap();
        assert!(!bucket.exists("web").unwrap());
        assert!(bucket.get("web").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_missing_entry_succeeds() {
        let (_dir, bucket) = bucket();
        bucket.delete("ghost").unwrap();
    }

    #[test]
    fn bucket_created_lazily() {
        let (_dir, bucket) = bucket();
        assert!(!bucket.root().exists());
        assert_eq!(bucket.list("").unwrap(), Vec::<String>::new());
        assert!(!bucket.root().exists());

        bucket.set("web", b"x").unwrap();
        assert!(bucket.root().is_dir());
    }

    #[test]
    fn nested_keys_create_groups() {
        let (_dir, bucket) = bucket();
        bucket.set("abc/meta.json", b"{}").unwrap();
        bucket.set("abc/hosts", b"").unwrap();
        bucket.set("def/meta.json", b"{}").unwrap();

        assert_eq!(bucket.list("").unwrap(), vec!["abc", "def"]);
        assert_eq!(bucket.list("abc").unwrap(), vec!["hosts", "meta.json"]);
    }

    #[test]
    fn invalid_keys_rejected() {
        let (_dir, bucket) = bucket();
        for key in ["..", "a/../b", "a//b", "/abs", ".", "x\0y", ".tmp-123"] {
            let err = bucket.set(key, b"x").unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{key:?}: {err}");
        }
        assert!(bucket.set("", b"x").is_err());
        assert!(bucket.location(&"a".repeat(256)).is_err());
    }

    #[test]
    fn json_roundtrip_and_corruption() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Meta {
            labels: Vec<String>,
        }

        let (_dir, bucket) = bucket();
        let meta = Meta {
            labels: vec!["a".into()],
        };
        bucket.set_json("vol/volume.json", &meta).unwrap();
        assert_eq!(bucket.get_json::<Meta>("vol/volume.json").unwrap(), meta);

        bucket.set("vol/volume.json", b"{\"labels\": [").unwrap();
        let err = bucket.get_json::<Meta>("vol/volume.json").unwrap_err();
        match err {
            StoreError::Corruption { path, .. } => {
                assert!(path.ends_with("vol/volume.json"));
            }
            other => panic!("expected Corruption, got: {other}"),
        }
        // Corrupt entries are left in place for inspection.
        assert!(bucket.exists("vol/volume.json").unwrap());
    }

    #[test]
    fn create_requires_lock() {
        let (_dir, bucket) = bucket();
        let err = bucket.create("web", b"cid").unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld { .. }), "got: {err}");
        assert!(!bucket.exists("web").unwrap());
    }

    #[test]
    fn update_and_remove_group_require_lock() {
        let (_dir, bucket) = bucket();
        bucket.set("grp/file", b"x").unwrap();

        let err = bucket.update("grp/file", |_| Ok(None)).unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld { .. }));
        let err = bucket.remove_group("grp").unwrap_err();
        assert!(matches!(err, StoreError::LockNotHeld { .. }));
        assert!(bucket.exists("grp/file").unwrap());
    }

    #[test]
    fn create_under_lock() {
        let (_dir, bucket) = bucket();
        bucket
            .with_lock(|b| {
                b.create("web", b"cid123")?;
                let err = b.create("web", b"cid456").unwrap_err();
                assert!(matches!(err, StoreError::AlreadyExists { .. }));
                Ok::<_, StoreError>(())
            })
            .unwrap();
        assert_eq!(bucket.get("web").unwrap(), b"cid123");
    }

    #[test]
    fn update_reads_modifies_and_deletes() {
        let (_dir, bucket) = bucket();
        let _guard = bucket.lock().unwrap();

        bucket
            .update("counter", |cur| {
                assert!(cur.is_none());
                Ok(Some(b"1".to_vec()))
            })
            .unwrap();
        bucket
            .update("counter", |cur| {
                assert_eq!(cur.as_deref(), Some(&b"1"[..]));
                Ok(Some(b"2".to_vec()))
            })
            .unwrap();
        assert_eq!(bucket.get("counter").unwrap(), b"2");

        bucket.update("counter", |_| Ok(None)).unwrap();
        assert!(!bucket.exists("counter").unwrap());
    }

    #[test]
    fn remove_group_is_recursive_and_idempotent() {
        let (_dir, bucket) = bucket();
        bucket.set("grp/a", b"x").unwrap();
        bucket.set("grp/sub/b", b"y").unwrap();

        let _guard = bucket.lock().unwrap();
        bucket.remove_group("grp").unwrap();
        bucket.remove_group("grp").unwrap();
        assert!(!bucket.exists("grp").unwrap());
    }

    #[test]
    fn delete_rejects_groups() {
        let (_dir, bucket) = bucket();
        bucket.set("grp/a", b"x").unwrap();
        assert!(matches!(
            bucket.delete("grp").unwrap_err(),
            StoreError::InvalidKey { .. }
        ));
    }

    #[test]
    fn group_size_sums_files() {
        let (_dir, bucket) = bucket();
        assert_eq!(bucket.group_size("vol").unwrap(), 0);
        bucket.set("vol/a", &[0u8; 100]).unwrap();
        bucket.set("vol/deep/b", &[0u8; 23]).unwrap();
        assert_eq!(bucket.group_size("vol").unwrap(), 123);
        assert_eq!(bucket.group_ensure("empty").unwrap(), bucket.root().join("empty"));
        assert_eq!(bucket.group_size("empty").unwrap(), 0);
    }

    #[test]
    fn lock_released_on_error_and_panic() {
        let (_dir, bucket) = bucket();

        let result: StoreResult<()> = bucket.with_lock(|b| {
            Err(StoreError::NotFound {
                path: b.root().to_path_buf(),
            })
        });
        assert!(result.is_err());
        assert!(!lock::is_locked(bucket.root()).unwrap());

        let bucket = Arc::new(bucket);
        let panicking = Arc::clone(&bucket);
        let joined = thread::spawn(move || {
            let _guard = panicking.lock().unwrap();
            panic!("boom");
        })
        .join();
        assert!(joined.is_err());
        assert!(!lock::is_locked(bucket.root()).unwrap());
        // The poisoned mutex does not wedge later callers.
        assert!(bucket.try_lock().unwrap().is_some());
    }

    #[test]
    fn try_lock_reports_busy() {
        let (_dir, bucket) = bucket();
        let other = Bucket::new(bucket.root());

        let guard = bucket.lock().unwrap();
        assert!(other.try_lock().unwrap().is_none());
        assert!(bucket.try_lock().unwrap().is_none());
        guard.release().unwrap();
        assert!(other.try_lock().unwrap().is_some());
    }

    #[test]
    fn shared_handle_serializes_threads() {
        let (_dir, bucket) = bucket();
        let bucket = Arc::new(bucket);
        bucket.set("counter", b"0").unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || {
                    for _ in 0..10 {
                        bucket
                            .with_lock(|b| {
                                b.update("counter", |cur| {
                                    let n: u32 = String::from_utf8(cur.unwrap_or_default())
                                        .unwrap()
                                        .parse()
                                        .unwrap();
                                    Ok(Some((n + 1).to_string().into_bytes()))
                                })
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(bucket.get("counter").unwrap(), b"80");
    }
}
