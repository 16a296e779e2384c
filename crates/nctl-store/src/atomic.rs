//! Crash-safe writes of single files.
//!
//! Every regular write goes to a temporary file in the target's directory,
//! is fsynced, and is then renamed over the target. Readers therefore see
//! either the old content or the new content, never a torn mix, and a crash
//! at any point leaves the old content in place. A stale temporary file is
//! the worst leftover, and bucket listings skip those by prefix.
//!
//! [`rewrite_in_place`] is the exception for files bind-mounted into a
//! running container (`/etc/hosts`): a rename would swap the inode out from
//! under the mount, so those are truncated and rewritten instead.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Prefix of in-flight temporary files. Keys may not start with it.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Atomically replace the content of `path`.
///
/// On any failure before the rename the previous content (if any) is left
/// untouched and the temporary file is removed. No retries are attempted.
pub fn write_file(path: &Path, content: &[u8], perm: u32) -> StoreResult<()> {
    let dir = path.parent().ok_or_else(|| StoreError::InvalidKey {
        key: path.display().to_string(),
        reason: "path has no parent directory".into(),
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))?;
    temp.write_all(content)
        .map_err(|e| StoreError::io(temp.path(), e))?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(perm))
        .map_err(|e| StoreError::io(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;

    sync_dir(dir);
    debug!(path = %path.display(), len = content.len(), "atomic write");
    Ok(())
}

/// Read the full content of `path`.
///
/// Fails with [`StoreError::NotFound`] if the file is absent. Content is
/// returned uninterpreted; structural checks belong to the caller.
pub fn read_file(path: &Path) -> StoreResult<Vec<u8>> {
    fs::read(path).map_err(|e| StoreError::io(path, e))
}

/// Remove `path`. A missing file counts as success.
pub fn remove_file(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(dir) = path.parent() {
                sync_dir(dir);
            }
            debug!(path = %path.display(), "removed entry");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Overwrite `path` without changing its inode.
///
/// Used for files that are bind-mounted elsewhere. Between the truncate and
/// the end of the write a concurrent reader can observe a short file.
pub fn rewrite_in_place(path: &Path, content: &[u8], perm: u32) -> StoreResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(perm)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    file.write_all(content)
        .map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))?;
    debug!(path = %path.display(), len = content.len(), "in-place rewrite");
    Ok(())
}

/// Persist directory entries (renames, unlinks) to disk.
///
/// Some filesystems refuse fsync on directories; the data write itself has
/// already succeeded at this point, so that is logged rather than returned.
fn sync_dir(dir: &Path) {
    let result = File::open(dir).and_then(|d| d.sync_all());
    if let Err(e) = result {
        warn!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");

        write_file(&path, b"hello", 0o600).unwrap();
        assert_eq!(read_file(&path).unwrap(), b"hello");

        write_file(&path, b"world!", 0o600).unwrap();
        assert_eq!(read_file(&path).unwrap(), b"world!");
    }

    #[test]
    fn write_applies_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        write_file(&path, b"x", 0o640).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        for i in 0..10 {
            write_file(&path, format!("v{i}").as_bytes(), 0o600).unwrap();
        }
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("entry")]);
    }

    #[test]
    fn failed_write_keeps_old_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        write_file(&path, b"original", 0o600).unwrap();

        // A directory in the way makes the rename fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("inner"), b"x").unwrap();
        assert!(write_file(&blocked, b"new", 0o600).is_err());

        assert_eq!(read_file(&path).unwrap(), b"original");
        let temps = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TEMP_PREFIX)
            })
            .count();
        assert_eq!(temps, 0);
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found(), "expected NotFound, got: {err}");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        remove_file(&path).unwrap();

        write_file(&path, b"x", 0o600).unwrap();
        remove_file(&path).unwrap();
        remove_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rewrite_in_place_keeps_inode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        write_file(&path, b"127.0.0.1 localhost\n", 0o644).unwrap();
        let before = fs::metadata(&path).unwrap().ino();

        rewrite_in_place(&path, b"10.0.0.2 web\n", 0o644).unwrap();
        let after = fs::metadata(&path).unwrap().ino();

        assert_eq!(before, after);
        assert_eq!(read_file(&path).unwrap(), b"10.0.0.2 web\n");
    }

    #[test]
    fn atomic_write_replaces_inode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry");
        write_file(&path, b"a", 0o600).unwrap();
        let before = fs::metadata(&path).unwrap().ino();
        write_file(&path, b"b", 0o600).unwrap();
        assert_ne!(before, fs::metadata(&path).unwrap().ino());
    }

    #[test]
    fn concurrent_reader_never_sees_torn_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("entry"));
        let old = vec![b'A'; 256 * 1024];
        let new = vec![b'B'; 256 * 1024];
        write_file(&path, &old, 0o600).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let path = Arc::clone(&path);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0usize;
                loop {
                    let data = read_file(&path).unwrap();
                    assert_eq!(data.len(), 256 * 1024);
                    let first = data[0];
                    assert!(data.iter().all(|b| *b == first), "torn read");
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                }
            })
        };

        for i in 0..100 {
            let content = if i % 2 == 0 { &new } else { &old };
            write_file(&path, content, 0o600).unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    }
}
