//! Advisory exclusive locks on bucket directories.
//!
//! The lock is a `flock(2)` held on a descriptor of the bucket directory
//! itself, so there is no separate lock file to clean up. The kernel drops
//! the lock when the descriptor is closed, including when the holding
//! process is killed, so a crashed CLI invocation never leaves an orphaned
//! lock behind.
//!
//! `flock` locks belong to the open file description, not the process: two
//! descriptors opened independently conflict even inside one process. That
//! makes the lock usable between threads as well, although [`Bucket`]
//! additionally serializes threads with an ordinary mutex.
//!
//! Waiters are not queued in any guaranteed order.
//!
//! [`Bucket`]: crate::bucket::Bucket

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{StoreError, StoreResult};

/// Permission bits for directories created as lock targets.
const LOCK_DIR_MODE: u32 = 0o700;

/// First and longest sleep between polls in [`DirLock::acquire_timeout`].
const POLL_INITIAL: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

/// An exclusive advisory lock held on a directory.
///
/// Released by [`DirLock::release`] or on drop, whichever comes first.
#[derive(Debug)]
pub struct DirLock {
    dir: PathBuf,
    file: Option<File>,
}

impl DirLock {
    /// Block until the exclusive lock on `dir` is obtained.
    ///
    /// The directory is created if missing. There is no timeout; see
    /// [`DirLock::acquire_timeout`] for a bounded wait.
    pub fn acquire(dir: &Path) -> StoreResult<Self> {
        let started = Instant::now();
        loop {
            let Some(file) = open_lock_target(dir)? else {
                continue;
            };
            flock(&file, libc::LOCK_EX).map_err(|e| StoreError::io(dir, e))?;
            if is_current_target(dir, &file)? {
                debug!(dir = %dir.display(), waited = ?started.elapsed(), "lock acquired");
                return Ok(Self::held(dir, file));
            }
            trace!(dir = %dir.display(), "lock target replaced while waiting; retrying");
        }
    }

    /// Take the exclusive lock on `dir` if nobody else holds it.
    ///
    /// Returns `Ok(None)` immediately when the lock is held elsewhere.
    pub fn try_acquire(dir: &Path) -> StoreResult<Option<Self>> {
        loop {
            let Some(file) = open_lock_target(dir)? else {
                continue;
            };
            match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(dir = %dir.display(), "lock busy");
                    return Ok(None);
                }
                Err(e) => return Err(StoreError::io(dir, e)),
            }
            if is_current_target(dir, &file)? {
                debug!(dir = %dir.display(), "lock acquired (non-blocking)");
                return Ok(Some(Self::held(dir, file)));
            }
        }
    }

    /// Wait at most `timeout` for the lock, polling with capped backoff.
    ///
    /// Polling keeps the wait abandonable: no thread is left parked inside
    /// a blocking `flock` call after the deadline passes.
    pub fn acquire_timeout(dir: &Path, timeout: Duration) -> StoreResult<Self> {
        let started = Instant::now();
        let mut pause = POLL_INITIAL;
        loop {
            if let Some(lock) = Self::try_acquire(dir)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(StoreError::LockTimeout {
                    path: dir.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(pause.min(timeout - waited));
            pause = (pause * 2).min(POLL_MAX);
        }
    }

    fn held(dir: &Path, file: File) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file: Some(file),
        }
    }

    /// The locked directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Whether this handle still holds the lock.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Calling it again is a no-op.
    pub fn release(&mut self) -> StoreResult<()> {
        if let Some(file) = self.file.take() {
            // Closing the descriptor would release it too; unlock explicitly
            // so failures are reported.
            flock(&file, libc::LOCK_UN).map_err(|e| StoreError::io(&self.dir, e))?;
            debug!(dir = %self.dir.display(), "lock released");
        }
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(dir = %self.dir.display(), error = %e, "failed to release lock");
        }
    }
}

/// Report whether any process currently holds the exclusive lock on `dir`.
///
/// This checks presence only: it cannot tell whether the caller is the
/// holder. The probe takes a shared lock for an instant, so a concurrent
/// non-blocking acquire may spuriously report the lock as busy.
pub fn is_locked(dir: &Path) -> StoreResult<bool> {
    let file = match open_dir(dir) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    match flock(&file, libc::LOCK_SH | libc::LOCK_NB) {
        Ok(()) => {
            flock(&file, libc::LOCK_UN).map_err(|e| StoreError::io(dir, e))?;
            Ok(false)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

/// Create `dir` if needed and open it. `None` means it vanished in between.
fn open_lock_target(dir: &Path) -> StoreResult<Option<File>> {
    DirBuilder::new()
        .recursive(true)
        .mode(LOCK_DIR_MODE)
        .create(dir)
        .map_err(|e| StoreError::io(dir, e))?;
    match open_dir(dir) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn open_dir(dir: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(dir)
}

/// A bucket removed and recreated while we waited leaves us holding a lock
/// on the dead inode; the caller must retry on the live one.
fn is_current_target(dir: &Path, file: &File) -> StoreResult<bool> {
    let held = file.metadata().map_err(|e| StoreError::io(dir, e))?;
    match fs::metadata(dir) {
        Ok(live) => Ok(live.dev() == held.dev() && live.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the
        // duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
