//! Per-session mutual exclusion across independent invocations.
//!
//! A lock is a file `<locks_dir>/<session key>.lock` created with
//! `O_CREAT|O_EXCL` that records the owning PID and a random token.
//! Holders that died without releasing are detected through PID liveness
//! and reclaimed. Reclaiming and releasing both happen under an advisory
//! `flock` on a sibling `.guard` file so that two reclaimers cannot both
//! delete and recreate the same lock. The guard file is unlinked again when
//! the lock is released.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use dbox_common::config::DboxConfig;
use dbox_common::error::{DboxError, Result};
use dbox_common::types::SessionKey;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base delay between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum jitter added to each poll (milliseconds).
const POLL_JITTER_MS: u64 = 25;

/// How long an unreadable lock record is presumed to be mid-write.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// PID of the holding process.
    pub pid: u32,
    /// Random token identifying this particular acquisition.
    pub token: Uuid,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

/// Hands out session locks.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    poll_interval: Duration,
    unreadable_grace: Duration,
}

impl LockManager {
    /// Creates a manager storing lock files in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: POLL_INTERVAL,
            unreadable_grace: UNREADABLE_GRACE,
        }
    }

    /// Creates the manager configured for this host.
    #[must_use]
    pub fn from_config(config: &DboxConfig) -> Self {
        Self::new(config.locks_dir())
    }

    /// Overrides the grace period for lock files whose record cannot be parsed.
    #[must_use]
    pub const fn with_unreadable_grace(mut self, grace: Duration) -> Self {
        self.unreadable_grace = grace;
        self
    }

    /// Path of the lock file for `workdir`.
    #[must_use]
    pub fn lock_path(&self, workdir: &Path) -> PathBuf {
        self.dir
            .join(format!("{}.lock", SessionKey::for_workdir(workdir)))
    }

    /// Reads the current owner of the lock for `workdir`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file exists but cannot be read.
    pub fn owner(&self, workdir: &Path) -> Result<Option<LockOwner>> {
        let path = self.lock_path(workdir);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DboxError::io(path, e)),
        }
    }

    /// Attempts to take the lock once, reclaiming it if its holder is dead.
    ///
    /// Returns `Ok(None)` if a live holder owns it.
    ///
    /// # Errors
    ///
    /// Returns an error on unexpected filesystem failures.
    pub fn try_acquire(&self, workdir: &Path) -> Result<Option<LockHandle>> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DboxError::io(&self.dir, e))?;
        let path = self.lock_path(workdir);

        // One retry after a successful reclaim; a second loss means a peer
        // recreated the lock in between.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return self.initialize(file, &path, workdir).map(Some),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !self.reclaim_if_stale(&path)? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(DboxError::io(path, e)),
            }
        }
        Ok(None)
    }

    /// Takes the lock, polling with jitter until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::LockTimeout` if the lock stays held by a live
    /// process for the whole timeout.
    pub fn acquire(&self, workdir: &Path, timeout: Duration) -> Result<LockHandle> {
        self.acquire_unless(workdir, timeout, || false)
    }

    /// Like [`acquire`](Self::acquire), but gives up as soon as `cancelled`
    /// returns `true`. It is checked before every attempt.
    ///
    /// # Errors
    ///
    /// Returns `DboxError::Cancelled` if `cancelled` fires while waiting, or
    /// `DboxError::LockTimeout` if the lock stays held for the whole timeout.
    pub fn acquire_unless(
        &self,
        workdir: &Path,
        timeout: Duration,
        cancelled: impl Fn() -> bool,
    ) -> Result<LockHandle> {
        let start = Instant::now();
        let mut logged = false;
        loop {
            if cancelled() {
                tracing::debug!(workdir = %workdir.display(), "lock wait interrupted");
                return Err(DboxError::Cancelled);
            }
            if let Some(handle) = self.try_acquire(workdir)? {
                tracing::debug!(
                    workdir = %workdir.display(),
                    waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "session lock acquired"
                );
                return Ok(handle);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(DboxError::LockTimeout {
                    workdir: workdir.to_path_buf(),
                    waited,
                });
            }
            if !logged {
                tracing::info!(workdir = %workdir.display(), "waiting for session lock");
                logged = true;
            }
            std::thread::sleep((self.poll_interval + jitter()).min(timeout - waited));
        }
    }

    fn initialize(&self, mut file: File, path: &Path, workdir: &Path) -> Result<LockHandle> {
        let owner = LockOwner {
            pid: std::process::id(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        let written = serde_json::to_vec(&owner)
            .map_err(DboxError::from)
            .and_then(|bytes| {
                file.write_all(&bytes)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| DboxError::io(path, e))
            });
        if let Err(e) = written {
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
        Ok(LockHandle {
            path: path.to_path_buf(),
            workdir: workdir.to_path_buf(),
            token: owner.token,
            released: false,
        })
    }

    /// Removes the lock file if its holder is gone. Returns whether the
    /// lock file no longer exists.
    fn reclaim_if_stale(&self, path: &Path) -> Result<bool> {
        let _guard = lock_guard(path)?;

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                remove_guard(path);
                return Ok(true);
            }
            Err(e) => return Err(DboxError::io(path, e)),
        };
        match serde_json::from_str::<LockOwner>(&content) {
            Ok(owner) if is_pid_alive(owner.pid) => Ok(false),
            Ok(owner) => {
                tracing::warn!(
                    path = %path.display(),
                    pid = owner.pid,
                    acquired_at = %owner.acquired_at,
                    "reclaiming lock held by a dead process"
                );
                remove_lock_file(path)?;
                Ok(true)
            }
            Err(_) => {
                let age = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or_default();
                if age < self.unreadable_grace {
                    return Ok(false);
                }
                tracing::warn!(
                    path = %path.display(),
                    age_secs = age.as_secs(),
                    "reclaiming unreadable lock"
                );
                remove_lock_file(path)?;
                Ok(true)
            }
        }
    }
}

/// An acquired session lock. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    workdir: PathBuf,
    token: Uuid,
    released: bool,
}

impl LockHandle {
    /// Working directory the lock protects.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Token written into the lock file by this acquisition.
    #[must_use]
    pub const fn token(&self) -> Uuid {
        self.token
    }

    /// Releases the lock.
    ///
    /// The lock file is only removed while it still carries this handle's
    /// token; a lock reclaimed by someone else is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be inspected or removed.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let _guard = lock_guard(&self.path)?;
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "session lock disappeared while held"
                );
                remove_guard(&self.path);
                return Ok(());
            }
            Err(e) => return Err(DboxError::io(&self.path, e)),
        };
        match serde_json::from_str::<LockOwner>(&content) {
            Ok(owner) if owner.token == self.token => {
                remove_lock_file(&self.path)?;
                remove_guard(&self.path);
                tracing::debug!(workdir = %self.workdir.display(), "session lock released");
            }
            _ => {
                tracing::warn!(
                    path = %self.path.display(),
                    "session lock was taken over, not removing it"
                );
            }
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to release session lock"
            );
        }
    }
}

/// Takes the `flock` on the guard file of `lock_path`.
///
/// The guard file may be unlinked by a releaser while we wait on it, in
/// which case the lock we got is on a dead inode and we start over.
fn lock_guard(lock_path: &Path) -> Result<Flock<File>> {
    let guard_path = lock_path.with_extension("guard");
    loop {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| DboxError::io(&guard_path, e))?;
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| DboxError::io(&guard_path, std::io::Error::from(errno)))?;
        let held = guard.metadata().map_err(|e| DboxError::io(&guard_path, e))?;
        match std::fs::metadata(&guard_path) {
            Ok(current) if current.dev() == held.dev() && current.ino() == held.ino() => {
                return Ok(guard);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DboxError::io(guard_path, e)),
        }
        tracing::trace!(path = %guard_path.display(), "guard file replaced while waiting");
    }
}

/// Unlinks the guard file of `lock_path`. Must be called with the guard held.
fn remove_guard(lock_path: &Path) {
    let guard_path = lock_path.with_extension("guard");
    match std::fs::remove_file(&guard_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(
                path = %guard_path.display(),
                error = %e,
                "failed to remove guard file"
            );
        }
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DboxError::io(path, e)),
    }
}

/// Checks whether a process exists with `kill(pid, 0)`.
///
/// `EPERM` means it exists under another user and counts as alive.
fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % (POLL_JITTER_MS + 1))
}
