//! Cross-process merge lock.
//!
//! - Lock file at `<state_dir>/merge.lock`, held with an exclusive `flock`
//!   for the whole critical section (the OS drops it if the holder dies)
//! - Owner metadata `{pid, created_ts, token}` written *into* the lock file,
//!   so owner and age are always read from the same inode in one operation
//! - Stale detection: age from metadata or, failing that, the file mtime.
//!   A marker nobody holds is stale once older than `stale_timeout`. A lock a
//!   live process still holds is only stale once older than `max_hold` (the
//!   holder's own deadline plus slack); a held lock whose recorded owner is
//!   dead is stale immediately
//! - Removal (stale break and normal release) runs under a short-lived guard
//!   lock on `merge.lock.break` and re-verifies the inode before unlinking,
//!   so two acquirers can never both break the same lock and then each
//!   remove the other's replacement
//! - Fixed-interval retry until the acquisition timeout elapses

use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError, ensure_parent_dir};

/// Owner metadata stored inside the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwnerMeta {
    pub pid: u32,
    pub created_ts: f64,
    #[serde(default)]
    pub token: String,
}

impl LockOwnerMeta {
    fn current() -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let pid = std::process::id();
        Self {
            pid,
            created_ts: now.as_secs_f64(),
            token: format!(
                "{pid}-{}-{}",
                now.as_nanos(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }
}

struct HeldLock {
    // Keeps the flock alive; released when dropped.
    file: File,
    meta: LockOwnerMeta,
}

/// Advisory merge lock with stale detection.
pub struct FileLock {
    path: PathBuf,
    guard_path: PathBuf,
    timeout: Duration,
    retry_interval: Duration,
    stale_timeout: Duration,
    max_hold: Option<Duration>,
    held: Option<HeldLock>,
    stale_broken: usize,
}

impl FileLock {
    /// Create a new advisory file lock.
    ///
    /// Defaults: timeout=90s, retry interval=1s, stale_timeout=300s.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let guard_path = {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            path.with_file_name(format!("{name}.break"))
        };
        Self {
            path,
            guard_path,
            timeout: Duration::from_secs(90),
            retry_interval: Duration::from_secs(1),
            stale_timeout: Duration::from_secs(300),
            max_hold: None,
            held: None,
            stale_broken: 0,
        }
    }

    /// Configure timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configure the fixed retry interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Configure stale timeout. Zero disables stale breaking.
    #[must_use]
    pub const fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    /// Longest a live holder may keep the lock before it is presumed hung.
    /// Never shorter than the stale timeout.
    #[must_use]
    pub const fn with_max_hold(mut self, max_hold: Duration) -> Self {
        self.max_hold = Some(max_hold);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Metadata this process wrote when it acquired the lock.
    #[must_use]
    pub fn owner(&self) -> Option<&LockOwnerMeta> {
        self.held.as_ref().map(|h| &h.meta)
    }

    /// Number of stale locks this instance has removed.
    #[must_use]
    pub const fn stale_broken(&self) -> usize {
        self.stale_broken
    }

    /// Acquire the lock with fixed-interval retry and stale detection.
    ///
    /// A stale lock is removed before the first attempt, and re-checked
    /// before each retry.
    pub fn acquire(&mut self) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }
        ensure_parent_dir(&self.path)?;
        let start = Instant::now();

        self.break_if_stale()?;
        loop {
            if let Some(held) = self.try_acquire_once()? {
                tracing::debug!(
                    "acquired {} after {:.2}s",
                    self.path.display(),
                    start.elapsed().as_secs_f64()
                );
                self.held = Some(held);
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                break;
            }
            if self.break_if_stale()? {
                continue;
            }
            std::thread::sleep(self.retry_interval.min(self.timeout - elapsed));
        }

        let waited = start.elapsed();
        Err(StorageError::LockTimeout {
            path: self.path.clone(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Release the lock. Idempotent.
    ///
    /// The lock file is only unlinked if the path still names the inode this
    /// process locked; a lock that was broken as stale and re-acquired by
    /// someone else is left alone.
    pub fn release(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        let _guard = self.break_guard()?;
        if same_file(&held.file, &self.path) {
            crate::remove_if_exists(&self.path)?;
        } else {
            tracing::warn!(
                "merge lock {} was broken while held by pid {}; not removing",
                self.path.display(),
                held.meta.pid
            );
        }
        drop(held);
        Ok(())
    }

    fn try_acquire_once(&self) -> Result<Option<HeldLock>> {
        // The path can be swapped out between open and flock by a stale
        // break; a couple of immediate re-opens settle that.
        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&self.path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }

            if !same_file(&file, &self.path) {
                continue;
            }

            let meta = LockOwnerMeta::current();
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(serde_json::to_string(&meta)?.as_bytes())?;
            file.sync_data()?;
            return Ok(Some(HeldLock { file, meta }));
        }
        Ok(None)
    }

    /// Remove the lock if it is older than the stale threshold.
    ///
    /// Returns `true` if a stale lock was removed.
    fn break_if_stale(&mut self) -> Result<bool> {
        if self.stale_timeout.is_zero() || !self.path.exists() {
            return Ok(false);
        }
        let _guard = self.break_guard()?;

        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !same_file(&file, &self.path) {
            return Ok(false);
        }

        let held_by_other = match file.try_lock_exclusive() {
            Ok(()) => false,
            Err(e) if is_contended(&e) => true,
            Err(e) => return Err(e.into()),
        };

        let (owner, age) = read_owner_and_age(&file);
        let info = LockInfo {
            owner_alive: owner.as_ref().map(|o| pid_alive(o.pid)),
            owner,
            age,
            held: held_by_other,
        };
        if !info.is_breakable(self.stale_timeout, self.max_hold) {
            return Ok(false);
        }

        crate::remove_if_exists(&self.path)?;
        self.stale_broken += 1;
        tracing::info!(
            "removed stale merge lock {} (age={:.1}s, owner pid={}, held={}, owner alive={:?})",
            self.path.display(),
            info.age.unwrap_or_default().as_secs_f64(),
            info.owner
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |o| o.pid.to_string()),
            info.held,
            info.owner_alive,
        );
        Ok(true)
    }

    fn break_guard(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.guard_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("failed to release {}: {e}", self.path.display());
        }
    }
}

/// Execute a closure while holding the lock, releasing it afterwards.
pub fn with_lock<F, T>(mut lock: FileLock, f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    lock.acquire()?;
    let result = f();
    lock.release()?;
    Ok(result)
}

/// Point-in-time view of a lock file, for `workmem status` / `unlock`.
#[derive(Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub owner: Option<LockOwnerMeta>,
    pub age: Option<Duration>,
    /// Whether some process currently holds the flock.
    pub held: bool,
    pub owner_alive: Option<bool>,
}

impl LockInfo {
    /// Whether someone other than the holder may remove this lock.
    ///
    /// A zero `stale_timeout` disables breaking entirely.
    #[must_use]
    pub fn is_breakable(&self, stale_timeout: Duration, max_hold: Option<Duration>) -> bool {
        if stale_timeout.is_zero() {
            return false;
        }
        let older_than = |limit: Duration| self.age.is_some_and(|age| age > limit);
        if !self.held {
            return older_than(stale_timeout);
        }
        if self.owner_alive == Some(false) {
            return true;
        }
        older_than(max_hold.map_or(stale_timeout, |hold| hold.max(stale_timeout)))
    }
}

/// Inspect the lock at `path` without taking it. `None` if no lock file exists.
pub fn inspect_lock(path: &Path) -> Result<Option<LockInfo>> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let held = match file.try_lock_exclusive() {
        Ok(()) => false,
        Err(e) if is_contended(&e) => true,
        Err(e) => return Err(e.into()),
    };
    let (owner, age) = read_owner_and_age(&file);
    let owner_alive = owner.as_ref().map(|o| pid_alive(o.pid));
    Ok(Some(LockInfo {
        owner,
        age,
        held,
        owner_alive,
    }))
}

/// Unconditionally remove the lock at `path` (operator override).
pub fn force_remove(path: &Path) -> Result<bool> {
    let guard = FileLock::new(path.to_path_buf()).break_guard()?;
    let removed = crate::remove_if_exists(path)?;
    drop(guard);
    Ok(removed)
}

fn read_owner_and_age(file: &File) -> (Option<LockOwnerMeta>, Option<Duration>) {
    let mut content = String::new();
    let mut reader = file;
    let owner = reader
        .seek(SeekFrom::Start(0))
        .and_then(|_| reader.read_to_string(&mut content))
        .ok()
        .and_then(|_| serde_json::from_str::<LockOwnerMeta>(content.trim()).ok());

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let age = owner
        .as_ref()
        .and_then(|m| Duration::try_from_secs_f64((now - m.created_ts).max(0.0)).ok())
        .or_else(|| {
            file.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| SystemTime::now().duration_since(t).unwrap_or_default())
        });
    (owner, age)
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists but is not ours.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(_pid: u32) -> bool {
    // Conservatively assume alive
    true
}
