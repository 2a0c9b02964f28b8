#![forbid(unsafe_code)]
//! Filesystem coordination layer for workmem.
//!
//! Provides, per project state directory:
//! - Advisory merge lock (`merge.lock`) with owner metadata and stale recovery
//! - Freshness checks on the working-memory document
//! - The pre-compaction snapshot record
//! - The append-only background-task outcome journal
//! - Atomic (write-temp-then-rename) document replacement

pub mod freshness;
pub mod journal;
pub mod lock;
pub mod snapshot;

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub use freshness::{file_age, is_older_than, is_throttled, modified_at};
pub use journal::{Journal, JournalEntry, TaskOutcome};
pub use lock::{FileLock, LockInfo, LockOwnerMeta, inspect_lock};
pub use snapshot::{Snapshot, SnapshotStore, needs_recovery};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock acquisition timed out after {waited_ms}ms: {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for workmem_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => Self::Io(e),
            StorageError::Json(e) => Self::Serialization(e),
            StorageError::LockTimeout { path, waited_ms } => Self::LockTimeout {
                path: path.display().to_string(),
                waited_ms,
            },
            StorageError::InvalidPath(p) => Self::Internal(format!("invalid path: {p}")),
        }
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent)?;
    Ok(())
}

/// Read a file to a string, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write bytes to a file atomically via a temp file + rename.
///
/// The temp file is created in the same directory as the target so that
/// `fs::rename` is atomic (same filesystem). Readers observe either the old
/// content or the new content, never a prefix.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    // pid + counter keeps concurrent writers in one directory apart.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        ".tmp-{}-{seq}-{}",
        std::process::id(),
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    let tmp_path = parent.join(&tmp_name);
    let mut f = fs::File::create(&tmp_path)?;
    f.write_all(data)?;
    f.sync_data()?;
    drop(f);
    fs::rename(&tmp_path, path).map_err(|e| {
        // Best-effort cleanup of the temp file on rename failure
        let _ = fs::remove_file(&tmp_path);
        e.into()
    })
}

/// Atomically move a fully written staging file over `target`.
pub fn install_staged(staging: &Path, target: &Path) -> Result<()> {
    ensure_parent_dir(target)?;
    fs::rename(staging, target)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
