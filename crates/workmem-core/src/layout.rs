//! Persisted state layout under `<project>/<state_dir>`.
//!
//! All coordination between concurrent hook processes happens through these
//! files; nothing is shared in memory.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const MEMORY_FILE: &str = "memory.md";
pub const PATTERNS_FILE: &str = "patterns.md";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const SNAPSHOT_SEEN_FILE: &str = "snapshot.seen";
pub const LOCK_FILE: &str = "merge.lock";
pub const STAGING_FILE: &str = "merge.pending.md";
pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const WORKER_LOG_FILE: &str = "worker.log";

/// Resolved paths for one project's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
}

impl StateLayout {
    #[must_use]
    pub fn new(project_root: &Path, state_dir_name: &str) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            state_dir: project_root.join(state_dir_name),
        }
    }

    /// Whether `workmem init` has been run for this project.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state_dir.is_dir()
    }

    /// Fail with [`Error::ConfigurationAbsent`] unless the state directory exists.
    pub fn require_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::ConfigurationAbsent(
                self.project_root.display().to_string(),
            ))
        }
    }

    /// Create the state directory (idempotent).
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        Ok(())
    }

    #[must_use]
    pub fn memory_path(&self) -> PathBuf {
        self.state_dir.join(MEMORY_FILE)
    }

    #[must_use]
    pub fn patterns_path(&self) -> PathBuf {
        self.state_dir.join(PATTERNS_FILE)
    }

    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        self.state_dir.join(STAGING_FILE)
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join(JOURNAL_FILE)
    }

    #[must_use]
    pub fn worker_log_path(&self) -> PathBuf {
        self.state_dir.join(WORKER_LOG_FILE)
    }
}
