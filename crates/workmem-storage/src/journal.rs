//! Append-only journal of background task outcomes (`journal.jsonl`).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, ensure_parent_dir, read_optional};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
    /// Killed by the supervisor after exceeding its deadline.
    Timeout,
    /// Did not run (lock timeout, nothing to merge).
    Skipped,
}

impl TaskOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub pid: u32,
}

impl JournalEntry {
    #[must_use]
    pub fn new(session_id: &str, outcome: TaskOutcome, duration_ms: u64) -> Self {
        Self {
            ts: Utc::now(),
            session_id: session_id.to_string(),
            outcome,
            duration_ms,
            detail: None,
            pid: std::process::id(),
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    ///
    /// Each entry is written with one `write` on an `O_APPEND` handle, so
    /// concurrent workers do not interleave within a line.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// The most recent `limit` entries, oldest first. Unparseable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let Some(raw) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let entries: Vec<JournalEntry> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}
