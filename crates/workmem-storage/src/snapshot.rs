//! Pre-compaction snapshot record.
//!
//! One current snapshot per project (`snapshot.json`). Each write supersedes
//! the previous record atomically; Init reads it without deleting it. The
//! sidecar `snapshot.seen` holds the timestamp of the last snapshot an Init
//! surfaced, so each snapshot is consumed once.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use workmem_core::VcsState;

use crate::{Result, atomic_write_bytes, freshness, read_optional};

/// A point-in-time capture taken immediately before a destructive event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Compaction trigger reported by the host (`manual` / `auto`).
    pub trigger: String,
    /// Document content at capture time; `None` if no document existed.
    pub document: Option<String>,
    pub vcs: Option<VcsState>,
}

impl Snapshot {
    #[must_use]
    pub fn capture(
        session_id: &str,
        trigger: &str,
        document: Option<String>,
        vcs: Option<VcsState>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            trigger: trigger.to_string(),
            document,
            vcs,
        }
    }

    /// Render as a context block for the next session start.
    #[must_use]
    pub fn recovery_note(&self) -> String {
        let mut out = format!(
            "## Recovered Snapshot\n\nCaptured {} before a {} compaction (session {}).\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.trigger,
            self.session_id,
        );
        if let Some(vcs) = &self.vcs {
            let _ = write!(out, "\n{}\n", vcs.render());
        }
        match self.document.as_deref().map(str::trim) {
            Some(doc) if !doc.is_empty() => {
                let _ = write!(out, "\nWorking memory at capture time:\n\n{doc}\n");
            }
            _ => out.push_str("\nNo working memory existed at capture time.\n"),
        }
        out
    }
}

/// Whether a snapshot taken at `snapshot_ts` should be surfaced alongside a
/// document last modified at `document_mtime`.
///
/// Strictly newer only; an absent document counts as older than any snapshot.
#[must_use]
pub fn needs_recovery(snapshot_ts: DateTime<Utc>, document_mtime: Option<DateTime<Utc>>) -> bool {
    document_mtime.is_none_or(|doc| snapshot_ts > doc)
}

/// Reads and writes `snapshot.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn seen_path(&self) -> PathBuf {
        self.path.with_extension("seen")
    }

    /// Replace the current snapshot.
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        atomic_write_bytes(&self.path, &json)?;
        tracing::debug!(
            "wrote snapshot {} (trigger={})",
            self.path.display(),
            snapshot.trigger
        );
        Ok(())
    }

    /// Load the current snapshot. A corrupt record is logged and ignored.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let Some(raw) = read_optional(&self.path)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!("ignoring unreadable snapshot {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    /// The current snapshot, if it is strictly newer than the document at
    /// `document_path`.
    pub fn newer_than_document(&self, document_path: &Path) -> Result<Option<Snapshot>> {
        let Some(snapshot) = self.load()? else {
            return Ok(None);
        };
        let doc_mtime = freshness::modified_at(document_path)?;
        Ok(needs_recovery(snapshot.timestamp, doc_mtime).then_some(snapshot))
    }

    /// Whether an Init has already surfaced `snapshot`.
    pub fn is_consumed(&self, snapshot: &Snapshot) -> Result<bool> {
        let Some(raw) = read_optional(&self.seen_path())? else {
            return Ok(false);
        };
        Ok(DateTime::parse_from_rfc3339(raw.trim())
            .is_ok_and(|seen| seen.with_timezone(&Utc) == snapshot.timestamp))
    }

    /// Record `snapshot` as surfaced. Later snapshots are unaffected.
    pub fn mark_consumed(&self, snapshot: &Snapshot) -> Result<()> {
        let stamp = snapshot
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        atomic_write_bytes(&self.seen_path(), stamp.as_bytes())
    }

    /// The snapshot an Init should surface: newer than the document and not
    /// yet consumed.
    pub fn pending_recovery(&self, document_path: &Path) -> Result<Option<Snapshot>> {
        let Some(snapshot) = self.newer_than_document(document_path)? else {
            return Ok(None);
        };
        if self.is_consumed(&snapshot)? {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}
