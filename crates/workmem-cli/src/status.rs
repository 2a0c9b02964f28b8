//! `workmem status`: a read-only view of one project's persisted state.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use workmem_core::{Config, MemoryDocument, Section};
use workmem_storage::{
    Journal, JournalEntry, SnapshotStore, file_age, inspect_lock, is_older_than, is_throttled,
    modified_at, needs_recovery, read_optional,
};

use crate::CliResult;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    pub path: PathBuf,
    pub modified_at: Option<DateTime<Utc>>,
    pub age_secs: u64,
    /// Older than the staleness warning threshold.
    pub stale: bool,
    /// Recent enough that Idle would skip the merge.
    pub throttled: bool,
    /// Headings of the sections that carry content.
    pub sections: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub pid: Option<u32>,
    pub age_secs: Option<u64>,
    pub held: bool,
    pub owner_alive: Option<bool>,
    /// A waiting merge would break this lock.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStatus {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub trigger: String,
    pub newer_than_document: bool,
    /// Already surfaced by a session start.
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project: PathBuf,
    pub initialized: bool,
    pub sync_mode: String,
    pub merge_tool: Option<PathBuf>,
    pub document: Option<DocumentStatus>,
    pub lock: Option<LockStatus>,
    pub snapshot: Option<SnapshotStatus>,
    pub recent_outcomes: Vec<JournalEntry>,
}

pub fn collect_status(config: &Config, project_root: &Path) -> CliResult<StatusReport> {
    let layout = config.layout(project_root);
    let mut report = StatusReport {
        project: project_root.to_path_buf(),
        initialized: layout.is_initialized(),
        sync_mode: config.sync_mode.to_string(),
        merge_tool: config.resolve_merge_program(),
        document: None,
        lock: None,
        snapshot: None,
        recent_outcomes: Vec::new(),
    };
    if !report.initialized {
        return Ok(report);
    }

    let memory_path = layout.memory_path();
    let doc_mtime = modified_at(&memory_path)?;
    if let Some(age) = file_age(&memory_path)? {
        let parsed = MemoryDocument::parse(&read_optional(&memory_path)?.unwrap_or_default());
        let sections = if parsed.is_empty() {
            Vec::new()
        } else {
            Section::ALL
                .iter()
                .filter(|s| !parsed.section(**s).is_empty())
                .map(|s| s.heading())
                .collect()
        };
        report.document = Some(DocumentStatus {
            path: memory_path.clone(),
            modified_at: doc_mtime,
            age_secs: age.as_secs(),
            stale: is_older_than(&memory_path, config.stale_warning())?,
            throttled: is_throttled(&memory_path, config.idle_throttle())?,
            sections,
        });
    }

    report.lock = inspect_lock(&layout.lock_path())?.map(|info| LockStatus {
        pid: info.owner.as_ref().map(|o| o.pid),
        age_secs: info.age.map(|a| a.as_secs()),
        held: info.held,
        owner_alive: info.owner_alive,
        stale: info.is_breakable(config.stale_lock_threshold(), Some(config.max_lock_hold())),
    });

    let snapshots = SnapshotStore::new(layout.snapshot_path());
    if let Some(snap) = snapshots.load()? {
        report.snapshot = Some(SnapshotStatus {
            newer_than_document: needs_recovery(snap.timestamp, doc_mtime),
            consumed: snapshots.is_consumed(&snap)?,
            timestamp: snap.timestamp,
            session_id: snap.session_id,
            trigger: snap.trigger,
        });
    }

    report.recent_outcomes =
        Journal::new(layout.journal_path()).read_recent(config.status_max_entries)?;
    Ok(report)
}

impl StatusReport {
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "project: {}", self.project.display());
        if !self.initialized {
            out.push_str("not initialized (run `workmem init`)\n");
            return out;
        }
        let _ = writeln!(
            out,
            "sync mode: {} (merge tool: {})",
            self.sync_mode,
            self.merge_tool
                .as_ref()
                .map_or_else(|| "not found".to_string(), |p| p.display().to_string())
        );

        match &self.document {
            Some(doc) => {
                let _ = writeln!(
                    out,
                    "document: {} ({}){}",
                    format_age(doc.age_secs),
                    doc.path.display(),
                    if doc.stale { " [stale]" } else { "" }
                );
                if doc.sections.is_empty() {
                    out.push_str("  sections: none with content\n");
                } else {
                    let _ = writeln!(out, "  sections: {}", doc.sections.join(", "));
                }
            }
            None => out.push_str("document: none\n"),
        }

        match &self.lock {
            Some(lock) => {
                let _ = writeln!(
                    out,
                    "lock: {} by pid {}, age {}{}",
                    if lock.held { "held" } else { "orphaned" },
                    lock.pid
                        .map_or_else(|| "unknown".to_string(), |p| p.to_string()),
                    lock.age_secs.map_or_else(|| "unknown".to_string(), format_age),
                    if lock.stale { " [stale]" } else { "" }
                );
            }
            None => out.push_str("lock: free\n"),
        }

        if let Some(snap) = &self.snapshot {
            let _ = writeln!(
                out,
                "snapshot: {} ({}, session {}){}",
                snap.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                snap.trigger,
                snap.session_id,
                match (snap.newer_than_document, snap.consumed) {
                    (true, false) => " [pending recovery]",
                    (true, true) => " [already surfaced]",
                    (false, _) => "",
                }
            );
        }

        if self.recent_outcomes.is_empty() {
            out.push_str("recent merges: none\n");
        } else {
            out.push_str("recent merges:\n");
            for entry in self.recent_outcomes.iter().rev() {
                let _ = writeln!(
                    out,
                    "  {} {:<8} {:>7}ms  {}{}",
                    entry.ts.format("%Y-%m-%d %H:%M:%S"),
                    entry.outcome.as_str(),
                    entry.duration_ms,
                    entry.session_id,
                    entry
                        .detail
                        .as_deref()
                        .map(|d| format!("  ({d})"))
                        .unwrap_or_default()
                );
            }
        }
        out
    }
}

fn format_age(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86_400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
