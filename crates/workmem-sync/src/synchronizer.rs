//! The four host trigger points.
//!
//! Each trigger is a cold start: read configuration and on-disk state, do one
//! thing, reply. Errors never reach the host; [`MemorySynchronizer::handle`]
//! turns every failure into a logged no-op.

use std::fmt::Write as _;
use std::time::Duration;

use workmem_core::{Config, MemoryDocument, Result, StateLayout, VcsState};
use workmem_storage::{
    FileLock, Snapshot, SnapshotStore, StorageError, atomic_write_bytes, file_age, is_older_than,
    is_throttled, read_optional,
};

use crate::hook::{HookPayload, HookResponse, Trigger};
use crate::invocation::InvocationSource;
use crate::prompt::classify_prompt;
use crate::runner::{MergeRequest, TaskLauncher, compose_merge_instruction};

/// Why Idle did (or did not) schedule a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleOutcome {
    NotConfigured,
    /// Invoked from one of our own merge processes.
    BackgroundInvocation,
    /// The host is already continuing the session because of a Stop hook.
    StopHookActive,
    /// The document was updated within the idle threshold.
    Throttled,
    /// The merge collaborator is not installed.
    MissingTooling,
    Launched,
    /// Blocking mode: the host must perform the merge itself.
    Blocking { instruction: String },
}

/// What PreCompact wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreCompactReport {
    pub snapshot_written: bool,
    pub document_synthesized: bool,
}

pub struct MemorySynchronizer<L> {
    config: Config,
    launcher: L,
}

impl<L: TaskLauncher> MemorySynchronizer<L> {
    pub const fn new(config: Config, launcher: L) -> Self {
        Self { config, launcher }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Dispatch a trigger and reduce any failure to "nothing to add".
    pub fn handle(
        &self,
        trigger: Trigger,
        payload: &HookPayload,
        source: InvocationSource,
    ) -> HookResponse {
        // Our own merge processes run a full host session; none of its
        // triggers may touch memory state.
        if source.is_background() {
            tracing::debug!("{trigger}: background invocation, skipping");
            return HookResponse::Nothing;
        }
        if !self.config.enabled {
            tracing::debug!("{trigger}: disabled via WORKMEM_ENABLED");
            return HookResponse::Nothing;
        }

        let result = match trigger {
            Trigger::Init => self.init(payload),
            Trigger::PromptObserved => self.prompt_observed(payload),
            Trigger::Idle => self.idle(payload, source).map(|outcome| match outcome {
                IdleOutcome::Blocking { instruction } => HookResponse::Block {
                    reason: instruction,
                },
                _ => HookResponse::Nothing,
            }),
            Trigger::PreCompact => self.pre_compact(payload).map(|_| HookResponse::Nothing),
        };

        match result {
            Ok(response) => response,
            Err(e) if e.is_silent_noop() => {
                tracing::debug!("{trigger}: {e}");
                HookResponse::Nothing
            }
            Err(e) if e.is_recoverable() => {
                tracing::info!("{trigger} skipped, next trigger retries ({}): {e}", e.error_type());
                HookResponse::Nothing
            }
            Err(e) => {
                tracing::warn!("{trigger} failed ({}): {e}", e.error_type());
                HookResponse::Nothing
            }
        }
    }

    fn layout(&self, payload: &HookPayload) -> StateLayout {
        self.config.layout(&payload.cwd)
    }

    /// Compose session-start context.
    ///
    /// Never touches the document or the snapshot; the only write is the
    /// marker recording that a recovered snapshot has been surfaced.
    pub fn init(&self, payload: &HookPayload) -> Result<HookResponse> {
        let layout = self.layout(payload);
        layout.require_initialized()?;
        let memory_path = layout.memory_path();

        let document = read_optional(&memory_path)?.filter(|d| !d.trim().is_empty());
        let patterns = read_optional(&layout.patterns_path())?.filter(|p| !p.trim().is_empty());
        let vcs = VcsState::capture_best_effort(
            &layout.project_root,
            self.config.recent_commits,
            self.config.status_max_entries,
        );
        let snapshots = SnapshotStore::new(layout.snapshot_path());
        let recovered = snapshots.pending_recovery(&memory_path)?;

        let mut out = String::new();
        if is_older_than(&memory_path, self.config.stale_warning())? {
            let hours = file_age(&memory_path)?.unwrap_or_default().as_secs() / 3600;
            let _ = writeln!(
                out,
                "> workmem: working memory was last updated {hours}h ago; verify it before relying on it.\n"
            );
        }
        match (&document, &vcs) {
            (Some(doc), _) => push_block(&mut out, doc),
            (None, Some(vcs)) => push_block(
                &mut out,
                &MemoryDocument::synthesize_from_vcs(vcs, self.config.recent_commits).render(),
            ),
            (None, None) => {}
        }
        if let Some(patterns) = &patterns {
            push_block(&mut out, &format!("# Patterns\n\n{}", patterns.trim()));
        }
        if let Some(vcs) = &vcs {
            push_block(&mut out, &format!("# Repository State\n\n{}", vcs.render()));
        }
        if let Some(snapshot) = &recovered {
            tracing::info!(
                "surfacing snapshot from {} (newer than document)",
                snapshot.timestamp
            );
            push_block(&mut out, &snapshot.recovery_note());
            if let Err(e) = snapshots.mark_consumed(snapshot) {
                tracing::warn!("could not record snapshot as surfaced: {e}");
            }
        }

        Ok(HookResponse::context(Trigger::Init, out.trim_end()))
    }

    /// Inject a one-line reminder for recognised prompts. Persists nothing.
    pub fn prompt_observed(&self, payload: &HookPayload) -> Result<HookResponse> {
        self.layout(payload).require_initialized()?;
        let Some(prompt) = payload.prompt.as_deref() else {
            return Ok(HookResponse::Nothing);
        };
        Ok(classify_prompt(prompt).map_or(HookResponse::Nothing, |kind| {
            HookResponse::context(Trigger::PromptObserved, kind.reminder())
        }))
    }

    /// Decide whether to merge, and start it if so.
    pub fn idle(&self, payload: &HookPayload, source: InvocationSource) -> Result<IdleOutcome> {
        let layout = self.layout(payload);
        if !layout.is_initialized() {
            return Ok(IdleOutcome::NotConfigured);
        }
        if source.is_background() {
            return Ok(IdleOutcome::BackgroundInvocation);
        }
        if payload.stop_hook_active {
            return Ok(IdleOutcome::StopHookActive);
        }
        let memory_path = layout.memory_path();
        if is_throttled(&memory_path, self.config.idle_throttle())? {
            tracing::debug!("idle: {} is fresh, skipping merge", memory_path.display());
            return Ok(IdleOutcome::Throttled);
        }

        let request = MergeRequest {
            project_root: layout.project_root.clone(),
            session_id: payload.session_id().to_string(),
            transcript_path: payload.transcript_path.clone(),
        };

        match self.config.sync_mode {
            workmem_core::SyncMode::Blocking => {
                let existing = read_optional(&memory_path)?;
                Ok(IdleOutcome::Blocking {
                    instruction: compose_merge_instruction(
                        existing.as_deref(),
                        &request,
                        &memory_path,
                    ),
                })
            }
            workmem_core::SyncMode::Background => {
                if self.config.resolve_merge_program().is_none() {
                    tracing::debug!(
                        "idle: merge command {:?} not found on PATH",
                        self.config.merge_command.first()
                    );
                    return Ok(IdleOutcome::MissingTooling);
                }
                self.launcher.launch(&request)?;
                Ok(IdleOutcome::Launched)
            }
        }
    }

    /// Snapshot before compaction, and seed a document if none exists.
    pub fn pre_compact(&self, payload: &HookPayload) -> Result<PreCompactReport> {
        let layout = self.layout(payload);
        layout.require_initialized()?;
        let memory_path = layout.memory_path();

        let document = read_optional(&memory_path)?;
        let vcs = VcsState::capture_best_effort(
            &layout.project_root,
            self.config.recent_commits,
            self.config.status_max_entries,
        );
        let snapshot = Snapshot::capture(
            payload.session_id(),
            payload.compact_trigger(),
            document.clone(),
            vcs.clone(),
        );
        SnapshotStore::new(layout.snapshot_path()).write(&snapshot)?;
        let mut report = PreCompactReport {
            snapshot_written: true,
            ..PreCompactReport::default()
        };

        let Some(vcs) = vcs.filter(|_| document.as_deref().is_none_or(|d| d.trim().is_empty()))
        else {
            return Ok(report);
        };

        // A running merge will produce the document; don't wait for it.
        let mut lock = FileLock::new(layout.lock_path())
            .with_timeout(Duration::ZERO)
            .with_stale_timeout(self.config.stale_lock_threshold())
            .with_max_hold(self.config.max_lock_hold());
        match lock.acquire() {
            Ok(()) => {}
            Err(StorageError::LockTimeout { .. }) => {
                tracing::info!("pre-compact: merge in progress, not synthesizing a document");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        }
        if read_optional(&memory_path)?.is_none_or(|d| d.trim().is_empty()) {
            let doc = MemoryDocument::synthesize_from_vcs(&vcs, self.config.recent_commits);
            atomic_write_bytes(&memory_path, doc.render().as_bytes())?;
            report.document_synthesized = true;
        }
        lock.release()?;
        Ok(report)
    }
}

fn push_block(out: &mut String, block: &str) {
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }
    out.push_str(block.trim_end());
    out.push('\n');
}
