//! Background merge execution.
//!
//! Two halves:
//! - the *launcher* side, run inside a hook, which starts a detached
//!   `workmem worker` process and returns immediately
//! - the *worker* side ([`run_merge_task`]), which takes the merge lock,
//!   runs the merge collaborator under a deadline, installs its output and
//!   journals the outcome

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use workmem_core::{Config, Error, Result, StateLayout};
use workmem_storage::{
    FileLock, Journal, JournalEntry, StorageError, TaskOutcome, install_staged, read_optional,
    remove_if_exists,
};

use crate::invocation::{BACKGROUND_MARKER, INVOCATION_ENV};

/// Environment variable naming the file the merge collaborator must write.
pub const TARGET_ENV: &str = "WORKMEM_TARGET";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a worker needs to perform one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub project_root: PathBuf,
    pub session_id: String,
    pub transcript_path: Option<PathBuf>,
}

/// Starts a merge without waiting for it.
pub trait TaskLauncher {
    fn launch(&self, request: &MergeRequest) -> Result<()>;
}

/// Re-executes a binary as `<program> worker ...` in its own process group,
/// with stdin closed and output appended to the project's `worker.log`.
#[derive(Debug, Clone)]
pub struct DetachedProcessLauncher {
    program: PathBuf,
    state_dir_name: String,
}

impl DetachedProcessLauncher {
    #[must_use]
    pub const fn new(program: PathBuf, state_dir_name: String) -> Self {
        Self {
            program,
            state_dir_name,
        }
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe(config: &Config) -> Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            config.state_dir_name.clone(),
        ))
    }
}

impl TaskLauncher for DetachedProcessLauncher {
    fn launch(&self, request: &MergeRequest) -> Result<()> {
        let layout = StateLayout::new(&request.project_root, &self.state_dir_name);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.worker_log_path())?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--project")
            .arg(&request.project_root)
            .arg("--session")
            .arg(&request.session_id);
        if let Some(transcript) = &request.transcript_path {
            cmd.arg("--transcript").arg(transcript);
        }
        cmd.current_dir(&request.project_root)
            .env(INVOCATION_ENV, BACKGROUND_MARKER)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        detach(&mut cmd);

        // Not waited on: the worker outlives this hook process.
        let child = cmd.spawn()?;
        tracing::info!(
            "launched merge worker pid={} for session {}",
            child.id(),
            request.session_id
        );
        Ok(())
    }
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisedExit {
    Completed(ExitStatus),
    /// Deadline exceeded; the child's process group was killed and reaped.
    TimedOut,
}

/// Wait for `child` until `deadline` elapses, then kill its process group.
pub fn supervise(child: &mut Child, deadline: Duration) -> Result<SupervisedExit> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(SupervisedExit::Completed(status)),
            Ok(None) => {
                if start.elapsed() > deadline {
                    kill_process_group(child);
                    let _ = child.wait();
                    return Ok(SupervisedExit::TimedOut);
                }
                std::thread::sleep(POLL_INTERVAL.min(deadline));
            }
            Err(e) => {
                // Without a status we cannot tell whether it is still running.
                kill_process_group(child);
                let _ = child.wait();
                return Err(e.into());
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let killed = i32::try_from(child.id())
        .ok()
        .is_some_and(|pgid| match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("killpg({pgid}) failed: {e}");
                false
            }
        });
    if !killed {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Build the instruction handed to the merge collaborator.
///
/// The existing document may have been written seconds ago by a sibling
/// session, so both it and this session's work are presented as current.
#[must_use]
pub fn compose_merge_instruction(
    existing: Option<&str>,
    request: &MergeRequest,
    target: &Path,
) -> String {
    let mut out = String::from(
        "Update the working-memory document for this project.\n\n",
    );
    let _ = writeln!(
        out,
        "Write the complete merged document to {} and nothing else. \
         Keep exactly these sections, in order: Current Focus, Decisions, Modified Files, Context, Session Log.",
        target.display()
    );
    out.push_str(
        "\nThe existing document and this session's work are equally current. \
         Another session may have written the existing content moments ago; \
         it is not outdated because it was written first. Keep every entry \
         from both that is still relevant, and reconcile conflicts explicitly \
         rather than dropping either side.\n",
    );
    let _ = write!(out, "\nSession: {}\n", request.session_id);
    if let Some(transcript) = &request.transcript_path {
        let _ = writeln!(out, "Session transcript: {}", transcript.display());
    }
    match existing.map(str::trim) {
        Some(doc) if !doc.is_empty() => {
            let _ = write!(
                out,
                "\nExisting document:\n<existing-document>\n{doc}\n</existing-document>\n"
            );
        }
        _ => out.push_str("\nNo document exists yet; create it from this session's work.\n"),
    }
    out
}

/// Run one merge under the project lock and journal the outcome.
///
/// A lock that cannot be acquired within the configured timeout is not an
/// error: the merge is skipped and journaled as `skipped`.
pub fn run_merge_task(config: &Config, request: &MergeRequest) -> Result<JournalEntry> {
    let layout = config.layout(&request.project_root);
    layout.require_initialized()?;
    let journal = Journal::new(layout.journal_path());
    let start = Instant::now();

    let mut lock = FileLock::new(layout.lock_path())
        .with_timeout(config.lock_timeout())
        .with_retry_interval(config.lock_retry_interval())
        .with_stale_timeout(config.stale_lock_threshold())
        .with_max_hold(config.max_lock_hold());

    match lock.acquire() {
        Ok(()) => {}
        Err(StorageError::LockTimeout { waited_ms, .. }) => {
            tracing::info!(
                "merge lock busy for {waited_ms}ms; skipping merge for session {}",
                request.session_id
            );
            let entry = JournalEntry::new(&request.session_id, TaskOutcome::Skipped, elapsed_ms(start))
                .with_detail(format!("lock timeout after {waited_ms}ms"));
            journal.append(&entry)?;
            return Ok(entry);
        }
        Err(e) => return Err(e.into()),
    }

    let (outcome, detail) = merge_locked(config, &layout, request);
    lock.release()?;

    let mut entry = JournalEntry::new(&request.session_id, outcome, elapsed_ms(start));
    if let Some(detail) = detail {
        entry = entry.with_detail(detail);
    }
    match outcome {
        TaskOutcome::Success => tracing::info!("merge succeeded in {}ms", entry.duration_ms),
        _ => tracing::warn!(
            "merge {}: {}",
            outcome,
            entry.detail.as_deref().unwrap_or("no detail")
        ),
    }
    journal.append(&entry)?;
    Ok(entry)
}

/// The critical section. Never returns early without an outcome so the
/// caller always releases the lock. Leftover staging output is removed here,
/// while the lock is still held, so it can only ever be our own.
fn merge_locked(
    config: &Config,
    layout: &StateLayout,
    request: &MergeRequest,
) -> (TaskOutcome, Option<String>) {
    let (outcome, detail) = match invoke_merge(config, layout, request) {
        Ok(result) => result,
        Err(e) => (TaskOutcome::Failure, Some(e.to_string())),
    };
    if outcome != TaskOutcome::Success
        && let Err(e) = remove_if_exists(&layout.staging_path())
    {
        tracing::warn!("could not remove staged merge output: {e}");
    }
    (outcome, detail)
}

fn invoke_merge(
    config: &Config,
    layout: &StateLayout,
    request: &MergeRequest,
) -> Result<(TaskOutcome, Option<String>)> {
    let Some((program, args)) = config.merge_command.split_first() else {
        return Err(Error::MissingTooling("empty merge command".into()));
    };
    let staging = layout.staging_path();
    remove_if_exists(&staging)?;

    // Re-read inside the lock: a sibling may have merged while we waited.
    let existing = read_optional(&layout.memory_path())?;
    let instruction = compose_merge_instruction(existing.as_deref(), request, &staging);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .arg(&instruction)
        .current_dir(&request.project_root)
        .env(TARGET_ENV, &staging)
        .env(INVOCATION_ENV, BACKGROUND_MARKER)
        .stdin(Stdio::null());
    detach(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Ok((TaskOutcome::Failure, Some(format!("spawn {program} failed: {e}")))),
    };

    let deadline = config.merge_timeout();
    match supervise(&mut child, deadline)? {
        SupervisedExit::TimedOut => Ok((
            TaskOutcome::Timeout,
            Some(format!("killed after exceeding {}s", deadline.as_secs())),
        )),
        SupervisedExit::Completed(status) if !status.success() => {
            Ok((TaskOutcome::Failure, Some(format!("merge exited with {status}"))))
        }
        SupervisedExit::Completed(_) => {
            let produced = read_optional(&staging)?;
            if produced.as_deref().is_none_or(|s| s.trim().is_empty()) {
                return Ok((
                    TaskOutcome::Failure,
                    Some("merge produced no document".into()),
                ));
            }
            install_staged(&staging, &layout.memory_path())?;
            Ok((TaskOutcome::Success, None))
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
