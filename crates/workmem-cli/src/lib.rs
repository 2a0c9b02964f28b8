//! CLI commands for workmem
//!
//! - `hook <trigger>`: host entry points (payload on stdin, envelope on stdout)
//! - `worker`: the detached merge task
//! - `init`, `status`, `unlock`: operator commands
//!
//! Hook commands always exit 0; every failure is logged to stderr instead.

#![forbid(unsafe_code)]

mod status;

use std::io::Read as _;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use workmem_core::setup::{self, InitParams, SetupError};
use workmem_core::{Config, Error};
use workmem_storage::StorageError;
use workmem_storage::lock::{force_remove, inspect_lock};
use workmem_sync::{
    DetachedProcessLauncher, HookPayload, InvocationSource, MemorySynchronizer, MergeRequest,
    Trigger, run_merge_task,
};

pub use status::{StatusReport, collect_status};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Core(#[from] Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "workmem", version, about = "Persistent working memory for coding sessions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Host lifecycle entry point; reads the hook payload from stdin.
    Hook {
        #[arg(value_enum)]
        trigger: HookTrigger,
    },
    /// Run one merge under the project lock (started detached by the idle hook).
    Worker {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        session: String,
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
    /// Create the state directory and register the host hooks.
    Init {
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long = "no-hooks", default_value_t = false)]
        no_hooks: bool,
        /// Register hooks in the user-wide settings instead of the project's.
        #[arg(long, default_value_t = false, conflicts_with = "no_hooks")]
        global: bool,
    },
    /// Show document age, lock holder and recent merge outcomes.
    Status {
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove a stale merge lock (`--force` removes a live one too).
    Unlock {
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long, short = 'f', default_value_t = false)]
        force: bool,
    },
}

impl Commands {
    const fn default_log_level(&self) -> &'static str {
        match self {
            Self::Worker { .. } => "info",
            _ => "warn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookTrigger {
    Init,
    Prompt,
    Idle,
    PreCompact,
}

impl From<HookTrigger> for Trigger {
    fn from(value: HookTrigger) -> Self {
        match value {
            HookTrigger::Init => Self::Init,
            HookTrigger::Prompt => Self::PromptObserved,
            HookTrigger::Idle => Self::Idle,
            HookTrigger::PreCompact => Self::PreCompact,
        }
    }
}

pub fn run() -> i32 {
    let cli = Cli::parse();
    init_logging(cli.command.default_log_level());
    match execute(cli) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            1
        }
    }
}

/// Logs go to stderr: stdout belongs to the host envelope.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_env("WORKMEM_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn emit_error(err: &CliError) {
    eprintln!("error: {err}");
}

fn execute(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Hook { trigger } => {
            handle_hook(trigger);
            Ok(())
        }
        Commands::Worker {
            project,
            session,
            transcript,
        } => handle_worker(project, session, transcript),
        Commands::Init {
            project,
            no_hooks,
            global,
        } => handle_init(project, no_hooks, global),
        Commands::Status { project, json } => handle_status(project, json),
        Commands::Unlock { project, force } => handle_unlock(project, force),
    }
}

fn resolve_project(project: Option<PathBuf>) -> CliResult<PathBuf> {
    let root = match project {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    if !root.is_dir() {
        return Err(CliError::InvalidArgument(format!(
            "project directory does not exist: {}",
            root.display()
        )));
    }
    Ok(root)
}

// ---------------------------------------------------------------------------
// hook
// ---------------------------------------------------------------------------

fn handle_hook(trigger: HookTrigger) {
    if let Err(e) = dispatch_hook(trigger) {
        tracing::warn!("hook {:?} failed: {e}", trigger);
    }
}

fn dispatch_hook(trigger: HookTrigger) -> CliResult<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    let mut payload = HookPayload::parse(&raw)?;
    if payload.cwd.as_os_str().is_empty() {
        payload.cwd = std::env::current_dir()?;
    }

    let config = Config::from_env();
    let source = InvocationSource::from_env();
    let launcher = DetachedProcessLauncher::current_exe(&config)?;
    let sync = MemorySynchronizer::new(config, launcher);

    if let Some(envelope) = sync.handle(trigger.into(), &payload, source).render()? {
        println!("{envelope}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// worker
// ---------------------------------------------------------------------------

fn handle_worker(project: PathBuf, session: String, transcript: Option<PathBuf>) -> CliResult<()> {
    let config = Config::from_env();
    let request = MergeRequest {
        project_root: project,
        session_id: session,
        transcript_path: transcript,
    };
    tracing::info!(
        "worker pid={} merging for session {} in {}",
        std::process::id(),
        request.session_id,
        request.project_root.display()
    );
    let entry = run_merge_task(&config, &request)?;
    match entry.outcome {
        workmem_storage::TaskOutcome::Success | workmem_storage::TaskOutcome::Skipped => Ok(()),
        workmem_storage::TaskOutcome::Failure => Err(Error::MergeFailure(
            entry.detail.unwrap_or_else(|| "unknown".to_string()),
        )
        .into()),
        workmem_storage::TaskOutcome::Timeout => {
            Err(Error::MergeTimeout(config.merge_timeout_secs).into())
        }
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn hook_program() -> String {
    std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string())
        .filter(|p| !p.chars().any(char::is_whitespace))
        .unwrap_or_else(|| "workmem".to_string())
}

fn handle_init(project: Option<PathBuf>, no_hooks: bool, global: bool) -> CliResult<()> {
    let root = resolve_project(project)?;
    let config = Config::from_env();
    let settings_path = if no_hooks {
        None
    } else if global {
        Some(setup::user_settings_path().ok_or_else(|| {
            CliError::InvalidArgument("cannot determine home directory".to_string())
        })?)
    } else {
        Some(setup::project_settings_path(&root))
    };

    let params = InitParams {
        layout: config.layout(&root),
        state_dir_name: config.state_dir_name.clone(),
        program: hook_program(),
        settings_path: settings_path.clone(),
    };
    let report = setup::run_init(&params)?;

    println!(
        "state directory {}: {}",
        if report.state_dir_created { "created" } else { "exists" },
        params.layout.state_dir.display()
    );
    if let (Some(outcome), Some(path)) = (report.hooks, settings_path.as_deref()) {
        println!("hooks {}: {}", outcome_label(outcome), path.display());
    }
    if report.gitignore_updated {
        println!("updated {}", root.join(".gitignore").display());
    }
    Ok(())
}

const fn outcome_label(outcome: setup::ActionOutcome) -> &'static str {
    match outcome {
        setup::ActionOutcome::Created => "created",
        setup::ActionOutcome::Updated => "updated",
        setup::ActionOutcome::Unchanged => "unchanged",
    }
}

// ---------------------------------------------------------------------------
// status / unlock
// ---------------------------------------------------------------------------

fn handle_status(project: Option<PathBuf>, json: bool) -> CliResult<()> {
    let root = resolve_project(project)?;
    let config = Config::from_env();
    let report = collect_status(&config, &root)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn handle_unlock(project: Option<PathBuf>, force: bool) -> CliResult<()> {
    let root = resolve_project(project)?;
    let config = Config::from_env();
    let lock_path = config.layout(&root).lock_path();
    unlock(
        &lock_path,
        config.stale_lock_threshold(),
        config.max_lock_hold(),
        force,
    )
}

/// Remove the merge lock. A held lock is only removed when a waiting
/// merge would break it too, or with `force`.
fn unlock(
    lock_path: &Path,
    stale_after: std::time::Duration,
    max_hold: std::time::Duration,
    force: bool,
) -> CliResult<()> {
    let Some(info) = inspect_lock(lock_path)? else {
        println!("no merge lock at {}", lock_path.display());
        return Ok(());
    };
    let stale = info.is_breakable(stale_after, Some(max_hold));
    if info.held && !stale && !force {
        let pid = info
            .owner
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |o| o.pid.to_string());
        return Err(CliError::InvalidArgument(format!(
            "merge lock is held by pid {pid} ({}s old); use --force to remove it anyway",
            info.age.unwrap_or_default().as_secs()
        )));
    }
    force_remove(lock_path)?;
    if stale {
        tracing::info!("{}", Error::StaleLock(lock_path.display().to_string()));
    }
    println!("removed merge lock {}", lock_path.display());
    Ok(())
}
