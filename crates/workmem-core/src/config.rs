//! Configuration management for workmem
//!
//! Configuration is loaded from `WORKMEM_*` environment variables. Hooks are
//! cold-started by the host on every trigger, so there is no cache: each
//! process reads the environment exactly once at its entry point and passes
//! the resulting [`Config`] down explicitly.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::layout::StateLayout;

/// Slack a live merge worker gets beyond its own deadline before its lock
/// may be broken.
pub const LOCK_HOLD_MARGIN_SECS: u64 = 60;

/// How the Idle trigger performs its merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Launch a detached worker and return control to the host immediately.
    #[default]
    Background,
    /// Reply with a `block` envelope so the host performs the merge itself
    /// before the session ends.
    Blocking,
}

impl SyncMode {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocking" | "block" | "sync" => Self::Blocking,
            _ => Self::Background,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// Main configuration struct for workmem
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch; when off every trigger is a no-op.
    pub enabled: bool,
    /// Directory (relative to the project root) holding all persisted state.
    pub state_dir_name: String,

    // Lock manager
    pub lock_timeout_secs: u64,
    pub lock_retry_interval_ms: u64,
    pub stale_lock_secs: u64,

    // Freshness throttle: minutes-scale merge skip, hours-scale warning banner.
    pub idle_throttle_secs: u64,
    pub stale_warning_hours: u64,

    // Merge collaborator
    pub merge_command: Vec<String>,
    pub merge_timeout_secs: u64,
    pub sync_mode: SyncMode,

    // Context composition
    pub recent_commits: usize,
    pub status_max_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir_name: ".workmem".to_string(),
            lock_timeout_secs: 90,
            lock_retry_interval_ms: 1000,
            stale_lock_secs: 300,
            idle_throttle_secs: 120,
            stale_warning_hours: 24,
            merge_command: vec!["claude".to_string(), "-p".to_string()],
            merge_timeout_secs: 240,
            sync_mode: SyncMode::Background,
            recent_commits: 3,
            status_max_entries: 20,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.enabled = env_bool("WORKMEM_ENABLED", config.enabled);

        if let Some(v) = env_value("WORKMEM_STATE_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                config.state_dir_name = trimmed.to_string();
            }
        }

        config.lock_timeout_secs = env_u64("WORKMEM_LOCK_TIMEOUT_SECS", config.lock_timeout_secs);
        config.lock_retry_interval_ms =
            env_u64("WORKMEM_LOCK_RETRY_MS", config.lock_retry_interval_ms).max(10);
        config.stale_lock_secs = env_u64("WORKMEM_STALE_LOCK_SECS", config.stale_lock_secs);

        config.idle_throttle_secs =
            env_u64("WORKMEM_IDLE_THROTTLE_SECS", config.idle_throttle_secs);
        config.stale_warning_hours =
            env_u64("WORKMEM_STALE_WARNING_HOURS", config.stale_warning_hours);

        if let Some(v) = env_value("WORKMEM_MERGE_COMMAND") {
            match shlex::split(&v) {
                Some(argv) if !argv.is_empty() => config.merge_command = argv,
                _ => tracing::warn!("ignoring unparseable WORKMEM_MERGE_COMMAND: {v:?}"),
            }
        }
        config.merge_timeout_secs =
            env_u64("WORKMEM_MERGE_TIMEOUT_SECS", config.merge_timeout_secs);
        if let Some(v) = env_value("WORKMEM_SYNC_MODE") {
            config.sync_mode = SyncMode::parse(&v);
        }

        config.recent_commits = env_usize("WORKMEM_RECENT_COMMITS", config.recent_commits);
        config.status_max_entries =
            env_usize("WORKMEM_STATUS_MAX_ENTRIES", config.status_max_entries);

        config.enforce_lock_ordering();
        config
    }

    /// The stale threshold must outlast a merge that is still inside its
    /// deadline; otherwise a waiting worker could break a live lock.
    fn enforce_lock_ordering(&mut self) {
        if self.stale_lock_secs != 0 && self.stale_lock_secs <= self.merge_timeout_secs {
            let adjusted = self.merge_timeout_secs.saturating_add(LOCK_HOLD_MARGIN_SECS);
            tracing::warn!(
                "WORKMEM_STALE_LOCK_SECS={} does not exceed WORKMEM_MERGE_TIMEOUT_SECS={}; using {adjusted}",
                self.stale_lock_secs,
                self.merge_timeout_secs
            );
            self.stale_lock_secs = adjusted;
        }
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    #[must_use]
    pub const fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    #[must_use]
    pub const fn stale_lock_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    #[must_use]
    pub const fn idle_throttle(&self) -> Duration {
        Duration::from_secs(self.idle_throttle_secs)
    }

    #[must_use]
    pub const fn stale_warning(&self) -> Duration {
        Duration::from_secs(self.stale_warning_hours.saturating_mul(3600))
    }

    #[must_use]
    pub const fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    /// Longest a live worker may hold the merge lock before it is presumed
    /// hung: the merge deadline plus [`LOCK_HOLD_MARGIN_SECS`].
    #[must_use]
    pub const fn max_lock_hold(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs.saturating_add(LOCK_HOLD_MARGIN_SECS))
    }

    /// Resolve the persisted-state layout for a project directory.
    #[must_use]
    pub fn layout(&self, project_root: &Path) -> StateLayout {
        StateLayout::new(project_root, &self.state_dir_name)
    }

    /// The merge collaborator's executable resolved against `PATH`, if any.
    #[must_use]
    pub fn resolve_merge_program(&self) -> Option<PathBuf> {
        let program = self.merge_command.first()?;
        resolve_program(program)
    }
}

/// Locate an executable the way a shell would: paths containing a separator
/// are taken as-is, bare names are searched along `PATH`.
#[must_use]
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = env_value("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<std::collections::HashMap<String, String>> =
        std::cell::RefCell::new(std::collections::HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

/// Read a value from the process environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key).ok()
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => default,
    }
}

/// Read a boolean flag (`1/true/yes` vs `0/false/no`), falling back to `default`.
#[must_use]
pub fn env_bool(key: &str, default: bool) -> bool {
    env_value(key).map_or(default, |v| parse_bool(&v, default))
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_value(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
