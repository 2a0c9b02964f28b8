//! Project initialization for `workmem init`.
//!
//! Creates the state directory, registers the four lifecycle hooks in the
//! host's `settings.json`, and keeps transient coordination files out of
//! version control. Writes go through temp-file-then-rename.

use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};

use crate::layout::{
    JOURNAL_FILE, LOCK_FILE, SNAPSHOT_SEEN_FILE, STAGING_FILE, StateLayout, WORKER_LOG_FILE,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during setup operations.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected JSON object at top level or hooks key")]
    NotJsonObject,

    #[error(transparent)]
    Core(#[from] crate::error::Error),
}

/// Result of a single file write performed by setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Created,
    Updated,
    Unchanged,
}

// ---------------------------------------------------------------------------
// Host hooks merge
// ---------------------------------------------------------------------------

/// Marker that identifies a hook entry as ours.
const HOOK_MARKER: &str = "workmem hook";

/// Host lifecycle event name paired with our trigger subcommand.
pub const HOOK_EVENTS: &[(&str, &str)] = &[
    ("SessionStart", "init"),
    ("UserPromptSubmit", "prompt"),
    ("Stop", "idle"),
    ("PreCompact", "pre-compact"),
];

fn hook_is_ours(entry: &Value) -> bool {
    entry.to_string().contains(HOOK_MARKER)
}

fn build_hook_entry(program: &str, trigger: &str) -> Value {
    json!({
        "matcher": "",
        "hooks": [
            {
                "type": "command",
                "command": format!("{program} hook {trigger}")
            }
        ]
    })
}

/// Merge our hooks into an existing host `settings.json`.
/// Preserves all other settings and user hooks; replaces stale entries of ours.
pub fn merge_host_hooks(existing: Option<&str>, program: &str) -> Result<String, SetupError> {
    let mut doc: Value = match existing {
        Some(s) if !s.trim().is_empty() => serde_json::from_str(s)?,
        _ => json!({}),
    };

    let obj = doc.as_object_mut().ok_or(SetupError::NotJsonObject)?;
    let hooks = obj.entry("hooks").or_insert_with(|| json!({}));
    let hooks_obj = hooks.as_object_mut().ok_or(SetupError::NotJsonObject)?;

    for (event, trigger) in HOOK_EVENTS {
        merge_hook_array(hooks_obj, event, build_hook_entry(program, trigger));
    }

    Ok(serde_json::to_string_pretty(&doc)? + "\n")
}

fn merge_hook_array(hooks: &mut Map<String, Value>, key: &str, entry: Value) {
    let arr = hooks.entry(key).or_insert_with(|| json!([]));
    if let Some(arr) = arr.as_array_mut() {
        arr.retain(|e| !hook_is_ours(e));
        arr.push(entry);
    }
}

/// Path of the project-local host settings file.
#[must_use]
pub fn project_settings_path(project_root: &Path) -> PathBuf {
    project_root.join(".claude").join("settings.json")
}

/// Path of the user-global host settings file.
#[must_use]
pub fn user_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

/// Only a missing file counts as absent; any other read failure is reported
/// so an unreadable file is never overwritten.
fn read_if_present(path: &Path) -> Result<Option<String>, SetupError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Merge hooks into the settings file at `path`, writing atomically.
pub fn install_hooks(path: &Path, program: &str) -> Result<ActionOutcome, SetupError> {
    let existing = read_if_present(path)?;
    let new_content = merge_host_hooks(existing.as_deref(), program)?;
    write_if_changed(path, existing.as_deref(), &new_content)
}

// ---------------------------------------------------------------------------
// .gitignore management
// ---------------------------------------------------------------------------

/// Transient coordination files that never belong in version control.
#[must_use]
pub fn transient_ignore_entries(state_dir_name: &str) -> Vec<String> {
    [
        LOCK_FILE.to_string(),
        format!("{LOCK_FILE}.*"),
        STAGING_FILE.to_string(),
        SNAPSHOT_SEEN_FILE.to_string(),
        JOURNAL_FILE.to_string(),
        WORKER_LOG_FILE.to_string(),
        ".tmp-*".to_string(),
    ]
    .into_iter()
    .map(|name| format!("{state_dir_name}/{name}"))
    .collect()
}

/// Ensure the given entries are present in the .gitignore file.
/// Does not duplicate existing entries. Returns whether the file changed.
pub fn ensure_gitignore_entries(
    gitignore_path: &Path,
    entries: &[String],
) -> Result<bool, SetupError> {
    let existing = read_if_present(gitignore_path)?.unwrap_or_default();
    let existing_lines: Vec<&str> = existing.lines().map(str::trim).collect();

    let missing: Vec<&String> = entries
        .iter()
        .filter(|e| !existing_lines.contains(&e.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut content = existing.clone();
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for entry in missing {
        content.push_str(entry);
        content.push('\n');
    }
    write_if_changed(gitignore_path, Some(&existing), &content)?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Parameters for `workmem init`.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub layout: StateLayout,
    pub state_dir_name: String,
    /// Command the host should run for hooks (usually `workmem`).
    pub program: String,
    /// Settings file to merge hooks into; `None` skips hook installation.
    pub settings_path: Option<PathBuf>,
}

/// What `workmem init` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub state_dir_created: bool,
    pub hooks: Option<ActionOutcome>,
    pub gitignore_updated: bool,
}

/// Run the full init flow.
pub fn run_init(params: &InitParams) -> Result<InitReport, SetupError> {
    let state_dir_created = !params.layout.is_initialized();
    params.layout.ensure()?;

    let hooks = params
        .settings_path
        .as_deref()
        .map(|path| install_hooks(path, &params.program))
        .transpose()?;

    let gitignore_updated = ensure_gitignore_entries(
        &params.layout.project_root.join(".gitignore"),
        &transient_ignore_entries(&params.state_dir_name),
    )?;

    Ok(InitReport {
        state_dir_created,
        hooks,
        gitignore_updated,
    })
}

fn write_if_changed(
    path: &Path,
    existing: Option<&str>,
    new_content: &str,
) -> Result<ActionOutcome, SetupError> {
    if existing == Some(new_content) {
        return Ok(ActionOutcome::Unchanged);
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    // Atomic write: write to temp, then rename
    let temp = path.with_extension("tmp");
    std::fs::write(&temp, new_content)?;
    std::fs::rename(&temp, path)?;

    if existing.is_some() {
        Ok(ActionOutcome::Updated)
    } else {
        Ok(ActionOutcome::Created)
    }
}
