//! Ambient version-control state (branch, short status, recent history).
//!
//! Read-only inspection over `git2`; any project that is not a git work tree simply
//! yields `None`.

use std::path::Path;

use git2::{Repository, Status, StatusOptions};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Version-control state captured into snapshots and context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsState {
    pub branch: String,
    /// `git status --short`-style lines, e.g. ` M src/lib.rs`.
    pub status: Vec<String>,
    /// `<short-sha> <summary>` lines, newest first.
    pub recent_commits: Vec<String>,
}

impl VcsState {
    /// Inspect the repository containing `project_root`.
    ///
    /// Returns `Ok(None)` when the directory is not inside a git work tree.
    pub fn capture(
        project_root: &Path,
        commit_limit: usize,
        status_limit: usize,
    ) -> Result<Option<Self>> {
        let repo = match Repository::discover(project_root) {
            Ok(repo) => repo,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if repo.is_bare() {
            return Ok(None);
        }

        Ok(Some(Self {
            branch: current_branch(&repo),
            status: short_status(&repo, status_limit)?,
            recent_commits: recent_commits(&repo, commit_limit)?,
        }))
    }

    /// Like [`VcsState::capture`] but logs and swallows errors.
    #[must_use]
    pub fn capture_best_effort(
        project_root: &Path,
        commit_limit: usize,
        status_limit: usize,
    ) -> Option<Self> {
        match Self::capture(project_root, commit_limit, status_limit) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("vcs inspection failed for {}: {e}", project_root.display());
                None
            }
        }
    }

    /// Render as a compact markdown block.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("Branch: {}", self.branch);
        if self.status.is_empty() {
            out.push_str("\nWorking tree: clean");
        } else {
            out.push_str("\nWorking tree:");
            for line in &self.status {
                out.push_str("\n  ");
                out.push_str(line);
            }
        }
        if !self.recent_commits.is_empty() {
            out.push_str("\nRecent commits:");
            for line in &self.recent_commits {
                out.push_str("\n  ");
                out.push_str(line);
            }
        }
        out
    }
}

fn current_branch(repo: &Repository) -> String {
    match repo.head() {
        Ok(head) if head.is_branch() => head.shorthand().unwrap_or("HEAD").to_string(),
        Ok(head) => head
            .target()
            .map_or_else(|| "HEAD (detached)".to_string(), |oid| {
                format!("HEAD (detached at {})", short_sha(oid))
            }),
        // Unborn branch: HEAD points at refs/heads/<name> with no commits yet.
        Err(_) => repo
            .find_reference("HEAD")
            .ok()
            .and_then(|r| r.symbolic_target().map(str::to_string))
            .map_or_else(
                || "HEAD".to_string(),
                |t| t.trim_start_matches("refs/heads/").to_string(),
            ),
    }
}

fn short_sha(oid: git2::Oid) -> String {
    let full = oid.to_string();
    full[..7.min(full.len())].to_string()
}

fn short_status(repo: &Repository, limit: usize) -> Result<Vec<String>> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(false)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut lines = Vec::new();
    for entry in statuses.iter() {
        if lines.len() >= limit {
            lines.push(format!("... ({} more)", statuses.len() - limit));
            break;
        }
        let Some(path) = entry.path() else { continue };
        let (index, worktree) = status_codes(entry.status());
        lines.push(format!("{index}{worktree} {path}"));
    }
    Ok(lines)
}

fn status_codes(status: Status) -> (char, char) {
    if status.contains(Status::WT_NEW) {
        return ('?', '?');
    }
    let index = if status.contains(Status::INDEX_NEW) {
        'A'
    } else if status.contains(Status::INDEX_MODIFIED) {
        'M'
    } else if status.contains(Status::INDEX_DELETED) {
        'D'
    } else if status.contains(Status::INDEX_RENAMED) {
        'R'
    } else {
        ' '
    };
    let worktree = if status.contains(Status::WT_MODIFIED) {
        'M'
    } else if status.contains(Status::WT_DELETED) {
        'D'
    } else if status.contains(Status::WT_RENAMED) {
        'R'
    } else {
        ' '
    };
    (index, worktree)
}

fn recent_commits(repo: &Repository, limit: usize) -> Result<Vec<String>> {
    let mut revwalk = repo.revwalk()?;
    if revwalk.push_head().is_err() {
        // Unborn branch: no history yet.
        return Ok(Vec::new());
    }
    revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

    let mut commits = Vec::new();
    for oid_result in revwalk {
        if commits.len() >= limit {
            break;
        }
        let oid = oid_result?;
        let commit = repo.find_commit(oid)?;
        commits.push(format!(
            "{} {}",
            short_sha(oid),
            commit.summary().unwrap_or("")
        ));
    }
    Ok(commits)
}
