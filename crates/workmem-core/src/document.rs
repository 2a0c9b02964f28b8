//! The working-memory document: flat markdown with fixed named sections.
//!
//! The document is always replaced wholesale; this module only knows how to
//! render and parse it, never how to patch a file in place.

use std::fmt::Write as _;

use crate::vcs::VcsState;

pub const DOCUMENT_TITLE: &str = "# Working Memory";

/// The fixed sections, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    CurrentFocus,
    Decisions,
    ModifiedFiles,
    Context,
    SessionLog,
}

impl Section {
    pub const ALL: &[Self] = &[
        Self::CurrentFocus,
        Self::Decisions,
        Self::ModifiedFiles,
        Self::Context,
        Self::SessionLog,
    ];

    #[must_use]
    pub const fn heading(self) -> &'static str {
        match self {
            Self::CurrentFocus => "Current Focus",
            Self::Decisions => "Decisions",
            Self::ModifiedFiles => "Modified Files",
            Self::Context => "Context",
            Self::SessionLog => "Session Log",
        }
    }

    fn from_heading(text: &str) -> Option<Self> {
        let wanted = text.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.heading().eq_ignore_ascii_case(wanted))
    }
}

/// A parsed working-memory document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDocument {
    pub current_focus: String,
    pub decisions: String,
    pub modified_files: String,
    pub context: String,
    pub session_log: String,
}

impl MemoryDocument {
    #[must_use]
    pub fn section(&self, section: Section) -> &str {
        match section {
            Section::CurrentFocus => &self.current_focus,
            Section::Decisions => &self.decisions,
            Section::ModifiedFiles => &self.modified_files,
            Section::Context => &self.context,
            Section::SessionLog => &self.session_log,
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut String {
        match section {
            Section::CurrentFocus => &mut self.current_focus,
            Section::Decisions => &mut self.decisions,
            Section::ModifiedFiles => &mut self.modified_files,
            Section::Context => &mut self.context,
            Section::SessionLog => &mut self.session_log,
        }
    }

    /// Parse a document. Text under unknown headings is kept with the
    /// preceding known section; text before the first heading is dropped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut current: Option<Section> = None;
        for line in text.lines() {
            if let Some(heading) = line.strip_prefix("## ")
                && let Some(section) = Section::from_heading(heading)
            {
                current = Some(section);
                continue;
            }
            if let Some(section) = current {
                let body = doc.section_mut(section);
                body.push_str(line);
                body.push('\n');
            }
        }
        for section in Section::ALL {
            let body = doc.section_mut(*section);
            *body = body.trim().to_string();
        }
        doc
    }

    /// Render to markdown. Empty sections are omitted.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from(DOCUMENT_TITLE);
        out.push('\n');
        for section in Section::ALL {
            let body = self.section(*section).trim();
            if body.is_empty() {
                continue;
            }
            let _ = write!(out, "\n## {}\n\n{body}\n", section.heading());
        }
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Section::ALL.iter().all(|s| self.section(*s).trim().is_empty())
    }

    /// Minimal document built from version-control state alone, used when a
    /// destructive event arrives before any memory was ever written.
    #[must_use]
    pub fn synthesize_from_vcs(vcs: &VcsState, recent_commits: usize) -> Self {
        let mut context = format!("- Branch: {}", vcs.branch);
        let commits: Vec<&String> = vcs.recent_commits.iter().take(recent_commits).collect();
        if !commits.is_empty() {
            context.push_str("\n- Recent commits:");
            for commit in commits {
                let _ = write!(context, "\n  - {commit}");
            }
        }
        Self {
            current_focus: "Working memory was not established before context compaction; \
                            the focus below is reconstructed from version control only."
                .to_string(),
            context,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcs() -> VcsState {
        VcsState {
            branch: "feature/locks".into(),
            status: vec![" M src/lib.rs".into()],
            recent_commits: vec![
                "abc1234 add lock".into(),
                "def5678 add throttle".into(),
                "0123abc initial".into(),
                "9999999 older".into(),
            ],
        }
    }

    #[test]
    fn render_parse_preserves_sections() {
        let doc = MemoryDocument {
            current_focus: "Wiring the supervisor".into(),
            decisions: "- flock over mkdir".into(),
            modified_files: "- src/lock.rs".into(),
            context: "Branch main".into(),
            session_log: "- s1: started".into(),
        };
        let text = doc.render();
        assert!(text.starts_with(DOCUMENT_TITLE));
        assert_eq!(MemoryDocument::parse(&text), doc);
    }

    #[test]
    fn render_omits_empty_sections() {
        let doc = MemoryDocument {
            current_focus: "x".into(),
            ..MemoryDocument::default()
        };
        let text = doc.render();
        assert!(text.contains("## Current Focus"));
        assert!(!text.contains("## Decisions"));
        assert!(!text.contains("## Session Log"));
    }

    #[test]
    fn parse_is_case_insensitive_and_ignores_preamble() {
        let text = "stray preamble\n## current focus\nA\n## Notes\nkept with focus\n## SESSION LOG\nB\n";
        let doc = MemoryDocument::parse(text);
        assert_eq!(doc.current_focus, "A\n## Notes\nkept with focus");
        assert_eq!(doc.session_log, "B");
        assert!(doc.decisions.is_empty());
    }

    #[test]
    fn synthesized_document_has_only_focus_and_context() {
        let doc = MemoryDocument::synthesize_from_vcs(&vcs(), 3);
        assert!(doc.current_focus.contains("not established before context compaction"));
        assert!(doc.context.contains("feature/locks"));
        assert!(doc.context.contains("abc1234 add lock"));
        assert!(doc.context.contains("0123abc initial"));
        assert!(!doc.context.contains("9999999"), "only three commits");
        assert!(doc.decisions.is_empty());
        assert!(doc.modified_files.is_empty());
        assert!(doc.session_log.is_empty());

        let text = doc.render();
        assert!(text.contains("## Current Focus"));
        assert!(text.contains("## Context"));
        assert!(!text.contains("## Modified Files"));
    }

    #[test]
    fn empty_document_detection() {
        assert!(MemoryDocument::default().is_empty());
        assert!(MemoryDocument::parse("# Working Memory\n\n## Decisions\n\n").is_empty());
        assert!(!MemoryDocument::synthesize_from_vcs(&vcs(), 3).is_empty());
    }
}
