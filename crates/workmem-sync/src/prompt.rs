//! Keyword classifier for PromptObserved.
//!
//! Stateless: a prompt that looks like a decision, a change of task, or a
//! request to recall earlier work gets a one-line reminder injected.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Decision,
    TaskSwitch,
    Recall,
}

impl PromptKind {
    #[must_use]
    pub const fn reminder(self) -> &'static str {
        match self {
            Self::Decision => {
                "workmem: this reads like a decision. Record it under Decisions in the working memory, with its reason."
            }
            Self::TaskSwitch => {
                "workmem: focus is changing. Update Current Focus in the working memory before starting the new task."
            }
            Self::Recall => {
                "workmem: earlier context is in the working memory (Current Focus, Decisions, Session Log). Check it before answering."
            }
        }
    }
}

// Checked in order; the first match wins.
static PATTERNS: LazyLock<Vec<(PromptKind, Regex)>> = LazyLock::new(|| {
    [
        (
            PromptKind::Recall,
            r"(?i)\b(where were we|what were we (doing|working on)|remind me|last time|what did we (decide|do)|pick up where|continue from)\b",
        ),
        (
            PromptKind::TaskSwitch,
            r"(?i)\b(now let'?s|next,? let'?s|switch(ing)? (to|over)|move on to|moving on|new task|different task|start working on)\b",
        ),
        (
            PromptKind::Decision,
            r"(?i)\b(we decided|i decided|decision|let'?s (go with|use|stick with)|we('ll| will) (go with|use)|going with|settled on|instead of)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| match Regex::new(pattern) {
        Ok(re) => Some((kind, re)),
        Err(e) => {
            tracing::warn!("invalid prompt pattern for {kind:?}: {e}");
            None
        }
    })
    .collect()
});

/// Classify a raw user prompt.
#[must_use]
pub fn classify_prompt(prompt: &str) -> Option<PromptKind> {
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(prompt))
        .map(|(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_decisions() {
        assert_eq!(
            classify_prompt("Let's go with flock instead of mkdir"),
            Some(PromptKind::Decision)
        );
        assert_eq!(
            classify_prompt("We decided the timeout stays at 90s"),
            Some(PromptKind::Decision)
        );
    }

    #[test]
    fn classifies_task_switches() {
        assert_eq!(
            classify_prompt("ok, now let's look at the journal"),
            Some(PromptKind::TaskSwitch)
        );
        assert_eq!(
            classify_prompt("Moving on to the CLI"),
            Some(PromptKind::TaskSwitch)
        );
    }

    #[test]
    fn recall_wins_over_other_kinds() {
        assert_eq!(
            classify_prompt("Remind me what we decided about locking"),
            Some(PromptKind::Recall)
        );
        assert_eq!(classify_prompt("where were we?"), Some(PromptKind::Recall));
    }

    #[test]
    fn ordinary_prompts_are_ignored() {
        assert_eq!(classify_prompt("fix the failing test in lock.rs"), None);
        assert_eq!(classify_prompt(""), None);
    }

    #[test]
    fn reminders_are_single_line() {
        for kind in [PromptKind::Decision, PromptKind::TaskSwitch, PromptKind::Recall] {
            assert!(!kind.reminder().contains('\n'));
            assert!(kind.reminder().starts_with("workmem:"));
        }
    }
}
