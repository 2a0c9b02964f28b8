//! Host hook protocol.
//!
//! The host delivers one JSON object on stdin per trigger and reads at most
//! one JSON envelope from stdout. Unknown payload fields are ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use workmem_core::{Error, Result};

/// The four lifecycle points the host invokes us at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Init,
    PromptObserved,
    Idle,
    PreCompact,
}

impl Trigger {
    /// Host event name echoed back in context envelopes.
    #[must_use]
    pub const fn host_event(self) -> &'static str {
        match self {
            Self::Init => "SessionStart",
            Self::PromptObserved => "UserPromptSubmit",
            Self::Idle => "Stop",
            Self::PreCompact => "PreCompact",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::PromptObserved => "prompt",
            Self::Idle => "idle",
            Self::PreCompact => "pre-compact",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload the host sends on stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub cwd: PathBuf,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    /// Raw user text (PromptObserved).
    #[serde(default)]
    pub prompt: Option<String>,
    /// `manual` or `auto` (PreCompact).
    #[serde(default)]
    pub trigger: Option<String>,
    /// Set by the host when a Stop hook is already continuing the session.
    #[serde(default)]
    pub stop_hook_active: bool,
}

impl HookPayload {
    /// Parse a stdin payload. Empty input and malformed JSON are both
    /// `InvalidPayload`.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(Error::InvalidPayload("empty payload".into()));
        }
        serde_json::from_str(raw).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    /// Session identifier, or `unknown` when the host omitted it.
    #[must_use]
    pub fn session_id(&self) -> &str {
        if self.session_id.trim().is_empty() {
            "unknown"
        } else {
            &self.session_id
        }
    }

    #[must_use]
    pub fn compact_trigger(&self) -> &str {
        self.trigger.as_deref().unwrap_or("auto")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HookSpecificOutput<'a> {
    hook_event_name: &'a str,
    additional_context: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContextEnvelope<'a> {
    hook_specific_output: HookSpecificOutput<'a>,
}

#[derive(Serialize)]
struct BlockEnvelope<'a> {
    decision: &'static str,
    reason: &'a str,
}

/// What a trigger hands back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResponse {
    /// Nothing to add; print nothing.
    Nothing,
    /// Inject `text` into the session.
    Context { trigger: Trigger, text: String },
    /// Ask the host to run `reason` before ending the session.
    Block { reason: String },
}

impl HookResponse {
    #[must_use]
    pub fn context(trigger: Trigger, text: impl Into<String>) -> Self {
        let text = text.into();
        if text.trim().is_empty() {
            Self::Nothing
        } else {
            Self::Context { trigger, text }
        }
    }

    /// Serialize to the envelope written on stdout, if any.
    pub fn render(&self) -> Result<Option<String>> {
        let json = match self {
            Self::Nothing => return Ok(None),
            Self::Context { trigger, text } => serde_json::to_string(&ContextEnvelope {
                hook_specific_output: HookSpecificOutput {
                    hook_event_name: trigger.host_event(),
                    additional_context: text,
                },
            })?,
            Self::Block { reason } => serde_json::to_string(&BlockEnvelope {
                decision: "block",
                reason,
            })?,
        };
        Ok(Some(json))
    }
}
