//! Who is invoking a trigger: an interactive session or one of our own
//! background merge processes.
//!
//! The classification is made once, at the process boundary, and then passed
//! explicitly into every entry point.

use workmem_core::config::env_value;

/// Environment variable set on every process the merge runner spawns.
pub const INVOCATION_ENV: &str = "WORKMEM_INVOCATION";
/// Value of [`INVOCATION_ENV`] marking a background worker.
pub const BACKGROUND_MARKER: &str = "background-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationSource {
    #[default]
    Interactive,
    BackgroundWorker,
}

impl InvocationSource {
    /// Classify from the raw marker value.
    #[must_use]
    pub fn from_marker(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(BACKGROUND_MARKER) => Self::BackgroundWorker,
            _ => Self::Interactive,
        }
    }

    /// Classify the current process from its environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_marker(env_value(INVOCATION_ENV).as_deref())
    }

    #[must_use]
    pub const fn is_background(self) -> bool {
        matches!(self, Self::BackgroundWorker)
    }
}
