//! Error types for workmem
//!
//! Every variant here ends in "log and exit cleanly" at the hook boundary;
//! the classification helpers decide how loudly that happens.

use thiserror::Error;

/// Result type alias for workmem operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for workmem
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Environment
    // ==========================================================================
    #[error("workmem is not initialized for {0} (run `workmem init`)")]
    ConfigurationAbsent(String),

    #[error("required tool not found on PATH: {0}")]
    MissingTooling(String),

    #[error("Invalid hook payload: {0}")]
    InvalidPayload(String),

    // ==========================================================================
    // Coordination
    // ==========================================================================
    #[error("Merge lock timeout after {waited_ms}ms: {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("Stale merge lock removed: {0}")]
    StaleLock(String),

    // ==========================================================================
    // Merge outcomes
    // ==========================================================================
    #[error("Merge failed: {0}")]
    MergeFailure(String),

    #[error("Merge timed out after {0}s")]
    MergeTimeout(u64),

    // ==========================================================================
    // Infrastructure
    // ==========================================================================
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error type string (for journal entries and `status --json`)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::ConfigurationAbsent(_) => "CONFIGURATION_ABSENT",
            Self::MissingTooling(_) => "MISSING_TOOLING",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::StaleLock(_) => "STALE_LOCK",
            Self::MergeFailure(_) => "MERGE_FAILURE",
            Self::MergeTimeout(_) => "MERGE_TIMEOUT",
            Self::Git(_) => "GIT_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Internal(_) => "UNHANDLED_EXCEPTION",
        }
    }

    /// Whether this error is an expected degraded state that should be
    /// swallowed without even a warning-level log line.
    #[must_use]
    pub const fn is_silent_noop(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationAbsent(_) | Self::MissingTooling(_) | Self::LockTimeout { .. }
        )
    }

    /// Whether a later trigger can be expected to succeed where this one failed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::StaleLock(_)
                | Self::MergeFailure(_)
                | Self::MergeTimeout(_)
                | Self::Io(_)
        )
    }
}
