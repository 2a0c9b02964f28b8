#![forbid(unsafe_code)]
//! Lifecycle orchestration for workmem.
//!
//! - `hook`: host payload / reply envelopes
//! - `invocation`: interactive vs background-worker classification
//! - `prompt`: keyword classifier behind the PromptObserved reminder
//! - `runner`: detached worker launch, supervised merge, outcome journaling
//! - `synchronizer`: the four trigger points wired together

pub mod hook;
pub mod invocation;
pub mod prompt;
pub mod runner;
pub mod synchronizer;

pub use hook::{HookPayload, HookResponse, Trigger};
pub use invocation::InvocationSource;
pub use prompt::{PromptKind, classify_prompt};
pub use runner::{
    DetachedProcessLauncher, MergeRequest, SupervisedExit, TaskLauncher, compose_merge_instruction,
    run_merge_task, supervise,
};
pub use synchronizer::{IdleOutcome, MemorySynchronizer, PreCompactReport};
pub use workmem_core::{Error, Result};
