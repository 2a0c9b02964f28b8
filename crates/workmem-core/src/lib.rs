//! Core types and configuration for workmem
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - The error taxonomy shared by every trigger path
//! - Persisted state layout
//! - The working-memory document model
//! - Version-control probing
//! - `workmem init` setup logic

#![forbid(unsafe_code)]

pub mod config;
pub mod document;
pub mod error;
pub mod layout;
pub mod setup;
pub mod vcs;

// Re-export key types for convenience
pub use config::{Config, SyncMode};
pub use document::{MemoryDocument, Section};
pub use error::{Error, Result};
pub use layout::StateLayout;
pub use vcs::VcsState;
