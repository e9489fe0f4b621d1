//! Shared domain types for the claude-mem worker daemon.
//!
//! Everything the other crates agree on lives here: the error taxonomy,
//! the persisted data model (sessions, observations, summaries, the
//! pending-message queue), and the settings layer.

pub mod error;
pub mod paths;
pub mod settings;
pub mod types;

pub use error::{Error, ProviderErrorKind, Result};
