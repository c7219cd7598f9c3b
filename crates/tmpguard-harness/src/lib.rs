//! Crash-test harness for the tmpguard registry.
//!
//! The `harness` binary is a victim process: it builds a scenario of
//! registered temp files, directories and descriptors, prints a JSON
//! [`Manifest`] describing what a fatal signal must remove, then raises
//! that signal against itself. Tests spawn it and check the filesystem
//! after it dies.

#![forbid(unsafe_code)]

pub mod scenario;

pub use scenario::{Held, Manifest, Scenario, SignalReport, prepare, signal_report};

/// Harness failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("unknown signal {0:?}")]
    UnknownSignal(String),
    #[error("registry error: {0}")]
    Registry(#[from] tmpguard_core::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process survived {0}")]
    Survived(String),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
