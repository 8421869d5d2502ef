//! Error types shared across the harvester.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Pre-flight failures. Any of these aborts the whole invocation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required credential is absent from the environment.
    #[error("{0} is not set in the environment")]
    MissingCredential(&'static str),

    /// The download root cannot be created or written.
    #[error("download directory {path} is not writable: {reason}")]
    Unwritable { path: PathBuf, reason: String },

    #[error("reading config {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the page capability layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    /// The requested action does not apply to the current page (unknown
    /// element, tab or custom action). Reported back to the planner.
    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("browser context is closed")]
    Closed,
}

impl PageError {
    /// Whether the error must halt the driver loop for the current work item.
    pub fn halts_run(&self) -> bool {
        !matches!(self, PageError::NotApplicable(_))
    }
}

/// Errors from the planner (LLM) round-trip.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("could not parse planner reply: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for PlannerError {
    fn from(err: reqwest::Error) -> Self {
        PlannerError::Network(err.to_string())
    }
}

/// Per-work-item failure taxonomy carried by a `RunResult`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunError {
    /// The driver used every allotted step without a stop signal.
    #[error("step budget of {cap} exhausted without a completion signal")]
    BudgetExhausted { cap: usize },

    /// The run stopped but no artifact ever reached the download sink.
    #[error("capture attempted but no artifact was downloaded")]
    DownloadFailure,

    #[error("capability error: {0}")]
    Capability(String),

    #[error("planner error: {0}")]
    Planner(String),

    /// Local storage for the work item could not be prepared.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}
