//! Error categories driving retry policy and episode labels.

use serde::{Deserialize, Serialize};

/// Broad category of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "category", content = "message", rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retried automatically with backoff; invisible unless exhausted.
    Transient(String),
    /// Marks the story failed or blocked and is surfaced with diagnostics.
    Terminal(String),
    /// Stops the supervisor.
    Fatal(String),
}

impl ErrorCategory {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorCategory::Transient(msg)
            | ErrorCategory::Terminal(msg)
            | ErrorCategory::Fatal(msg) => msg,
        }
    }

    /// Stable label for logs and episodes.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Transient(_) => "transient",
            ErrorCategory::Terminal(_) => "terminal",
            ErrorCategory::Fatal(_) => "fatal",
        }
    }
}
