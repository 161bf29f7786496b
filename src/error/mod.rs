//! Crate-level error taxonomy.
//!
//! Every component has its own error enum; they all funnel into
//! [`SupervisorError`], which is what the supervisor classifies and records.

pub mod classification;

use thiserror::Error;

use crate::backlog::StoreError;
use crate::lock::LockError;
use crate::split::SplitError;

pub use classification::ErrorCategory;

/// Errors surfaced by the supervision engine.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Another live supervisor holds the backlog lock.
    #[error("another supervisor (pid {pid}) is already running this backlog since {since}")]
    LockConflict { pid: u32, since: String },

    /// A second live lease was requested for a story.
    #[error("story {story_id} already has a live lease held by worker {worker_id}")]
    LeaseConflict { story_id: String, worker_id: String },

    /// A gate could not execute.
    #[error("gate '{gate}' could not run for story {story_id}: {message}")]
    GateError {
        story_id: String,
        gate: String,
        message: String,
    },

    /// A gate ran and rejected the work after all permitted attempts.
    #[error("gate '{gate}' rejected story {story_id} after {attempts} attempt(s): {diagnostics}")]
    GateFailure {
        story_id: String,
        gate: String,
        attempts: u32,
        diagnostics: String,
    },

    /// Two parallel stories touched the same out-of-scope resources.
    #[error("story {story_id} collides with {other_story_id} on {}", paths.join(", "))]
    ScopeConflict {
        story_id: String,
        other_story_id: String,
        paths: Vec<String>,
    },

    /// A worker missed its heartbeat deadline or died.
    #[error("worker for story {story_id} crashed ({crashes} crash(es)): {reason}")]
    WorkerCrash {
        story_id: String,
        crashes: u32,
        reason: String,
    },

    /// A split proposal does not preserve the parent's criteria.
    #[error("split of story {story_id} rejected: {reason}")]
    SplitInvariantViolation { story_id: String, reason: String },

    /// The agent could not complete a criterion.
    #[error("agent failed on story {story_id}, criterion {criterion_id}: {message}")]
    AgentFailure {
        story_id: String,
        criterion_id: String,
        message: String,
    },

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for SupervisorError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict { pid, since } => SupervisorError::LockConflict { pid, since },
            other => SupervisorError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

impl From<SplitError> for SupervisorError {
    fn from(err: SplitError) -> Self {
        match err {
            SplitError::Store(e) => SupervisorError::Store(e),
            SplitError::InvariantViolation { story_id, reason } => {
                SupervisorError::SplitInvariantViolation { story_id, reason }
            }
            SplitError::NotSplittable {
                story_id,
                unresolved,
            } => SupervisorError::SplitInvariantViolation {
                story_id,
                reason: format!("{} unresolved criteria cannot be split", unresolved),
            },
        }
    }
}

impl SupervisorError {
    /// Classify the error for retry policy and episode recording.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            SupervisorError::LockConflict { .. } | SupervisorError::LeaseConflict { .. } => {
                ErrorCategory::Fatal(self.to_string())
            }
            SupervisorError::GateError { .. } | SupervisorError::WorkerCrash { .. } => {
                ErrorCategory::Transient(self.to_string())
            }
            SupervisorError::GateFailure { .. }
            | SupervisorError::ScopeConflict { .. }
            | SupervisorError::SplitInvariantViolation { .. }
            | SupervisorError::AgentFailure { .. } => ErrorCategory::Terminal(self.to_string()),
            // A rejected change to one story ends that story, not the run.
            SupervisorError::Store(e) if e.is_story_scoped() => {
                ErrorCategory::Terminal(self.to_string())
            }
            SupervisorError::Store(_) | SupervisorError::Config(_) | SupervisorError::Io(_) => {
                ErrorCategory::Fatal(self.to_string())
            }
        }
    }

    /// Stable snake_case kind used in logs and episodes.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::LockConflict { .. } => "lock_conflict",
            SupervisorError::LeaseConflict { .. } => "lease_conflict",
            SupervisorError::GateError { .. } => "gate_error",
            SupervisorError::GateFailure { .. } => "gate_failure",
            SupervisorError::ScopeConflict { .. } => "scope_conflict",
            SupervisorError::WorkerCrash { .. } => "worker_crash",
            SupervisorError::SplitInvariantViolation { .. } => "split_invariant_violation",
            SupervisorError::AgentFailure { .. } => "agent_failure",
            SupervisorError::Store(_) => "store",
            SupervisorError::Config(_) => "config",
            SupervisorError::Io(_) => "io",
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
