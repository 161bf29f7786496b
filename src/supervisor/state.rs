//! Supervisor lifecycle states and the run summary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backlog::{Backlog, StoryStatus};

/// Control-loop state.
///
/// `Idle → Locking → Resuming → Dispatching → Watching → {Dispatching |
/// Draining} → Stopped`. A shutdown requested before the first dispatch
/// goes from `Resuming` straight to `Draining`. Any state may move to
/// `Stopped` on a fatal error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    Locking,
    Resuming,
    Dispatching,
    Watching,
    Draining,
    Stopped,
}

impl SupervisorState {
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Locking => "locking",
            SupervisorState::Resuming => "resuming",
            SupervisorState::Dispatching => "dispatching",
            SupervisorState::Watching => "watching",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        match (self, next) {
            (_, Stopped) => true,
            (Idle, Locking) => true,
            (Locking, Resuming) => true,
            (Resuming, Dispatching | Draining) => true,
            (Dispatching, Watching | Draining) => true,
            (Watching, Dispatching | Draining) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Outcome of one supervisor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub split: usize,
    /// Stories left pending or resumable `in_progress`.
    pub remaining: usize,
    /// Blocked stories waiting for manual resolution.
    pub blocked_stories: Vec<String>,
    /// The run was stopped before the backlog was exhausted.
    pub interrupted: bool,
    pub all_passed: bool,
}

impl RunSummary {
    pub fn from_backlog(run_id: impl Into<String>, backlog: &Backlog, interrupted: bool) -> Self {
        let passed = backlog.count_status(StoryStatus::Passed);
        let failed = backlog.count_status(StoryStatus::Failed);
        let blocked = backlog.count_status(StoryStatus::Blocked);
        let split = backlog.count_status(StoryStatus::Split);
        let remaining = backlog
            .user_stories
            .iter()
            .filter(|s| s.status.is_dispatchable())
            .count();
        let blocked_stories = backlog
            .user_stories
            .iter()
            .filter(|s| s.status == StoryStatus::Blocked)
            .map(|s| s.id.clone())
            .collect();

        Self {
            run_id: run_id.into(),
            total: backlog.user_stories.len(),
            passed,
            failed,
            blocked,
            split,
            remaining,
            blocked_stories,
            interrupted,
            all_passed: failed == 0 && blocked == 0 && remaining == 0,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stories: {} passed, {} failed, {} blocked, {} split, {} remaining",
            self.total, self.passed, self.failed, self.blocked, self.split, self.remaining
        )?;
        if !self.blocked_stories.is_empty() {
            write!(f, " (blocked: {})", self.blocked_stories.join(", "))?;
        }
        if self.interrupted {
            f.write_str(" [interrupted]")?;
        }
        Ok(())
    }
}
