use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current episode schema version.
pub const EPISODE_SCHEMA_VERSION: u32 = 1;

/// Terminal outcome of the story an episode describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Passed,
    Failed,
    Blocked,
}

impl fmt::Display for EpisodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EpisodeOutcome::Passed => "passed",
            EpisodeOutcome::Failed => "failed",
            EpisodeOutcome::Blocked => "blocked",
        })
    }
}

/// A recorded story outcome for the experience store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Episode schema version.
    pub schema_version: u32,
    /// Domain tag used for retrieval.
    pub domain: String,
    /// What the story asked for.
    pub problem: String,
    /// How it ended, or why it did not.
    pub solution: String,
    pub outcome: EpisodeOutcome,
    /// Snapshot of the story's execution state when it ended.
    pub context: Value,
    pub recorded_at: DateTime<Utc>,
}

impl Episode {
    /// Create a new episode with the current timestamp.
    pub fn new(
        domain: impl Into<String>,
        problem: impl Into<String>,
        solution: impl Into<String>,
        outcome: EpisodeOutcome,
    ) -> Self {
        Self {
            schema_version: EPISODE_SCHEMA_VERSION,
            domain: domain.into(),
            problem: problem.into(),
            solution: solution.into(),
            outcome,
            context: Value::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}
