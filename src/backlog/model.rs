//! Backlog data model: stories, acceptance criteria, checkpoints, leases and
//! gate-result history.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Split,
    Passed,
    Failed,
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Blocked => "blocked",
            StoryStatus::Split => "split",
            StoryStatus::Passed => "passed",
            StoryStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

impl StoryStatus {
    /// `passed` and `failed` are the only terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoryStatus::Passed | StoryStatus::Failed)
    }

    /// Whether the supervisor may hand the story to a worker.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, StoryStatus::Pending | StoryStatus::InProgress)
    }

    /// Transitions the core is allowed to perform. Reopening a failed story
    /// is an external operation and is not listed here.
    pub fn can_transition_to(&self, next: StoryStatus) -> bool {
        use StoryStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, InProgress | Blocked | Split | Passed | Failed) => true,
            (InProgress, Blocked | Split | Passed | Failed) => true,
            (Blocked, Pending | InProgress) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    #[default]
    Pending,
    Done,
}

/// A single verifiable condition within a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "CriterionRepr")]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    pub status: CriterionStatus,
    /// Estimated time in seconds; 0 means "share of the story estimate".
    pub estimated_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_secs: Option<f64>,
}

impl AcceptanceCriterion {
    pub fn new(id: impl Into<String>, description: impl Into<String>, estimated_secs: u64) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: CriterionStatus::Pending,
            estimated_secs,
            actual_secs: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == CriterionStatus::Done
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CriterionRepr {
    Text(String),
    Full(CriterionRecord),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CriterionRecord {
    #[serde(default)]
    id: String,
    description: String,
    #[serde(default)]
    status: CriterionStatus,
    #[serde(default)]
    estimated_secs: u64,
    #[serde(default)]
    actual_secs: Option<f64>,
}

impl From<CriterionRepr> for AcceptanceCriterion {
    fn from(repr: CriterionRepr) -> Self {
        match repr {
            CriterionRepr::Text(description) => AcceptanceCriterion::new("", description, 0),
            CriterionRepr::Full(record) => AcceptanceCriterion {
                id: record.id,
                description: record.description,
                status: record.status,
                estimated_secs: record.estimated_secs,
                actual_secs: record.actual_secs,
            },
        }
    }
}

/// Complexity alert state of a story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    #[default]
    None,
    Raised,
    /// A proposal was rejected; re-arms once the score drops below threshold.
    Dismissed,
}

/// Outcome of one quality gate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    /// The gate ran and rejected the work.
    Fail,
    /// The gate itself could not run.
    Error,
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateOutcome::Pass => f.write_str("pass"),
            GateOutcome::Fail => f.write_str("fail"),
            GateOutcome::Error => f.write_str("error"),
        }
    }
}

/// One appended entry of a story's gate-result history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateAttempt {
    pub gate_name: String,
    /// Ordinal position of the gate in the pipeline.
    pub position: usize,
    pub outcome: GateOutcome,
    /// 1-based attempt number within the cycle.
    pub attempt: u32,
    /// Fix cycle the attempt belongs to.
    pub cycle: u32,
    pub diagnostics: String,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of last-known-good progress for a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub story_id: String,
    /// Index of the last completed acceptance criterion, if any.
    pub last_completed_criterion: Option<usize>,
    /// Store-assigned, strictly increasing per story.
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub state: Value,
}

/// Exclusivity record binding a story to one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub story_id: String,
    pub worker_id: String,
    pub attempt: u64,
    /// Workspace directory of the execution context.
    pub context: PathBuf,
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Signals and checkpoint of a story archived when it was split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedStoryState {
    pub story_id: String,
    pub archived_at: DateTime<Utc>,
    pub error_count: u32,
    pub clarification_count: u32,
    pub out_of_scope_touches: u32,
    pub touched_paths: BTreeSet<String>,
    pub complexity_score: f64,
    pub criterion_actuals: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// A unit of backlog work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub status: StoryStatus,
    /// Estimated duration of the whole story in seconds.
    #[serde(default)]
    pub estimated_secs: u64,
    /// Resource paths (or glob patterns) declared in scope at creation.
    #[serde(default, alias = "targetFiles")]
    pub declared_scope: Vec<String>,
    #[serde(default)]
    pub touched_paths: BTreeSet<String>,
    #[serde(default)]
    pub out_of_scope_touches: u32,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub clarification_count: u32,
    #[serde(default)]
    pub complexity_score: f64,
    /// Per-story override of the complexity threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_threshold: Option<f64>,
    #[serde(default)]
    pub alert: AlertState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub gate_results: Vec<GateAttempt>,
    #[serde(default)]
    pub gate_cycle: u32,
    #[serde(default)]
    pub crash_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            status: StoryStatus::Pending,
            estimated_secs: 0,
            declared_scope: Vec::new(),
            touched_paths: BTreeSet::new(),
            out_of_scope_touches: 0,
            error_count: 0,
            clarification_count: 0,
            complexity_score: 0.0,
            complexity_threshold: None,
            alert: AlertState::None,
            parent_id: None,
            domain: None,
            gate_results: Vec::new(),
            gate_cycle: 0,
            crash_count: 0,
            last_error: None,
            extra: Map::new(),
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<AcceptanceCriterion>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.declared_scope = scope;
        self
    }

    pub fn with_estimate_secs(mut self, secs: u64) -> Self {
        self.estimated_secs = secs;
        self
    }

    pub fn unresolved_criteria(&self) -> impl Iterator<Item = &AcceptanceCriterion> {
        self.acceptance_criteria.iter().filter(|c| !c.is_done())
    }

    pub fn completed_criteria(&self) -> impl Iterator<Item = &AcceptanceCriterion> {
        self.acceptance_criteria.iter().filter(|c| c.is_done())
    }

    /// Index of the next criterion still to execute.
    pub fn next_pending_criterion(&self) -> Option<usize> {
        self.acceptance_criteria.iter().position(|c| !c.is_done())
    }

    pub fn all_criteria_done(&self) -> bool {
        self.acceptance_criteria.iter().all(|c| c.is_done())
    }

    /// Estimate for one criterion, falling back to an even share of the
    /// story estimate.
    pub fn criterion_estimate_secs(&self, index: usize) -> u64 {
        let own = self
            .acceptance_criteria
            .get(index)
            .map(|c| c.estimated_secs)
            .unwrap_or(0);
        if own > 0 {
            return own;
        }
        let count = self.acceptance_criteria.len().max(1) as u64;
        self.estimated_secs / count
    }

    /// Whether a touched path lies inside the declared scope.
    ///
    /// Scope entries are exact paths, directories (covering everything
    /// beneath them) or glob patterns.
    pub fn is_in_scope(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        self.declared_scope.iter().any(|entry| {
            let entry = entry.trim_start_matches("./");
            if entry == path {
                return true;
            }
            let dir = entry.trim_end_matches('/');
            if !dir.is_empty() && path.starts_with(&format!("{}/", dir)) {
                return true;
            }
            glob::Pattern::new(entry)
                .map(|pattern| pattern.matches(path))
                .unwrap_or(false)
        })
    }

    /// Touched paths outside the declared scope.
    pub fn out_of_scope_paths(&self) -> Vec<String> {
        self.touched_paths
            .iter()
            .filter(|p| !self.is_in_scope(p))
            .cloned()
            .collect()
    }

    /// Gate attempts recorded in the given fix cycle.
    pub fn gate_attempts_in_cycle(&self, cycle: u32) -> impl Iterator<Item = &GateAttempt> {
        self.gate_results.iter().filter(move |a| a.cycle == cycle)
    }

    /// Latest recorded attempt for a gate within a cycle.
    pub fn latest_gate_attempt(&self, gate_name: &str, cycle: u32) -> Option<&GateAttempt> {
        self.gate_attempts_in_cycle(cycle)
            .filter(|a| a.gate_name == gate_name)
            .last()
    }
}

/// The persisted backlog: metadata plus the ordered story list and the
/// execution state attached to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backlog {
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, alias = "stories")]
    pub user_stories: Vec<Story>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,
    #[serde(default)]
    pub leases: BTreeMap<String, Lease>,
    #[serde(default)]
    pub archive: Vec<ArchivedStoryState>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Backlog {
    pub fn new(project: impl Into<String>, stories: Vec<Story>) -> Self {
        Self {
            project: project.into(),
            user_stories: stories,
            ..Default::default()
        }
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.user_stories.iter().find(|s| s.id == id)
    }

    pub fn story_mut(&mut self, id: &str) -> Option<&mut Story> {
        self.user_stories.iter_mut().find(|s| s.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.user_stories.iter().position(|s| s.id == id)
    }

    /// Whether any story can still be dispatched.
    pub fn has_dispatchable(&self) -> bool {
        self.user_stories.iter().any(|s| s.status.is_dispatchable())
    }

    pub fn count_status(&self, status: StoryStatus) -> usize {
        self.user_stories
            .iter()
            .filter(|s| s.status == status)
            .count()
    }

    /// Fills in ids for criteria given as bare strings and maps the legacy
    /// `passes: true` flag onto the passed status.
    pub fn normalize(&mut self) {
        for story in &mut self.user_stories {
            for (index, criterion) in story.acceptance_criteria.iter_mut().enumerate() {
                if criterion.id.trim().is_empty() {
                    criterion.id = format!("{}-AC{}", story.id, index + 1);
                }
            }
            if story.status == StoryStatus::Pending
                && story.extra.get("passes").and_then(Value::as_bool) == Some(true)
            {
                story.status = StoryStatus::Passed;
                for criterion in &mut story.acceptance_criteria {
                    criterion.status = CriterionStatus::Done;
                }
            }
            if story.estimated_secs == 0 {
                story.estimated_secs = story
                    .acceptance_criteria
                    .iter()
                    .map(|c| c.estimated_secs)
                    .sum();
            }
        }
    }
}
