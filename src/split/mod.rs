//! Adaptive story splitting.
//!
//! After a complexity alert the splitter partitions a story's unresolved
//! criteria into at least two child stories, plus a carry-forward story that
//! holds the criteria already done. A proposal only takes effect once it is
//! approved and passes [`validate`], which checks that the criterion ids of
//! the result are exactly the parent's, with nothing lost or duplicated.

pub mod approval;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::backlog::{
    AcceptanceCriterion, AlertState, ArchivedStoryState, Backlog, CriterionStatus, StateStore,
    StoreError, Story, StoryStatus,
};

pub use approval::{
    AutoApprover, ChannelApprover, SplitApprover, SplitDecision, SplitRequest, StdinApprover,
};

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("story {story_id} has {unresolved} unresolved criteria; at least 2 are needed to split")]
    NotSplittable { story_id: String, unresolved: usize },

    #[error("split of story {story_id} violates criteria preservation: {reason}")]
    InvariantViolation { story_id: String, reason: String },

    #[error("state store error: {0}")]
    Store(#[from] StoreError),
}

pub type SplitResult<T> = Result<T, SplitError>;

/// Configuration for proposal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SplitConfig {
    /// Target number of unresolved criteria per child story
    pub max_criteria_per_child: usize,

    /// Upper bound on the number of child stories
    pub max_children: usize,

    /// Approve proposals without external confirmation
    pub auto_approve: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_criteria_per_child: 2,
            max_children: 4,
            auto_approve: true,
        }
    }
}

impl SplitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_criteria_per_child(mut self, count: usize) -> Self {
        self.max_criteria_per_child = count;
        self
    }

    pub fn with_max_children(mut self, count: usize) -> Self {
        self.max_children = count;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// Number of children for `unresolved` criteria: enough to respect the
    /// per-child target, at least 2, at most `max_children`, and never more
    /// than there are criteria.
    pub fn child_count(&self, unresolved: usize) -> usize {
        let per_child = self.max_criteria_per_child.max(1);
        let wanted = unresolved.div_ceil(per_child);
        let upper = self.max_children.max(2);
        wanted.clamp(2, upper).min(unresolved)
    }
}

/// One story of a split proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedStory {
    pub id: String,
    pub title: String,
    pub criteria: Vec<AcceptanceCriterion>,
}

impl ProposedStory {
    fn criterion_ids(&self) -> impl Iterator<Item = &str> {
        self.criteria.iter().map(|c| c.id.as_str())
    }
}

/// Replacement stories for an over-complex story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitProposal {
    pub story_id: String,
    pub children: Vec<ProposedStory>,
    /// Already completed criteria, inserted as a passed story.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carry_forward: Option<ProposedStory>,
}

impl SplitProposal {
    /// Every criterion id across children and carry-forward, in order.
    pub fn criterion_ids(&self) -> Vec<&str> {
        self.carry_forward
            .iter()
            .chain(self.children.iter())
            .flat_map(|s| s.criterion_ids())
            .collect()
    }

    pub fn story_ids(&self) -> Vec<&str> {
        self.carry_forward
            .iter()
            .chain(self.children.iter())
            .map(|s| s.id.as_str())
            .collect()
    }
}

/// Checks that a proposal preserves the parent's criteria exactly.
///
/// The multiset of criterion ids over carry-forward and children must equal
/// the parent's; children hold only unresolved criteria and the carry-forward
/// only completed ones.
pub fn validate(parent: &Story, proposal: &SplitProposal) -> SplitResult<()> {
    let violation = |reason: String| SplitError::InvariantViolation {
        story_id: parent.id.clone(),
        reason,
    };

    if proposal.story_id != parent.id {
        return Err(violation(format!(
            "proposal targets {} instead",
            proposal.story_id
        )));
    }
    if proposal.children.len() < 2 {
        return Err(violation(format!(
            "{} child stories proposed, at least 2 required",
            proposal.children.len()
        )));
    }
    if let Some(child) = proposal.children.iter().find(|c| c.criteria.is_empty()) {
        return Err(violation(format!("child {} has no criteria", child.id)));
    }

    let mut expected: BTreeMap<&str, usize> = BTreeMap::new();
    for criterion in &parent.acceptance_criteria {
        *expected.entry(criterion.id.as_str()).or_default() += 1;
    }
    let mut actual: BTreeMap<&str, usize> = BTreeMap::new();
    for id in proposal.criterion_ids() {
        *actual.entry(id).or_default() += 1;
    }
    if let Some((id, _)) = actual.iter().find(|(_, count)| **count > 1) {
        return Err(violation(format!("criterion {} appears more than once", id)));
    }
    if expected != actual {
        let missing: Vec<&str> = expected
            .keys()
            .filter(|id| !actual.contains_key(*id))
            .copied()
            .collect();
        let extra: Vec<&str> = actual
            .keys()
            .filter(|id| !expected.contains_key(*id))
            .copied()
            .collect();
        return Err(violation(format!(
            "criteria mismatch (missing: [{}], unexpected: [{}])",
            missing.join(", "),
            extra.join(", ")
        )));
    }

    let done: HashSet<&str> = parent.completed_criteria().map(|c| c.id.as_str()).collect();
    for child in &proposal.children {
        if let Some(id) = child.criterion_ids().find(|id| done.contains(id)) {
            return Err(violation(format!(
                "child {} carries completed criterion {}",
                child.id, id
            )));
        }
    }
    if let Some(carry) = &proposal.carry_forward {
        if let Some(id) = carry.criterion_ids().find(|id| !done.contains(id)) {
            return Err(violation(format!(
                "carry-forward {} holds unresolved criterion {}",
                carry.id, id
            )));
        }
    } else if !done.is_empty() {
        return Err(violation(
            "completed criteria present but no carry-forward story".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    if let Some(id) = proposal.story_ids().into_iter().find(|id| !ids.insert(*id)) {
        return Err(violation(format!("story id {} proposed twice", id)));
    }
    Ok(())
}

/// Builds, validates and applies split proposals.
pub struct AdaptiveSplitter {
    store: Arc<StateStore>,
    config: SplitConfig,
}

impl AdaptiveSplitter {
    pub fn new(store: Arc<StateStore>, config: SplitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Proposes a partition of the story's unresolved criteria.
    pub async fn propose(&self, story_id: &str) -> SplitResult<SplitProposal> {
        let backlog = self.store.snapshot().await;
        build_proposal(&backlog, story_id, &self.config)
    }

    /// Applies an approved proposal in one store mutation and returns the
    /// ids of the inserted stories in backlog order.
    ///
    /// The parent becomes `split`, its signals and checkpoint move to the
    /// archive, and the new stories are inserted right after it.
    pub async fn apply(&self, proposal: SplitProposal) -> SplitResult<Vec<String>> {
        let inserted = self
            .store
            .mutate_with(move |backlog| apply_to_backlog(backlog, proposal))
            .await?;
        Ok(inserted)
    }
}

fn build_proposal(
    backlog: &Backlog,
    story_id: &str,
    config: &SplitConfig,
) -> SplitResult<SplitProposal> {
    let story = backlog
        .story(story_id)
        .ok_or_else(|| StoreError::StoryNotFound(story_id.to_string()))?;

    let unresolved: Vec<&AcceptanceCriterion> = story.unresolved_criteria().collect();
    if unresolved.len() < 2 || !story.status.is_dispatchable() {
        return Err(SplitError::NotSplittable {
            story_id: story_id.to_string(),
            unresolved: unresolved.len(),
        });
    }

    let existing: HashSet<&str> = backlog.user_stories.iter().map(|s| s.id.as_str()).collect();
    let mut taken: HashSet<String> = HashSet::new();
    let mut allocate = |base: String| -> String {
        let mut candidate = base.clone();
        let mut suffix = 1;
        while existing.contains(candidate.as_str()) || taken.contains(&candidate) {
            suffix += 1;
            candidate = format!("{}-{}", base, suffix);
        }
        taken.insert(candidate.clone());
        candidate
    };

    let completed: Vec<AcceptanceCriterion> = story.completed_criteria().cloned().collect();
    let carry_forward = if completed.is_empty() {
        None
    } else {
        Some(ProposedStory {
            id: allocate(format!("{}.0", story.id)),
            title: format!("{} (completed)", story.title),
            criteria: completed,
        })
    };

    let count = config.child_count(unresolved.len());
    let base = unresolved.len() / count;
    let remainder = unresolved.len() % count;
    let mut children = Vec::with_capacity(count);
    let mut rest = unresolved.as_slice();
    for index in 0..count {
        let size = base + usize::from(index < remainder);
        let (chunk, tail) = rest.split_at(size);
        rest = tail;
        children.push(ProposedStory {
            id: allocate(format!("{}.{}", story.id, index + 1)),
            title: format!("{} (part {}/{})", story.title, index + 1, count),
            criteria: chunk
                .iter()
                .map(|c| AcceptanceCriterion {
                    status: CriterionStatus::Pending,
                    actual_secs: None,
                    ..(*c).clone()
                })
                .collect(),
        });
    }

    Ok(SplitProposal {
        story_id: story.id.clone(),
        children,
        carry_forward,
    })
}

fn apply_to_backlog(backlog: &mut Backlog, proposal: SplitProposal) -> SplitResult<Vec<String>> {
    let position = backlog
        .position(&proposal.story_id)
        .ok_or_else(|| StoreError::StoryNotFound(proposal.story_id.clone()))?;
    let parent = backlog.user_stories[position].clone();

    if !parent.status.can_transition_to(StoryStatus::Split) || parent.status == StoryStatus::Split
    {
        return Err(StoreError::InvalidTransition {
            story_id: parent.id.clone(),
            from: parent.status,
            to: StoryStatus::Split,
        }
        .into());
    }
    validate(&parent, &proposal)?;

    let taken = proposal
        .story_ids()
        .into_iter()
        .find(|id| backlog.story(id).is_some())
        .map(str::to_string);
    if let Some(id) = taken {
        return Err(SplitError::InvariantViolation {
            story_id: parent.id.clone(),
            reason: format!("story id {} already exists", id),
        });
    }

    let checkpoint = backlog.checkpoints.remove(&parent.id);
    backlog.archive.push(ArchivedStoryState {
        story_id: parent.id.clone(),
        archived_at: Utc::now(),
        error_count: parent.error_count,
        clarification_count: parent.clarification_count,
        out_of_scope_touches: parent.out_of_scope_touches,
        touched_paths: parent.touched_paths.clone(),
        complexity_score: parent.complexity_score,
        criterion_actuals: parent
            .acceptance_criteria
            .iter()
            .filter_map(|c| c.actual_secs.map(|secs| (c.id.clone(), secs)))
            .collect(),
        checkpoint,
    });

    let mut inserted = Vec::new();
    if let Some(carry) = proposal.carry_forward {
        let mut story = child_story(&parent, carry);
        story.status = StoryStatus::Passed;
        inserted.push(story);
    }
    for child in proposal.children {
        inserted.push(child_story(&parent, child));
    }
    let ids: Vec<String> = inserted.iter().map(|s| s.id.clone()).collect();

    let stored_parent = &mut backlog.user_stories[position];
    stored_parent.status = StoryStatus::Split;
    stored_parent.alert = AlertState::None;

    let tail = backlog.user_stories.split_off(position + 1);
    backlog.user_stories.extend(inserted);
    backlog.user_stories.extend(tail);

    info!(
        story_id = %parent.id,
        children = ?ids,
        "applied story split"
    );
    Ok(ids)
}

/// New story with zero accumulated signal state.
fn child_story(parent: &Story, proposed: ProposedStory) -> Story {
    let estimate: u64 = proposed
        .criteria
        .iter()
        .map(|criterion| {
            parent
                .acceptance_criteria
                .iter()
                .position(|c| c.id == criterion.id)
                .map(|index| parent.criterion_estimate_secs(index))
                .unwrap_or(criterion.estimated_secs)
        })
        .sum();

    let mut story = Story::new(proposed.id, proposed.title)
        .with_criteria(proposed.criteria)
        .with_scope(parent.declared_scope.clone())
        .with_estimate_secs(estimate);
    story.description = parent.description.clone();
    story.parent_id = Some(parent.id.clone());
    story.domain = parent.domain.clone();
    story.complexity_threshold = parent.complexity_threshold;
    story
}
