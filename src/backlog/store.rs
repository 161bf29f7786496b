//! Single-writer state store.
//!
//! All mutations of the backlog go through [`StateStore::mutate`], which
//! holds the writer mutex, applies the change to a private copy, and only
//! publishes and persists the copy when the change succeeds. Readers get
//! consistent snapshots.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::model::{Backlog, Checkpoint, CriterionStatus, GateAttempt, Lease, Story, StoryStatus};

/// Errors that can occur during state store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("story not found: {0}")]
    StoryNotFound(String),

    #[error("duplicate story id: {0}")]
    DuplicateStory(String),

    #[error("duplicate acceptance criterion id: {0}")]
    DuplicateCriterion(String),

    #[error("invalid status transition for {story_id}: {from} -> {to}")]
    InvalidTransition {
        story_id: String,
        from: StoryStatus,
        to: StoryStatus,
    },

    #[error(
        "checkpoint regression for {story_id}: retained criterion index {retained:?}, attempted {attempted:?}"
    )]
    CheckpointRegression {
        story_id: String,
        retained: Option<usize>,
        attempted: Option<usize>,
    },

    #[error("story {story_id} already has a live lease held by {worker_id}")]
    LeaseHeld { story_id: String, worker_id: String },

    #[error("{0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether the error concerns one story's state rather than the store
    /// as a whole. Persistence and integrity errors are not story-scoped.
    pub fn is_story_scoped(&self) -> bool {
        matches!(
            self,
            StoreError::StoryNotFound(_)
                | StoreError::InvalidTransition { .. }
                | StoreError::CheckpointRegression { .. }
                | StoreError::Rejected(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable backlog state with a single serialization point for writes.
#[derive(Debug)]
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<Backlog>,
}

impl StateStore {
    /// Loads a backlog from disk. Nothing is written until the first mutation.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let read_path = path.clone();
        let content = tokio::task::spawn_blocking(move || fs::read_to_string(&read_path))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))??;
        let backlog = parse_backlog(&content)?;
        info!(
            path = %path.display(),
            stories = backlog.user_stories.len(),
            "loaded backlog"
        );
        Ok(Self {
            path: Some(path),
            state: Mutex::new(backlog),
        })
    }

    /// Creates a store that never touches the filesystem.
    pub fn in_memory(mut backlog: Backlog) -> StoreResult<Self> {
        backlog.normalize();
        validate(&backlog)?;
        Ok(Self {
            path: None,
            state: Mutex::new(backlog),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Consistent copy of the whole backlog.
    pub async fn snapshot(&self) -> Backlog {
        self.state.lock().await.clone()
    }

    pub async fn story(&self, story_id: &str) -> StoreResult<Story> {
        self.state
            .lock()
            .await
            .story(story_id)
            .cloned()
            .ok_or_else(|| StoreError::StoryNotFound(story_id.to_string()))
    }

    /// Applies a mutation atomically.
    ///
    /// The closure runs against a copy; on error nothing changes. On success
    /// the copy is validated, persisted, and published.
    pub async fn mutate<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Backlog) -> StoreResult<R> + Send,
        R: Send,
    {
        self.mutate_with::<R, StoreError, F>(f).await
    }

    /// [`mutate`](Self::mutate) for callers with their own error type.
    pub async fn mutate_with<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Backlog) -> Result<R, E> + Send,
        E: From<StoreError>,
        R: Send,
    {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let result = f(&mut next)?;
        validate(&next)?;
        if let Some(path) = &self.path {
            persist(path.clone(), &next).await?;
        }
        *guard = next;
        Ok(result)
    }

    /// Mutates a single story.
    pub async fn update_story<R, F>(&self, story_id: &str, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut Story) -> StoreResult<R> + Send,
        R: Send,
    {
        let id = story_id.to_string();
        self.mutate(move |backlog| {
            let story = backlog
                .story_mut(&id)
                .ok_or_else(|| StoreError::StoryNotFound(id.clone()))?;
            f(story)
        })
        .await
    }

    /// Transitions a story, enforcing the allowed status graph.
    pub async fn set_status(&self, story_id: &str, status: StoryStatus) -> StoreResult<()> {
        self.update_story(story_id, |story| {
            if !story.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    story_id: story.id.clone(),
                    from: story.status,
                    to: status,
                });
            }
            if story.status != status {
                debug!(story_id = %story.id, from = %story.status, to = %status, "status transition");
            }
            story.status = status;
            Ok(())
        })
        .await
    }

    /// Writes a checkpoint, keeping only the latest one per story.
    ///
    /// The sequence is assigned here; a checkpoint pointing at an earlier
    /// criterion than the retained one is rejected.
    pub async fn write_checkpoint(
        &self,
        story_id: &str,
        last_completed_criterion: Option<usize>,
        state: Value,
    ) -> StoreResult<Checkpoint> {
        let id = story_id.to_string();
        self.mutate(move |backlog| {
            if backlog.story(&id).is_none() {
                return Err(StoreError::StoryNotFound(id));
            }
            let checkpoint = next_checkpoint(backlog, &id, last_completed_criterion, state)?;
            backlog.checkpoints.insert(id, checkpoint.clone());
            Ok(checkpoint)
        })
        .await
    }

    /// Marks a criterion done and checkpoints it in the same mutation.
    pub async fn complete_criterion(
        &self,
        story_id: &str,
        index: usize,
        state: Value,
    ) -> StoreResult<Checkpoint> {
        let id = story_id.to_string();
        self.mutate(move |backlog| {
            let story = backlog
                .story_mut(&id)
                .ok_or_else(|| StoreError::StoryNotFound(id.clone()))?;
            let criterion = story.acceptance_criteria.get_mut(index).ok_or_else(|| {
                StoreError::Rejected(format!("story {} has no criterion #{}", id, index))
            })?;
            criterion.status = CriterionStatus::Done;
            let last_completed = story
                .acceptance_criteria
                .iter()
                .rposition(|c| c.is_done());
            let checkpoint = next_checkpoint(backlog, &id, last_completed, state)?;
            backlog.checkpoints.insert(id, checkpoint.clone());
            Ok(checkpoint)
        })
        .await
    }

    /// Appends a gate attempt and checkpoints it in the same mutation.
    pub async fn append_gate_attempt(
        &self,
        story_id: &str,
        attempt: GateAttempt,
    ) -> StoreResult<Checkpoint> {
        let id = story_id.to_string();
        self.mutate(move |backlog| {
            let story = backlog
                .story_mut(&id)
                .ok_or_else(|| StoreError::StoryNotFound(id.clone()))?;
            let last_completed = story
                .acceptance_criteria
                .iter()
                .rposition(|c| c.is_done());
            let state = serde_json::json!({
                "gate": attempt.gate_name,
                "position": attempt.position,
                "outcome": attempt.outcome,
                "attempt": attempt.attempt,
                "cycle": attempt.cycle,
            });
            story.gate_results.push(attempt);
            let checkpoint = next_checkpoint(backlog, &id, last_completed, state)?;
            backlog.checkpoints.insert(id, checkpoint.clone());
            Ok(checkpoint)
        })
        .await
    }

    pub async fn checkpoint(&self, story_id: &str) -> Option<Checkpoint> {
        self.state.lock().await.checkpoints.get(story_id).cloned()
    }

    /// Records a lease; fails if another live lease exists for the story.
    pub async fn insert_lease(&self, lease: Lease) -> StoreResult<()> {
        self.mutate(move |backlog| {
            if let Some(existing) = backlog.leases.get(&lease.story_id) {
                return Err(StoreError::LeaseHeld {
                    story_id: lease.story_id.clone(),
                    worker_id: existing.worker_id.clone(),
                });
            }
            backlog.leases.insert(lease.story_id.clone(), lease);
            Ok(())
        })
        .await
    }

    pub async fn remove_lease(&self, story_id: &str) -> StoreResult<Option<Lease>> {
        let id = story_id.to_string();
        self.mutate(move |backlog| Ok(backlog.leases.remove(&id)))
            .await
    }

    pub async fn touch_lease(&self, story_id: &str) -> StoreResult<()> {
        let id = story_id.to_string();
        self.mutate(move |backlog| {
            if let Some(lease) = backlog.leases.get_mut(&id) {
                lease.heartbeat_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    /// Writes the current state to disk without changing it.
    pub async fn flush(&self) -> StoreResult<()> {
        let guard = self.state.lock().await;
        if let Some(path) = &self.path {
            persist(path.clone(), &guard).await?;
        }
        Ok(())
    }
}

fn next_checkpoint(
    backlog: &Backlog,
    story_id: &str,
    last_completed_criterion: Option<usize>,
    state: Value,
) -> StoreResult<Checkpoint> {
    let retained = backlog.checkpoints.get(story_id);
    if let Some(retained) = retained {
        if last_completed_criterion < retained.last_completed_criterion {
            return Err(StoreError::CheckpointRegression {
                story_id: story_id.to_string(),
                retained: retained.last_completed_criterion,
                attempted: last_completed_criterion,
            });
        }
    }
    Ok(Checkpoint {
        story_id: story_id.to_string(),
        last_completed_criterion,
        sequence: retained.map(|c| c.sequence + 1).unwrap_or(1),
        recorded_at: Utc::now(),
        state,
    })
}

/// Parses, normalises and validates backlog JSON.
pub fn parse_backlog(content: &str) -> StoreResult<Backlog> {
    let mut backlog: Backlog = serde_json::from_str(content)?;
    backlog.normalize();
    validate(&backlog)?;
    Ok(backlog)
}

fn validate(backlog: &Backlog) -> StoreResult<()> {
    let mut story_ids = std::collections::HashSet::new();
    let mut criterion_ids = std::collections::HashSet::new();
    for story in &backlog.user_stories {
        if !story_ids.insert(story.id.as_str()) {
            return Err(StoreError::DuplicateStory(story.id.clone()));
        }
        // A split parent keeps the criteria its children now own.
        if story.status == StoryStatus::Split {
            continue;
        }
        for criterion in &story.acceptance_criteria {
            if !criterion_ids.insert(criterion.id.as_str()) {
                return Err(StoreError::DuplicateCriterion(criterion.id.clone()));
            }
        }
    }
    Ok(())
}

async fn persist(path: PathBuf, backlog: &Backlog) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(backlog)?;
    tokio::task::spawn_blocking(move || write_atomic(&path, &json))
        .await
        .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))??;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backlog.json".to_string());
    let temp_path = path.with_file_name(format!("{}.tmp", file_name));

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}
