//! Classifies terminal story outcomes and records them as episodes.
//!
//! Episodes are queued to a recorder task that owns the store, so a slow or
//! broken store never holds up the caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::episode::{Episode, EpisodeOutcome};
use super::store::ExperienceStore;
use crate::backlog::Story;
use crate::error::SupervisorError;
use crate::quality::gates::summary;

/// Upper bound on one episode write.
const RECORD_TIMEOUT: Duration = Duration::from_secs(10);

/// Episodes waiting for the recorder before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

struct PendingEpisode {
    story_id: String,
    episode: Episode,
}

pub struct FailureClassifier {
    default_domain: String,
    queue: mpsc::Sender<PendingEpisode>,
    recorder: JoinHandle<()>,
}

impl FailureClassifier {
    /// Spawns the recorder task; must be called within a tokio runtime.
    /// `default_domain` tags stories that carry no domain of their own.
    pub fn new(store: Arc<dyn ExperienceStore>, default_domain: impl Into<String>) -> Self {
        let (queue, pending) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            default_domain: default_domain.into(),
            queue,
            recorder: tokio::spawn(record_episodes(store, pending)),
        }
    }

    /// Builds the episode for a story that reached a terminal outcome.
    pub fn episode(
        &self,
        story: &Story,
        outcome: EpisodeOutcome,
        error: Option<&SupervisorError>,
    ) -> Episode {
        let domain = story
            .domain
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| self.default_domain.clone());

        let criteria: Vec<&str> = story
            .acceptance_criteria
            .iter()
            .map(|c| c.description.as_str())
            .collect();
        let problem = if criteria.is_empty() {
            format!("{}: {}", story.id, story.title)
        } else {
            format!("{}: {} [{}]", story.id, story.title, criteria.join("; "))
        };

        let category = error.map(SupervisorError::classify);
        let solution = match (outcome, error) {
            (EpisodeOutcome::Passed, _) => format!(
                "passed after {} fix cycle(s); {}",
                story.gate_cycle,
                summary(&story.gate_results)
            ),
            (_, Some(err)) => format!("{}: {}", err.kind(), err),
            (_, None) => story
                .last_error
                .clone()
                .unwrap_or_else(|| format!("story ended {}", outcome)),
        };

        let context = json!({
            "storyId": story.id,
            "status": story.status,
            "parentId": story.parent_id,
            "complexityScore": story.complexity_score,
            "errorCount": story.error_count,
            "clarificationCount": story.clarification_count,
            "outOfScopeTouches": story.out_of_scope_touches,
            "touchedPaths": story.touched_paths,
            "crashCount": story.crash_count,
            "gateCycle": story.gate_cycle,
            "gateAttempts": story.gate_results.len(),
            "errorKind": error.map(SupervisorError::kind),
            "category": category.as_ref().map(|c| c.label()),
        });

        Episode::new(domain, problem, solution, outcome).with_context(context)
    }

    /// Queues the episode of a terminal outcome without waiting for the
    /// store. Recording failures are logged and swallowed.
    pub fn record_outcome(
        &self,
        story: &Story,
        outcome: EpisodeOutcome,
        error: Option<&SupervisorError>,
    ) {
        let pending = PendingEpisode {
            story_id: story.id.clone(),
            episode: self.episode(story, outcome, error),
        };
        match self.queue.try_send(pending) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(pending)) => {
                warn!(story_id = %pending.story_id, "episode queue full, dropping episode");
            }
            Err(mpsc::error::TrySendError::Closed(pending)) => {
                warn!(story_id = %pending.story_id, "episode recorder stopped, dropping episode");
            }
        }
    }

    /// Waits until every queued episode has been written.
    pub async fn finish(self) {
        let Self {
            queue, recorder, ..
        } = self;
        drop(queue);
        if let Err(e) = recorder.await {
            warn!(error = %e, "episode recorder failed");
        }
    }
}

async fn record_episodes(
    store: Arc<dyn ExperienceStore>,
    mut pending: mpsc::Receiver<PendingEpisode>,
) {
    while let Some(PendingEpisode { story_id, episode }) = pending.recv().await {
        let outcome = episode.outcome;
        let domain = episode.domain.clone();
        match tokio::time::timeout(RECORD_TIMEOUT, store.record(episode)).await {
            Ok(Ok(())) => {
                info!(story_id = %story_id, outcome = %outcome, domain = %domain, "recorded episode");
            }
            Ok(Err(e)) => {
                warn!(story_id = %story_id, error = %e, "failed to record episode");
            }
            Err(_) => {
                warn!(story_id = %story_id, "recording episode timed out");
            }
        }
    }
}
