//! Complexity monitoring.
//!
//! Signals are folded into the story's counters through the state store; the
//! composite score is recomputed on every signal and compared against the
//! story's threshold. Crossing it raises a one-shot [`ComplexityAlert`].

pub mod config;
pub mod signals;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::backlog::{AlertState, StateStore, StoreError, StoreResult, Story};

pub use config::ComplexityConfig;
pub use signals::{composite_score, NormalizedSignals, Signal};

/// Raised once per threshold breach of a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityAlert {
    pub story_id: String,
    pub score: f64,
    pub threshold: f64,
    pub signals: NormalizedSignals,
}

/// Aggregates execution signals into per-story complexity scores.
pub struct ComplexityMonitor {
    store: Arc<StateStore>,
    config: ComplexityConfig,
    alerts: broadcast::Sender<ComplexityAlert>,
}

impl ComplexityMonitor {
    pub fn new(store: Arc<StateStore>, config: ComplexityConfig) -> Self {
        let (alerts, _) = broadcast::channel(64);
        Self {
            store,
            config,
            alerts,
        }
    }

    /// Publishes alerts on an existing channel instead of a private one.
    pub fn with_alert_channel(mut self, alerts: broadcast::Sender<ComplexityAlert>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &ComplexityConfig {
        &self.config
    }

    /// Observers receive every raised alert.
    pub fn subscribe(&self) -> broadcast::Receiver<ComplexityAlert> {
        self.alerts.subscribe()
    }

    /// Ingests one signal. Returns the alert when this signal made the score
    /// cross the threshold; repeated breaches before resolution return `None`.
    pub async fn record(
        &self,
        story_id: &str,
        signal: Signal,
    ) -> StoreResult<Option<ComplexityAlert>> {
        let config = self.config.clone();
        let alert = self
            .store
            .update_story(story_id, move |story| {
                apply_signal(story, &signal)?;
                Ok(evaluate(story, &config))
            })
            .await?;

        if let Some(alert) = &alert {
            info!(
                story_id = %alert.story_id,
                score = alert.score,
                threshold = alert.threshold,
                "complexity alert raised"
            );
            // No subscribers is fine.
            let _ = self.alerts.send(alert.clone());
        }
        Ok(alert)
    }

    /// Current composite score of a story.
    pub async fn score(&self, story_id: &str) -> StoreResult<f64> {
        Ok(self.signals(story_id).await?.composite())
    }

    pub async fn signals(&self, story_id: &str) -> StoreResult<NormalizedSignals> {
        let story = self.store.story(story_id).await?;
        Ok(NormalizedSignals::from_story(&story, &self.config))
    }

    /// Clears a raised alert after a rejected split so the same breach does
    /// not produce another proposal.
    pub async fn dismiss(&self, story_id: &str) -> StoreResult<()> {
        self.store
            .update_story(story_id, |story| {
                if story.alert == AlertState::Raised {
                    story.alert = AlertState::Dismissed;
                    debug!(story_id = %story.id, "complexity alert dismissed");
                }
                Ok(())
            })
            .await
    }

    pub fn threshold_for(&self, story: &Story) -> f64 {
        story.complexity_threshold.unwrap_or(self.config.threshold)
    }
}

fn apply_signal(story: &mut Story, signal: &Signal) -> StoreResult<()> {
    match signal {
        Signal::TimeOverrun {
            criterion_id,
            actual_secs,
        } => {
            let Some(criterion) = story
                .acceptance_criteria
                .iter_mut()
                .find(|c| &c.id == criterion_id)
            else {
                return Err(StoreError::Rejected(format!(
                    "story {} has no criterion {}",
                    story.id, criterion_id
                )));
            };
            criterion.actual_secs = Some(actual_secs.max(0.0));
        }
        Signal::ScopeExpansion { paths } => {
            for path in paths {
                let path = path.trim_start_matches("./");
                if !path.is_empty() {
                    story.touched_paths.insert(path.to_string());
                }
            }
            story.out_of_scope_touches = story.out_of_scope_paths().len() as u32;
        }
        Signal::Error { count } => {
            story.error_count = story.error_count.saturating_add(*count);
        }
        Signal::Clarification { count } => {
            story.clarification_count = story.clarification_count.saturating_add(*count);
        }
    }
    Ok(())
}

/// Recomputes the score and advances the alert state.
fn evaluate(story: &mut Story, config: &ComplexityConfig) -> Option<ComplexityAlert> {
    let signals = NormalizedSignals::from_story(story, config);
    let score = signals.composite();
    let threshold = story.complexity_threshold.unwrap_or(config.threshold);
    story.complexity_score = score;

    if score < threshold {
        if story.alert == AlertState::Dismissed {
            story.alert = AlertState::None;
        }
        return None;
    }
    if story.alert != AlertState::None {
        return None;
    }
    story.alert = AlertState::Raised;
    Some(ComplexityAlert {
        story_id: story.id.clone(),
        score,
        threshold,
        signals,
    })
}
