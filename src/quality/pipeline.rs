//! Ordered, short-circuiting quality gate pipeline with retry and backoff.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gates::{GateContext, GateProgressUpdate, GateReport, QualityGate};
use crate::backlog::{GateAttempt, GateOutcome, StateStore, StoreResult};

/// Retry policy shared by all gates of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Attempts per gate unless the gate sets its own limit
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound for the doubling backoff, in milliseconds
    pub max_backoff_ms: u64,

    /// Attempt timeout unless the gate sets its own, in seconds
    pub gate_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            gate_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout_secs = timeout.as_secs();
        self
    }

    /// Delay before retry number `retry` (1-based): doubles from the initial
    /// backoff and is capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// Result of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every gate's latest attempt in this cycle is a pass.
    Passed,
    /// A gate stopped the pipeline after its permitted attempts.
    Rejected {
        gate: String,
        position: usize,
        outcome: GateOutcome,
        attempts: u32,
        diagnostics: String,
    },
}

impl PipelineOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, PipelineOutcome::Passed)
    }
}

/// Runs the configured gates in order against a story.
pub struct QualityGatePipeline {
    gates: Vec<Arc<dyn QualityGate>>,
    config: PipelineConfig,
}

impl QualityGatePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            gates: Vec::new(),
            config,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_gates(mut self, gates: impl IntoIterator<Item = Arc<dyn QualityGate>>) -> Self {
        self.gates.extend(gates);
        self
    }

    pub fn gate_names(&self) -> Vec<&str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs the pipeline for the story's current fix cycle.
    ///
    /// Every attempt is appended to the story's gate history and checkpointed
    /// before the next step. History already recorded for the cycle is
    /// honoured: passed gates are skipped and attempt numbering continues, so
    /// an interrupted invocation resumes where it stopped.
    pub async fn run<F>(
        &self,
        store: &StateStore,
        story_id: &str,
        workspace: &Path,
        mut progress: F,
    ) -> StoreResult<PipelineOutcome>
    where
        F: FnMut(GateProgressUpdate) + Send,
    {
        let story = store.story(story_id).await?;
        let cycle = story.gate_cycle;

        for (position, gate) in self.gates.iter().enumerate() {
            let name = gate.name().to_string();
            let prior: Vec<&GateAttempt> = story
                .gate_attempts_in_cycle(cycle)
                .filter(|a| a.gate_name == name)
                .collect();

            if prior.last().map(|a| a.outcome) == Some(GateOutcome::Pass) {
                debug!(story_id, gate = %name, cycle, "gate already passed in this cycle");
                progress(GateProgressUpdate::skipped(story_id, &name));
                continue;
            }

            let max_attempts = gate
                .max_attempts()
                .unwrap_or(self.config.max_attempts)
                .max(1);
            let mut attempts = prior.len() as u32;
            let mut last: Option<GateReport> = prior.last().map(|a| GateReport {
                outcome: a.outcome,
                diagnostics: a.diagnostics.clone(),
            });

            loop {
                if let Some(report) = &last {
                    if !self.retryable(gate.as_ref(), report.outcome) || attempts >= max_attempts {
                        warn!(
                            story_id,
                            gate = %name,
                            outcome = %report.outcome,
                            attempts,
                            "gate rejected story"
                        );
                        return Ok(PipelineOutcome::Rejected {
                            gate: name,
                            position,
                            outcome: report.outcome,
                            attempts,
                            diagnostics: report.diagnostics.clone(),
                        });
                    }
                    let delay = self.config.backoff(attempts);
                    debug!(story_id, gate = %name, attempts, ?delay, "retrying gate");
                    tokio::time::sleep(delay).await;
                }

                attempts += 1;
                progress(GateProgressUpdate::running(story_id, &name, attempts));
                let (report, elapsed) = self
                    .run_attempt(gate.as_ref(), story_id, workspace)
                    .await;

                store
                    .append_gate_attempt(
                        story_id,
                        GateAttempt {
                            gate_name: name.clone(),
                            position,
                            outcome: report.outcome,
                            attempt: attempts,
                            cycle,
                            diagnostics: report.diagnostics.clone(),
                            duration_ms: elapsed.as_millis() as u64,
                            recorded_at: Utc::now(),
                        },
                    )
                    .await?;

                if report.passed() {
                    progress(GateProgressUpdate::passed(story_id, &name, attempts, elapsed));
                    info!(story_id, gate = %name, attempts, "gate passed");
                    break;
                }
                progress(GateProgressUpdate::failed(story_id, &name, attempts, elapsed));
                last = Some(report);
            }
        }

        Ok(PipelineOutcome::Passed)
    }

    /// `error` is always retryable; `fail` only for idempotent-safe gates.
    fn retryable(&self, gate: &dyn QualityGate, outcome: GateOutcome) -> bool {
        match outcome {
            GateOutcome::Pass => false,
            GateOutcome::Error => true,
            GateOutcome::Fail => gate.idempotent_safe(),
        }
    }

    async fn run_attempt(
        &self,
        gate: &dyn QualityGate,
        story_id: &str,
        workspace: &Path,
    ) -> (GateReport, Duration) {
        let timeout = gate
            .timeout()
            .unwrap_or(Duration::from_secs(self.config.gate_timeout_secs));
        let ctx = GateContext {
            story_id: story_id.to_string(),
            workspace: workspace.to_path_buf(),
            timeout,
        };
        let start = Instant::now();
        let report = match tokio::time::timeout(timeout, gate.run(&ctx)).await {
            Ok(report) => report,
            Err(_) => GateReport::error(format!(
                "gate '{}' timed out after {:?}",
                gate.name(),
                timeout
            )),
        };
        (report, start.elapsed())
    }
}
