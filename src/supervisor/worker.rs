//! Execution of one leased story: criteria, complexity signals, splitting,
//! the gate pipeline and fix cycles.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::{AgentError, AgentExecutor, CriterionReport};
use crate::backlog::{GateOutcome, StateStore, StoryStatus};
use crate::complexity::{ComplexityAlert, ComplexityMonitor, Signal};
use crate::error::{SupervisorError, SupervisorResult};
use crate::parallel::ExecutionContext;
use crate::quality::{GateProgressUpdate, PipelineOutcome, QualityGatePipeline};
use crate::split::{AdaptiveSplitter, SplitApprover, SplitDecision, SplitError};

/// How a story execution ended short of a terminal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every criterion is done and every gate passed.
    GatesPassed,
    /// The story was replaced by the listed stories.
    Split { children: Vec<String> },
    /// The execution was stopped from outside; the checkpoint stands.
    Cancelled,
}

/// Limits applied to a single story execution.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub criterion_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_criterion_attempts: u32,
    pub max_fix_cycles: u32,
    /// The agent pulses its own heartbeats; the worker does not pulse while
    /// waiting on it.
    pub agent_heartbeats: bool,
}

enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

enum Step {
    Continue,
    Split(Vec<String>),
    Cancelled,
}

pub(crate) struct StoryWorker {
    pub store: Arc<StateStore>,
    pub monitor: Arc<ComplexityMonitor>,
    pub splitter: Arc<AdaptiveSplitter>,
    pub approver: Arc<dyn SplitApprover>,
    pub pipeline: Arc<QualityGatePipeline>,
    pub agent: Arc<dyn AgentExecutor>,
    pub settings: WorkerSettings,
}

impl StoryWorker {
    /// Runs the story from its last checkpoint.
    ///
    /// Terminal conditions come back as errors; the caller decides the final
    /// status from their classification.
    pub async fn execute(&self, ctx: &ExecutionContext) -> SupervisorResult<WorkerOutcome> {
        let story_id = ctx.story_id.as_str();
        let story = self.store.story(story_id).await?;
        if story.status == StoryStatus::Pending {
            self.store
                .set_status(story_id, StoryStatus::InProgress)
                .await?;
        }
        if let Some(checkpoint) = self.store.checkpoint(story_id).await {
            info!(
                story_id,
                sequence = checkpoint.sequence,
                last_completed = ?checkpoint.last_completed_criterion,
                "resuming from checkpoint"
            );
        }

        loop {
            let story = self.store.story(story_id).await?;
            let Some(index) = story.next_pending_criterion() else {
                break;
            };
            match self.run_criterion(ctx, index).await? {
                Step::Continue => {}
                Step::Split(children) => return Ok(WorkerOutcome::Split { children }),
                Step::Cancelled => return Ok(WorkerOutcome::Cancelled),
            }
        }

        self.run_gates(ctx).await
    }

    async fn run_criterion(&self, ctx: &ExecutionContext, index: usize) -> SupervisorResult<Step> {
        let story_id = ctx.story_id.as_str();
        let limit = self.settings.criterion_timeout;
        let max_attempts = self.settings.max_criterion_attempts.max(1);
        let mut attempt = 0;

        loop {
            if ctx.is_cancelled() {
                return Ok(Step::Cancelled);
            }
            attempt += 1;
            let story = self.store.story(story_id).await?;
            let Some(criterion) = story.acceptance_criteria.get(index).cloned() else {
                return Ok(Step::Continue);
            };
            ctx.pulse().await;
            debug!(story_id, criterion_id = %criterion.id, attempt, "executing criterion");

            let started = Instant::now();
            let result = self
                .guard(
                    ctx,
                    Some(limit),
                    !self.settings.agent_heartbeats,
                    self.agent.execute_criterion(ctx, &story, &criterion),
                )
                .await;
            let elapsed = started.elapsed().as_secs_f64();

            let (report, failure) = match result {
                Guarded::Cancelled | Guarded::Done(Err(AgentError::Cancelled)) => {
                    return Ok(Step::Cancelled)
                }
                Guarded::Done(Ok(report)) => (report, None),
                Guarded::Done(Err(err)) => (err.report().cloned().unwrap_or_default(), Some(err.to_string())),
                Guarded::TimedOut => (
                    CriterionReport::default(),
                    Some(format!("criterion timed out after {:?}", limit)),
                ),
            };

            let spent = criterion.actual_secs.unwrap_or(0.0) + elapsed;
            let mut signals = vec![Signal::TimeOverrun {
                criterion_id: criterion.id.clone(),
                actual_secs: spent,
            }];
            signals.extend(report_signals(&report, failure.is_some()));
            let alert = self.record_signals(story_id, signals).await?;

            if failure.is_none() {
                self.store
                    .complete_criterion(
                        story_id,
                        index,
                        json!({
                            "criterionId": criterion.id,
                            "attempt": attempt,
                            "leaseAttempt": ctx.attempt,
                            "elapsedSecs": elapsed,
                        }),
                    )
                    .await?;
                self.store.touch_lease(story_id).await?;
                info!(story_id, criterion_id = %criterion.id, attempt, "criterion done");
            }

            if let Some(alert) = alert {
                match self.handle_alert(ctx, alert).await? {
                    Step::Continue => {}
                    other => return Ok(other),
                }
            }

            let Some(message) = failure else {
                return Ok(Step::Continue);
            };
            warn!(story_id, criterion_id = %criterion.id, attempt, error = %message, "criterion attempt failed");
            if attempt >= max_attempts {
                return Err(SupervisorError::AgentFailure {
                    story_id: story_id.to_string(),
                    criterion_id: criterion.id,
                    message,
                });
            }
        }
    }

    async fn run_gates(&self, ctx: &ExecutionContext) -> SupervisorResult<WorkerOutcome> {
        let story_id = ctx.story_id.as_str();
        loop {
            let run = self.pipeline.run(&self.store, story_id, ctx.workspace(), log_progress);
            let outcome = match self.guard(ctx, None, true, run).await {
                Guarded::Done(outcome) => outcome?,
                // No deadline is set, so only cancellation ends the wait early.
                Guarded::TimedOut | Guarded::Cancelled => return Ok(WorkerOutcome::Cancelled),
            };

            let (gate, attempts, diagnostics) = match outcome {
                PipelineOutcome::Passed => {
                    info!(story_id, "all gates passed");
                    return Ok(WorkerOutcome::GatesPassed);
                }
                PipelineOutcome::Rejected {
                    gate,
                    outcome: GateOutcome::Error,
                    diagnostics,
                    ..
                } => {
                    // The gate never judged the work, so a fix cycle has
                    // nothing to act on. Open a fresh cycle so the resumed
                    // execution reruns the gates with a full attempt budget.
                    self.store
                        .update_story(story_id, |story| {
                            story.gate_cycle += 1;
                            Ok(())
                        })
                        .await?;
                    return Err(SupervisorError::GateError {
                        story_id: story_id.to_string(),
                        gate,
                        message: diagnostics,
                    });
                }
                PipelineOutcome::Rejected {
                    gate,
                    attempts,
                    diagnostics,
                    ..
                } => (gate, attempts, diagnostics),
            };

            let story = self.store.story(story_id).await?;
            if story.gate_cycle >= self.settings.max_fix_cycles {
                return Err(SupervisorError::GateFailure {
                    story_id: story_id.to_string(),
                    gate,
                    attempts,
                    diagnostics,
                });
            }

            let cycle = self
                .store
                .update_story(story_id, |story| {
                    story.gate_cycle += 1;
                    Ok(story.gate_cycle)
                })
                .await?;
            info!(story_id, cycle, gate = %gate, "starting fix cycle");

            let fix = self.guard(
                ctx,
                Some(self.settings.criterion_timeout),
                !self.settings.agent_heartbeats,
                self.agent.fix(ctx, &story, &diagnostics),
            );
            let signals = match fix.await {
                Guarded::Cancelled | Guarded::Done(Err(AgentError::Cancelled)) => {
                    return Ok(WorkerOutcome::Cancelled)
                }
                Guarded::Done(Ok(report)) => report_signals(&report, false),
                Guarded::Done(Err(err)) => {
                    warn!(story_id, cycle, error = %err, "fix attempt failed");
                    report_signals(&err.report().cloned().unwrap_or_default(), true)
                }
                Guarded::TimedOut => {
                    warn!(story_id, cycle, "fix attempt timed out");
                    vec![Signal::Error { count: 1 }]
                }
            };
            if let Some(alert) = self.record_signals(story_id, signals).await? {
                match self.handle_alert(ctx, alert).await? {
                    Step::Continue => {}
                    Step::Split(children) => return Ok(WorkerOutcome::Split { children }),
                    Step::Cancelled => return Ok(WorkerOutcome::Cancelled),
                }
            }
        }
    }

    /// Records signals in order and returns the first alert they raised.
    async fn record_signals(
        &self,
        story_id: &str,
        signals: Vec<Signal>,
    ) -> SupervisorResult<Option<ComplexityAlert>> {
        let mut raised = None;
        for signal in signals {
            if let Some(alert) = self.monitor.record(story_id, signal).await? {
                raised.get_or_insert(alert);
            }
        }
        Ok(raised)
    }

    /// Proposes a split for a raised alert and applies it once approved.
    /// A rejected or impossible split dismisses the alert.
    async fn handle_alert(
        &self,
        ctx: &ExecutionContext,
        alert: ComplexityAlert,
    ) -> SupervisorResult<Step> {
        let story_id = alert.story_id.as_str();
        let proposal = match self.splitter.propose(story_id).await {
            Ok(proposal) => proposal,
            Err(SplitError::NotSplittable { unresolved, .. }) => {
                info!(story_id, unresolved, score = alert.score, "story cannot be split further");
                self.monitor.dismiss(story_id).await?;
                return Ok(Step::Continue);
            }
            Err(err) => return Err(err.into()),
        };

        let decision = match self
            .guard(ctx, None, true, self.approver.decide(&proposal))
            .await
        {
            Guarded::Done(decision) => decision,
            Guarded::TimedOut | Guarded::Cancelled => return Ok(Step::Cancelled),
        };

        match decision {
            SplitDecision::Approve => {
                let children = self.splitter.apply(proposal).await?;
                info!(
                    story_id,
                    score = alert.score,
                    children = %children.join(", "),
                    "story split"
                );
                Ok(Step::Split(children))
            }
            SplitDecision::Reject { reason } => {
                info!(story_id, reason = %reason, "split rejected, continuing unsplit");
                self.monitor.dismiss(story_id).await?;
                Ok(Step::Continue)
            }
        }
    }

    /// Drives `fut` while watching for cancellation and the optional
    /// deadline. With `pulse` set, the lease heartbeat is refreshed for as
    /// long as the worker keeps polling.
    async fn guard<F>(
        &self,
        ctx: &ExecutionContext,
        limit: Option<Duration>,
        pulse: bool,
        fut: F,
    ) -> Guarded<F::Output>
    where
        F: Future,
    {
        tokio::pin!(fut);
        let deadline = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let period = self
            .settings
            .heartbeat_interval
            .max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                output = &mut fut => return Guarded::Done(output),
                _ = &mut deadline => return Guarded::TimedOut,
                _ = ctx.cancelled() => return Guarded::Cancelled,
                _ = ticker.tick(), if pulse => ctx.pulse().await,
            }
        }
    }
}

/// Signals carried by an agent report. A failed step counts as one error
/// on top of the errors the agent reported.
fn report_signals(report: &CriterionReport, failed: bool) -> Vec<Signal> {
    let mut signals = Vec::new();
    if !report.touched_paths.is_empty() {
        signals.push(Signal::ScopeExpansion {
            paths: report.touched_paths.clone(),
        });
    }
    let errors = report.errors.len() as u32 + u32::from(failed);
    if errors > 0 {
        signals.push(Signal::Error { count: errors });
    }
    if !report.clarifications.is_empty() {
        signals.push(Signal::Clarification {
            count: report.clarifications.len() as u32,
        });
    }
    signals
}

fn log_progress(update: GateProgressUpdate) {
    debug!(
        story_id = %update.story_id,
        gate = %update.gate_name,
        attempt = update.attempt,
        state = ?update.state,
        "gate progress"
    );
}
