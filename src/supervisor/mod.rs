//! Top-level control loop.
//!
//! The supervisor takes the backlog lock, loads the state store, clears
//! leases left behind by a dead process and then dispatches eligible stories
//! to the worker coordinator up to the concurrency limit. While stories run
//! it watches task completions, lease heartbeats and the shutdown signal.
//! Crashed workers are force-released and their stories resume from the last
//! checkpoint; the run ends when nothing is dispatchable and nothing is in
//! flight, and releasing the lock is the last thing it does.

pub mod state;
pub mod worker;

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agent::AgentExecutor;
use crate::backlog::{StateStore, StoreError, StoryStatus};
use crate::complexity::{ComplexityAlert, ComplexityConfig, ComplexityMonitor};
use crate::error::{ErrorCategory, SupervisorError, SupervisorResult};
use crate::experience::{
    EpisodeOutcome, ExperienceConfig, ExperienceStore, FailureClassifier,
    InMemoryExperienceStore, JsonlExperienceStore,
};
use crate::lock::LockManager;
use crate::parallel::{CoordinatorConfig, Integration, WorkerCoordinator};
use crate::quality::{PipelineConfig, QualityGate, QualityGatePipeline};
use crate::split::{AdaptiveSplitter, AutoApprover, SplitApprover, SplitConfig, StdinApprover};
use crate::timeout::{HeartbeatEvent, LeaseWatchdog, TimeoutConfig};

pub use state::{RunSummary, SupervisorState};
pub use worker::{WorkerOutcome, WorkerSettings};

use worker::StoryWorker;

/// Configuration for a supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Backlog file; the lock and runtime directory live next to it
    pub backlog_path: PathBuf,

    /// Fix cycles allowed after a terminal gate rejection (0 = none)
    pub max_fix_cycles: u32,

    /// Crashes tolerated per story before it is marked failed
    pub crash_retry_budget: u32,

    /// Agent attempts per acceptance criterion
    pub max_criterion_attempts: u32,

    /// Rely on the agent's own heartbeats while it works
    pub agent_heartbeats: bool,

    pub timeouts: TimeoutConfig,
    pub coordinator: CoordinatorConfig,
    pub complexity: ComplexityConfig,
    pub split: SplitConfig,
    pub pipeline: PipelineConfig,
}

impl SupervisorConfig {
    /// Defaults for the given backlog; workspaces go next to it.
    pub fn new(backlog_path: impl Into<PathBuf>) -> Self {
        let backlog_path = backlog_path.into();
        let work_root = backlog_dir(&backlog_path);
        Self {
            backlog_path,
            max_fix_cycles: 0,
            crash_retry_budget: 2,
            max_criterion_attempts: 3,
            agent_heartbeats: false,
            timeouts: TimeoutConfig::default(),
            coordinator: CoordinatorConfig::default().with_work_root(work_root),
            complexity: ComplexityConfig::default(),
            split: SplitConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.coordinator.max_workers = workers.max(1);
        self
    }

    pub fn with_max_fix_cycles(mut self, cycles: u32) -> Self {
        self.max_fix_cycles = cycles;
        self
    }

    pub fn with_crash_retry_budget(mut self, budget: u32) -> Self {
        self.crash_retry_budget = budget;
        self
    }

    pub fn with_max_criterion_attempts(mut self, attempts: u32) -> Self {
        self.max_criterion_attempts = attempts.max(1);
        self
    }

    pub fn with_agent_heartbeats(mut self, enabled: bool) -> Self {
        self.agent_heartbeats = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_complexity(mut self, complexity: ComplexityConfig) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_split(mut self, split: SplitConfig) -> Self {
        self.split = split;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            criterion_timeout: self.timeouts.criterion_timeout,
            heartbeat_interval: self.timeouts.heartbeat_interval,
            max_criterion_attempts: self.max_criterion_attempts,
            max_fix_cycles: self.max_fix_cycles,
            agent_heartbeats: self.agent_heartbeats,
        }
    }
}

/// Remote control for a running supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SupervisorState>,
}

impl SupervisorHandle {
    /// Requests a graceful stop: in-flight stories are cancelled and keep
    /// their checkpoints.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    agent: Arc<dyn AgentExecutor>,
    gates: Vec<Arc<dyn QualityGate>>,
    approver: Option<Arc<dyn SplitApprover>>,
    experience: Option<Arc<dyn ExperienceStore>>,
    state: watch::Sender<SupervisorState>,
    shutdown: Arc<watch::Sender<bool>>,
    alerts: broadcast::Sender<ComplexityAlert>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, agent: Arc<dyn AgentExecutor>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        let (shutdown, _) = watch::channel(false);
        let (alerts, _) = broadcast::channel(64);
        Self {
            config,
            agent,
            gates: Vec::new(),
            approver: None,
            experience: None,
            state,
            shutdown: Arc::new(shutdown),
            alerts,
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

    /// Overrides the approver chosen from `split.auto_approve`.
    pub fn with_approver(mut self, approver: Arc<dyn SplitApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Overrides the JSONL store next to the backlog.
    pub fn with_experience_store(mut self, store: Arc<dyn ExperienceStore>) -> Self {
        self.experience = Some(store);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shutdown: Arc::clone(&self.shutdown),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Complexity alerts raised during the run.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ComplexityAlert> {
        self.alerts.subscribe()
    }

    /// Runs the backlog to exhaustion or until shutdown.
    ///
    /// Fails with `LockConflict` before touching the state store when
    /// another live supervisor holds the backlog.
    pub async fn run(&self) -> SupervisorResult<RunSummary> {
        let run_id = format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id()
        );
        let span = info_span!("supervisor", run_id = %run_id);
        self.run_locked(run_id).instrument(span).await
    }

    async fn run_locked(&self, run_id: String) -> SupervisorResult<RunSummary> {
        self.transition(SupervisorState::Locking);
        let lock = match LockManager::new(&self.config.backlog_path).acquire().await {
            Ok(lock) => lock,
            Err(err) => {
                error!(error = %err, "could not acquire backlog lock");
                self.transition(SupervisorState::Stopped);
                return Err(err.into());
            }
        };

        let result = self.supervise(&run_id).await;

        if let Err(err) = lock.release() {
            warn!(error = %err, "failed to release backlog lock");
        }
        self.transition(SupervisorState::Stopped);
        result
    }

    async fn supervise(&self, run_id: &str) -> SupervisorResult<RunSummary> {
        self.transition(SupervisorState::Resuming);
        let store = Arc::new(StateStore::open(&self.config.backlog_path).await?);
        let (watchdog, mut heartbeats) = LeaseWatchdog::new(self.config.timeouts.clone());
        let watchdog = Arc::new(watchdog);
        let coordinator = Arc::new(WorkerCoordinator::new(
            self.config.coordinator.clone(),
            Arc::clone(&store),
            Arc::clone(&watchdog),
        ));

        let stale = coordinator.recover_leases().await?;
        let snapshot = store.snapshot().await;
        for story in snapshot
            .user_stories
            .iter()
            .filter(|s| s.status == StoryStatus::InProgress)
        {
            let checkpoint = snapshot.checkpoints.get(&story.id);
            info!(
                story_id = %story.id,
                sequence = checkpoint.map(|c| c.sequence),
                last_completed = ?checkpoint.and_then(|c| c.last_completed_criterion),
                "story will resume"
            );
        }
        info!(
            stories = snapshot.user_stories.len(),
            stale_leases = stale.len(),
            max_workers = self.config.coordinator.max_workers,
            "supervisor started"
        );

        let default_domain = if snapshot.project.trim().is_empty() {
            "default".to_string()
        } else {
            snapshot.project.clone()
        };
        let monitor = Arc::new(
            ComplexityMonitor::new(Arc::clone(&store), self.config.complexity.clone())
                .with_alert_channel(self.alerts.clone()),
        );
        let worker = Arc::new(StoryWorker {
            store: Arc::clone(&store),
            monitor,
            splitter: Arc::new(AdaptiveSplitter::new(
                Arc::clone(&store),
                self.config.split.clone(),
            )),
            approver: self.approver(),
            pipeline: Arc::new(
                QualityGatePipeline::new(
                    self.config
                        .pipeline
                        .clone()
                        .with_gate_timeout(self.config.timeouts.gate_timeout),
                )
                .with_gates(self.gates.iter().cloned()),
            ),
            agent: Arc::clone(&self.agent),
            settings: self.config.worker_settings(),
        });

        let mut run = Run {
            store: Arc::clone(&store),
            coordinator: Arc::clone(&coordinator),
            worker,
            classifier: FailureClassifier::new(self.experience_store(), default_domain),
            crash_retry_budget: self.config.crash_retry_budget,
            tasks: JoinSet::new(),
        };

        watchdog.start_monitoring().await;
        let mut shutdown = self.shutdown.subscribe();
        let mut interrupted = false;
        let outcome = self
            .control_loop(&mut run, &mut heartbeats, &mut shutdown, &mut interrupted)
            .await;

        self.transition(SupervisorState::Draining);
        if interrupted || outcome.is_err() {
            if let Err(err) = coordinator.cancel_all().await {
                warn!(error = %err, "failed to cancel in-flight stories");
            }
        }
        run.tasks.shutdown().await;
        watchdog.stop().await;
        run.classifier.finish().await;
        store.flush().await?;
        outcome?;

        let summary = RunSummary::from_backlog(run_id, &store.snapshot().await, interrupted);
        info!(%summary, "run finished");
        Ok(summary)
    }

    async fn control_loop(
        &self,
        run: &mut Run,
        heartbeats: &mut mpsc::Receiver<HeartbeatEvent>,
        shutdown: &mut watch::Receiver<bool>,
        interrupted: &mut bool,
    ) -> SupervisorResult<()> {
        loop {
            if *shutdown.borrow_and_update() {
                *interrupted = true;
                info!("shutdown requested");
                return Ok(());
            }

            self.transition(SupervisorState::Dispatching);
            run.dispatch().await?;
            if run.tasks.is_empty() {
                debug!("nothing dispatchable and nothing in flight");
                return Ok(());
            }

            self.transition(SupervisorState::Watching);
            tokio::select! {
                joined = run.tasks.join_next() => match joined {
                    Some(Ok(report)) => run.on_report(report).await?,
                    Some(Err(err)) if err.is_cancelled() => debug!("cancelled story task joined"),
                    Some(Err(err)) => warn!(error = %err, "story task failed to join"),
                    None => {}
                },
                Some(event) = heartbeats.recv() => run.on_heartbeat(event).await?,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        *interrupted = true;
                        info!("shutdown requested");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected supervisor transition");
        }
        debug!(from = %previous, to = %next, "supervisor state");
    }

    fn approver(&self) -> Arc<dyn SplitApprover> {
        match &self.approver {
            Some(approver) => Arc::clone(approver),
            None if self.config.split.auto_approve => Arc::new(AutoApprover),
            None => Arc::new(StdinApprover::new()),
        }
    }

    fn experience_store(&self) -> Arc<dyn ExperienceStore> {
        if let Some(store) = &self.experience {
            return Arc::clone(store);
        }
        let base = backlog_dir(&self.config.backlog_path);
        match JsonlExperienceStore::new(base, ExperienceConfig::from_env()) {
            Ok(store) => {
                match store.enforce_retention() {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned expired episodes"),
                    Err(err) => warn!(error = %err, "failed to prune episodes"),
                }
                Arc::new(store)
            }
            Err(err) => {
                warn!(error = %err, "experience store unavailable, keeping episodes in memory");
                Arc::new(InMemoryExperienceStore::new())
            }
        }
    }
}

/// What a story task hands back to the control loop.
struct TaskReport {
    story_id: String,
    attempt: u64,
    result: SupervisorResult<WorkerOutcome>,
}

/// Components of one supervisor run.
struct Run {
    store: Arc<StateStore>,
    coordinator: Arc<WorkerCoordinator>,
    worker: Arc<StoryWorker>,
    classifier: FailureClassifier,
    crash_retry_budget: u32,
    tasks: JoinSet<TaskReport>,
}

impl Run {
    /// Leases and spawns eligible stories, in backlog order, while slots are
    /// free.
    async fn dispatch(&mut self) -> SupervisorResult<usize> {
        let mut started = 0;
        while let Some(permit) = self.coordinator.try_acquire_slot() {
            let in_flight: HashSet<String> =
                self.coordinator.in_flight().await.into_iter().collect();
            let snapshot = self.store.snapshot().await;
            let Some(story_id) = snapshot
                .user_stories
                .iter()
                .find(|s| s.status.is_dispatchable() && !in_flight.contains(&s.id))
                .map(|s| s.id.clone())
            else {
                break;
            };

            let ctx = self.coordinator.lease(&story_id).await?;
            let attempt = ctx.attempt;
            let worker = Arc::clone(&self.worker);
            let task_story_id = story_id.clone();
            let span = info_span!("story", story_id = %story_id, attempt);

            let task = self.tasks.spawn(
                async move {
                    // Hold the slot until the execution ends.
                    let _permit = permit;
                    let result = AssertUnwindSafe(worker.execute(&ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(SupervisorError::WorkerCrash {
                                story_id: task_story_id.clone(),
                                crashes: 0,
                                reason: panic_message(panic.as_ref()),
                            })
                        });
                    TaskReport {
                        story_id: task_story_id,
                        attempt,
                        result,
                    }
                }
                .instrument(span),
            );
            self.coordinator.attach_task(&story_id, attempt, task).await;
            info!(story_id = %story_id, attempt, "story dispatched");
            started += 1;
        }
        Ok(started)
    }

    async fn on_report(&mut self, report: TaskReport) -> SupervisorResult<()> {
        let TaskReport {
            story_id,
            attempt,
            result,
        } = report;
        if !self.coordinator.is_current(&story_id, attempt).await {
            debug!(story_id = %story_id, attempt, "ignoring result of superseded attempt");
            return Ok(());
        }

        match result {
            Ok(WorkerOutcome::GatesPassed) => {
                match self.coordinator.integrate(&story_id, attempt).await {
                    Ok(Integration::Accepted) => {
                        self.store.set_status(&story_id, StoryStatus::Passed).await?;
                        self.coordinator.release(&story_id, attempt).await?;
                        let story = self.store.story(&story_id).await?;
                        info!(story_id = %story_id, "story passed");
                        self.classifier
                            .record_outcome(&story, EpisodeOutcome::Passed, None);
                        Ok(())
                    }
                    Ok(Integration::Stale) => Ok(()),
                    Err(err) => self.on_error(&story_id, attempt, err).await,
                }
            }
            Ok(WorkerOutcome::Split { children }) => {
                self.coordinator.release(&story_id, attempt).await?;
                info!(story_id = %story_id, children = %children.join(", "), "children queued");
                Ok(())
            }
            Ok(WorkerOutcome::Cancelled) => {
                self.coordinator.force_release(&story_id).await?;
                Ok(())
            }
            Err(err) => self.on_error(&story_id, attempt, err).await,
        }
    }

    /// Applies the retry policy of an error's category.
    async fn on_error(
        &mut self,
        story_id: &str,
        attempt: u64,
        err: SupervisorError,
    ) -> SupervisorResult<()> {
        match err.classify() {
            ErrorCategory::Transient(message) => {
                let reason = match err {
                    SupervisorError::WorkerCrash { reason, .. } => reason,
                    _ => message,
                };
                self.on_crash(story_id, reason).await
            }
            ErrorCategory::Terminal(message) => {
                let (status, outcome) = match err {
                    SupervisorError::ScopeConflict { .. }
                    | SupervisorError::SplitInvariantViolation { .. } => {
                        (StoryStatus::Blocked, EpisodeOutcome::Blocked)
                    }
                    _ => (StoryStatus::Failed, EpisodeOutcome::Failed),
                };
                let marked = self
                    .store
                    .update_story(story_id, move |story| {
                        if !story.status.can_transition_to(status) {
                            return Err(StoreError::InvalidTransition {
                                story_id: story.id.clone(),
                                from: story.status,
                                to: status,
                            });
                        }
                        story.status = status;
                        story.last_error = Some(message);
                        Ok(())
                    })
                    .await;
                match marked {
                    Ok(()) => {}
                    Err(e) if e.is_story_scoped() => {
                        warn!(story_id, error = %e, "could not record terminal status");
                    }
                    Err(e) => return Err(e.into()),
                }

                if status == StoryStatus::Blocked {
                    // The workspace stays for manual resolution.
                    self.coordinator.force_release(story_id).await?;
                } else {
                    self.coordinator.release(story_id, attempt).await?;
                }
                error!(story_id, kind = err.kind(), status = %status, error = %err, "story stopped");
                match self.store.story(story_id).await {
                    Ok(story) => self.classifier.record_outcome(&story, outcome, Some(&err)),
                    Err(e) if e.is_story_scoped() => {
                        warn!(story_id, error = %e, "story vanished before its episode was recorded");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            ErrorCategory::Fatal(_) => Err(err),
        }
    }

    /// Force-releases a crashed execution and leaves the story resumable,
    /// unless it has used up its crash budget.
    async fn on_crash(&mut self, story_id: &str, reason: String) -> SupervisorResult<()> {
        self.coordinator.force_release(story_id).await?;

        let budget = self.crash_retry_budget;
        let last_error = reason.clone();
        let crashes = self
            .store
            .update_story(story_id, move |story| {
                story.crash_count += 1;
                story.last_error = Some(last_error);
                if story.crash_count > budget {
                    if story.status.can_transition_to(StoryStatus::Failed) {
                        story.status = StoryStatus::Failed;
                    }
                } else if story.status == StoryStatus::Pending {
                    story.status = StoryStatus::InProgress;
                }
                Ok(story.crash_count)
            })
            .await?;

        if crashes <= budget {
            warn!(story_id, crashes, budget, reason = %reason, "worker crashed, resuming from checkpoint");
            return Ok(());
        }

        let err = SupervisorError::WorkerCrash {
            story_id: story_id.to_string(),
            crashes,
            reason,
        };
        error!(story_id, crashes, error = %err, "crash budget exhausted");
        let story = self.store.story(story_id).await?;
        self.classifier
            .record_outcome(&story, EpisodeOutcome::Failed, Some(&err));
        Ok(())
    }

    async fn on_heartbeat(&mut self, event: HeartbeatEvent) -> SupervisorResult<()> {
        match event {
            HeartbeatEvent::Warning {
                story_id,
                missed,
                remaining_secs,
                ..
            } => {
                warn!(story_id = %story_id, missed, remaining_secs, "heartbeats missed");
                Ok(())
            }
            HeartbeatEvent::StallDetected {
                story_id,
                attempt,
                elapsed_secs,
                ..
            } => {
                if !self.coordinator.is_current(&story_id, attempt).await {
                    return Ok(());
                }
                self.on_crash(&story_id, format!("no heartbeat for {}s", elapsed_secs))
                    .await
            }
        }
    }
}

fn backlog_dir(backlog_path: &Path) -> PathBuf {
    match backlog_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}
