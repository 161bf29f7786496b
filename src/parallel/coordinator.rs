//! Worker coordinator: execution contexts, leases and bounded concurrency.
//!
//! Each dispatched story gets an isolated workspace directory and a lease
//! recorded in the state store. Concurrency is bounded by a semaphore; the
//! coordinator's own bookkeeping sits behind a read-write lock. Results are
//! integrated one at a time, and out-of-scope touches that collide with an
//! earlier integration block the later story.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use crate::backlog::{Lease, StateStore, StoreError};
use crate::error::{SupervisorError, SupervisorResult};
use crate::lock::RUNTIME_DIR;
use crate::timeout::LeaseWatchdog;

/// Configuration for story execution slots and workspaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Maximum number of stories executing at once (1 = sequential)
    pub max_workers: usize,

    /// Directory under which `.ralph/workspaces/<story>` contexts are created
    pub work_root: PathBuf,

    /// Keep workspace directories after a story completes
    pub keep_workspaces: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            work_root: PathBuf::from("."),
            keep_workspaces: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    pub fn workspace_for(&self, story_id: &str) -> PathBuf {
        self.work_root
            .join(RUNTIME_DIR)
            .join("workspaces")
            .join(sanitize(story_id))
    }
}

/// Result of integrating a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integration {
    /// Results belong to the live lease and were accepted.
    Accepted,
    /// Results came from a superseded attempt and must be discarded.
    Stale,
}

#[derive(Debug)]
struct LiveLease {
    attempt: u64,
    worker_id: String,
    cancel: watch::Sender<bool>,
    task: Option<AbortHandle>,
}

/// Tracks live leases and the scope-collision registry.
#[derive(Debug, Default)]
struct CoordinationState {
    live: HashMap<String, LiveLease>,
    /// Highest attempt number handed out per story.
    attempts: HashMap<String, u64>,
    /// Out-of-scope path -> story that integrated it first.
    scope_registry: HashMap<String, String>,
    next_worker: u64,
}

pub struct WorkerCoordinator {
    config: CoordinatorConfig,
    store: Arc<StateStore>,
    watchdog: Arc<LeaseWatchdog>,
    semaphore: Arc<Semaphore>,
    state: Arc<RwLock<CoordinationState>>,
}

impl WorkerCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<StateStore>,
        watchdog: Arc<LeaseWatchdog>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            store,
            watchdog,
            semaphore,
            state: Arc::new(RwLock::new(CoordinationState::default())),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Takes an execution slot if one is free.
    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().ok()
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Clears leases left in the store by a previous process.
    ///
    /// Only valid while holding the backlog lock: any persisted lease then
    /// belongs to a supervisor that no longer runs. Attempt numbering
    /// continues from the cleared leases.
    pub async fn recover_leases(&self) -> SupervisorResult<Vec<Lease>> {
        let stale = self
            .store
            .mutate(|backlog| Ok(std::mem::take(&mut backlog.leases)))
            .await?;
        let mut state = self.state.write().await;
        for lease in stale.values() {
            warn!(
                story_id = %lease.story_id,
                worker_id = %lease.worker_id,
                owner_pid = lease.owner_pid,
                "clearing stale lease"
            );
            let entry = state.attempts.entry(lease.story_id.clone()).or_default();
            *entry = (*entry).max(lease.attempt);
        }
        Ok(stale.into_values().collect())
    }

    /// Creates the execution context and lease for a story.
    ///
    /// Fails with `LeaseConflict` when a live lease already exists.
    pub async fn lease(&self, story_id: &str) -> SupervisorResult<ExecutionContext> {
        let mut state = self.state.write().await;
        if let Some(live) = state.live.get(story_id) {
            return Err(SupervisorError::LeaseConflict {
                story_id: story_id.to_string(),
                worker_id: live.worker_id.clone(),
            });
        }

        state.next_worker += 1;
        let worker_id = format!("worker-{}", state.next_worker);
        let attempt = state.attempts.get(story_id).copied().unwrap_or(0) + 1;

        let workspace = self.config.workspace_for(story_id);
        tokio::fs::create_dir_all(&workspace).await?;

        let now = Utc::now();
        let lease = Lease {
            story_id: story_id.to_string(),
            worker_id: worker_id.clone(),
            attempt,
            context: workspace.clone(),
            owner_pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        };
        match self.store.insert_lease(lease).await {
            Ok(()) => {}
            Err(StoreError::LeaseHeld { story_id, worker_id }) => {
                return Err(SupervisorError::LeaseConflict {
                    story_id,
                    worker_id,
                })
            }
            Err(e) => return Err(e.into()),
        }

        let heartbeat = self.watchdog.register(story_id, attempt).await;
        let (cancel, cancel_rx) = watch::channel(false);
        state.attempts.insert(story_id.to_string(), attempt);
        state.live.insert(
            story_id.to_string(),
            LiveLease {
                attempt,
                worker_id: worker_id.clone(),
                cancel,
                task: None,
            },
        );

        info!(story_id, worker_id = %worker_id, attempt, "lease acquired");
        Ok(ExecutionContext::new(
            story_id,
            worker_id,
            attempt,
            workspace,
            heartbeat,
            cancel_rx,
        ))
    }

    /// Associates the spawned task with the lease so `cancel` can stop it.
    pub async fn attach_task(&self, story_id: &str, attempt: u64, task: AbortHandle) {
        let mut state = self.state.write().await;
        if let Some(live) = state.live.get_mut(story_id) {
            if live.attempt == attempt {
                live.task = Some(task);
            }
        }
    }

    /// Whether `attempt` is the live lease of the story.
    pub async fn is_current(&self, story_id: &str, attempt: u64) -> bool {
        self.state
            .read()
            .await
            .live
            .get(story_id)
            .map(|live| live.attempt == attempt)
            .unwrap_or(false)
    }

    pub async fn in_flight(&self) -> Vec<String> {
        self.state.read().await.live.keys().cloned().collect()
    }

    /// Integrates a finished execution into the shared backlog view.
    ///
    /// Results of a superseded attempt are reported as stale. With more than
    /// one worker, the story's out-of-scope touches are checked against
    /// those integrated before it.
    pub async fn integrate(&self, story_id: &str, attempt: u64) -> SupervisorResult<Integration> {
        let mut state = self.state.write().await;
        let current = state
            .live
            .get(story_id)
            .map(|live| live.attempt == attempt)
            .unwrap_or(false);
        if !current {
            debug!(story_id, attempt, "discarding results of superseded attempt");
            return Ok(Integration::Stale);
        }
        if self.config.max_workers <= 1 {
            return Ok(Integration::Accepted);
        }

        let story = self.store.story(story_id).await?;
        let touches = story.out_of_scope_paths();
        let mut collisions: Vec<(String, String)> = touches
            .iter()
            .filter_map(|path| {
                state
                    .scope_registry
                    .get(path)
                    .filter(|owner| owner.as_str() != story_id)
                    .map(|owner| (owner.clone(), path.clone()))
            })
            .collect();

        if !collisions.is_empty() {
            collisions.sort();
            let other_story_id = collisions[0].0.clone();
            let paths = collisions.into_iter().map(|(_, path)| path).collect();
            return Err(SupervisorError::ScopeConflict {
                story_id: story_id.to_string(),
                other_story_id,
                paths,
            });
        }

        for path in touches {
            state
                .scope_registry
                .entry(path)
                .or_insert_with(|| story_id.to_string());
        }
        Ok(Integration::Accepted)
    }

    /// Releases the lease of `attempt` and tears down its context.
    ///
    /// Returns `false` when the attempt is no longer the live lease.
    pub async fn release(&self, story_id: &str, attempt: u64) -> SupervisorResult<bool> {
        let live = {
            let mut state = self.state.write().await;
            match state.live.get(story_id) {
                Some(live) if live.attempt == attempt => state.live.remove(story_id),
                _ => None,
            }
        };
        let Some(_live) = live else {
            return Ok(false);
        };

        self.drop_lease(story_id).await?;
        if !self.config.keep_workspaces {
            remove_workspace(&self.config.workspace_for(story_id)).await;
        }
        info!(story_id, attempt, "lease released");
        Ok(true)
    }

    /// Releases whatever lease the story holds, signalling its execution to
    /// stop. The workspace is kept for the resumed attempt.
    pub async fn force_release(&self, story_id: &str) -> SupervisorResult<Option<u64>> {
        let live = self.state.write().await.live.remove(story_id);
        let Some(live) = live else {
            return Ok(None);
        };
        let _ = live.cancel.send(true);
        if let Some(task) = &live.task {
            task.abort();
        }
        self.drop_lease(story_id).await?;
        warn!(story_id, attempt = live.attempt, worker_id = %live.worker_id, "lease force-released");
        Ok(Some(live.attempt))
    }

    /// Controlled stop of one story: the execution is cancelled and the
    /// lease released while the last checkpoint stays in place.
    pub async fn cancel(&self, story_id: &str) -> SupervisorResult<bool> {
        Ok(self.force_release(story_id).await?.is_some())
    }

    /// Cancels every live execution.
    pub async fn cancel_all(&self) -> SupervisorResult<()> {
        for story_id in self.in_flight().await {
            self.cancel(&story_id).await?;
        }
        Ok(())
    }

    async fn drop_lease(&self, story_id: &str) -> SupervisorResult<()> {
        self.watchdog.unregister(story_id).await;
        self.store.remove_lease(story_id).await?;
        Ok(())
    }
}

async fn remove_workspace(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
    }
}

/// Story ids become directory names.
fn sanitize(story_id: &str) -> String {
    story_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
