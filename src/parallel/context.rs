//! Isolated execution context handed to the agent and the gates.

use std::path::{Path, PathBuf};

use tokio::sync::watch;

use crate::timeout::HeartbeatHandle;

/// Everything a worker needs to execute one leased story.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub story_id: String,
    pub worker_id: String,
    /// Lease attempt this context belongs to.
    pub attempt: u64,
    workspace: PathBuf,
    heartbeat: HeartbeatHandle,
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(
        story_id: impl Into<String>,
        worker_id: impl Into<String>,
        attempt: u64,
        workspace: PathBuf,
        heartbeat: HeartbeatHandle,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            worker_id: worker_id.into(),
            attempt,
            workspace,
            heartbeat,
            cancel,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Reports liveness for the lease.
    pub async fn pulse(&self) {
        self.heartbeat.pulse().await;
    }

    pub fn heartbeat(&self) -> &HeartbeatHandle {
        &self.heartbeat
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the execution is cancelled. Never resolves if the
    /// coordinator goes away without cancelling.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
