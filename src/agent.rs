//! Interface to the external code-generation agent.
//!
//! The supervisor never generates code itself; it hands one acceptance
//! criterion at a time to an [`AgentExecutor`] and turns the returned
//! [`CriterionReport`] into complexity signals.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::backlog::{AcceptanceCriterion, Story};
use crate::parallel::ExecutionContext;

pub const MARKER_TOUCHED: &str = "TOUCHED:";
pub const MARKER_ERROR: &str = "ERROR:";
pub const MARKER_CLARIFY: &str = "CLARIFY:";
pub const MARKER_HEARTBEAT: &str = "HEARTBEAT";

/// What the agent reported while working on one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionReport {
    pub touched_paths: Vec<String>,
    pub errors: Vec<String>,
    pub clarifications: Vec<String>,
}

impl CriterionReport {
    pub fn with_touched(mut self, path: impl Into<String>) -> Self {
        self.touched_paths.push(path.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }

    pub fn with_clarification(mut self, message: impl Into<String>) -> Self {
        self.clarifications.push(message.into());
        self
    }

    /// Applies one output line; returns true for a heartbeat marker.
    fn ingest_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line == MARKER_HEARTBEAT {
            return true;
        }
        if let Some(rest) = line.strip_prefix(MARKER_TOUCHED) {
            let path = rest.trim();
            if !path.is_empty() {
                self.touched_paths.push(path.to_string());
            }
        } else if let Some(rest) = line.strip_prefix(MARKER_ERROR) {
            self.errors.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(MARKER_CLARIFY) {
            self.clarifications.push(rest.trim().to_string());
        }
        false
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to start agent: {0}")]
    Spawn(#[from] std::io::Error),

    /// The agent ran but did not complete the step. The partial report
    /// still carries signals.
    #[error("agent exited with {status}: {message}")]
    Failed {
        status: String,
        message: String,
        report: CriterionReport,
    },

    /// The agent wrote stdout that could not be read as text lines.
    #[error("agent produced unreadable output: {message}")]
    Output {
        message: String,
        report: CriterionReport,
    },

    #[error("agent execution cancelled")]
    Cancelled,
}

impl AgentError {
    /// Signals gathered before the failure, if any.
    pub fn report(&self) -> Option<&CriterionReport> {
        match self {
            AgentError::Failed { report, .. } | AgentError::Output { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// The external agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Works on one acceptance criterion inside the execution context.
    async fn execute_criterion(
        &self,
        ctx: &ExecutionContext,
        story: &Story,
        criterion: &AcceptanceCriterion,
    ) -> Result<CriterionReport, AgentError>;

    /// Addresses gate diagnostics before the next fix cycle.
    async fn fix(
        &self,
        ctx: &ExecutionContext,
        story: &Story,
        diagnostics: &str,
    ) -> Result<CriterionReport, AgentError>;
}

/// Agent driven by a shell command.
///
/// The command runs in the workspace with `RALPH_STORY_ID`,
/// `RALPH_CRITERION_ID` and `RALPH_CRITERION` set. Marker lines on stdout
/// (`TOUCHED: <path>`, `ERROR: <msg>`, `CLARIFY: <msg>`, `HEARTBEAT`) feed
/// the report and the lease heartbeat.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    fix_command: Option<String>,
}

impl CommandAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fix_command: None,
        }
    }

    pub fn with_fix_command(mut self, command: impl Into<String>) -> Self {
        self.fix_command = Some(command.into());
        self
    }

    async fn run(
        &self,
        command: &str,
        ctx: &ExecutionContext,
        envs: &[(&str, &str)],
    ) -> Result<CriterionReport, AgentError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.workspace())
            .env("RALPH_STORY_ID", &ctx.story_id)
            .envs(envs.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut report = CriterionReport::default();
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if report.ingest_line(&line) {
                                ctx.pulse().await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = child.kill().await;
                            return Err(AgentError::Output {
                                message: e.to_string(),
                                report,
                            });
                        }
                    },
                    _ = ctx.cancelled() => {
                        let _ = child.kill().await;
                        return Err(AgentError::Cancelled);
                    }
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(AgentError::Cancelled);
            }
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        debug!(
            story_id = %ctx.story_id,
            status = %status,
            touched = report.touched_paths.len(),
            errors = report.errors.len(),
            "agent command finished"
        );

        if status.success() {
            Ok(report)
        } else {
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .or_else(|| report.errors.last().map(String::as_str))
                .unwrap_or("no output")
                .to_string();
            Err(AgentError::Failed {
                status: status.to_string(),
                message,
                report,
            })
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn execute_criterion(
        &self,
        ctx: &ExecutionContext,
        _story: &Story,
        criterion: &AcceptanceCriterion,
    ) -> Result<CriterionReport, AgentError> {
        self.run(
            &self.command,
            ctx,
            &[
                ("RALPH_CRITERION_ID", criterion.id.as_str()),
                ("RALPH_CRITERION", criterion.description.as_str()),
            ],
        )
        .await
    }

    async fn fix(
        &self,
        ctx: &ExecutionContext,
        _story: &Story,
        diagnostics: &str,
    ) -> Result<CriterionReport, AgentError> {
        let command = self.fix_command.as_deref().unwrap_or(&self.command);
        self.run(command, ctx, &[("RALPH_DIAGNOSTICS", diagnostics)])
            .await
    }
}
