//! Quality gates: the capability interface and the external-command gate.
//!
//! A gate is a black box that inspects a story's execution context and
//! answers pass, fail or error with diagnostic text. Gates are held in an
//! ordered collection by the pipeline; [`CommandGate`] is the implementation
//! used for configured shell commands.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::backlog::{GateAttempt, GateOutcome};

/// Maximum number of diagnostic bytes kept from a gate's output.
const MAX_DIAGNOSTIC_BYTES: usize = 4000;

/// What a gate sees when it runs.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub story_id: String,
    /// Workspace of the story's execution context.
    pub workspace: PathBuf,
    /// Time allowed for one attempt.
    pub timeout: Duration,
}

/// Result of one gate attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub outcome: GateOutcome,
    pub diagnostics: String,
}

impl GateReport {
    pub fn pass(diagnostics: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Pass,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn fail(diagnostics: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Fail,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn error(diagnostics: impl Into<String>) -> Self {
        Self {
            outcome: GateOutcome::Error,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Pass
    }
}

/// An external pass/fail check.
#[async_trait]
pub trait QualityGate: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a `fail` may be retried because re-running the gate has no
    /// side effects.
    fn idempotent_safe(&self) -> bool {
        false
    }

    /// Per-gate attempt limit; the pipeline default applies when `None`.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Per-gate attempt timeout; the pipeline default applies when `None`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &GateContext) -> GateReport;
}

/// Configuration record of one gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateSpec {
    pub name: String,
    /// Shell command, run with `sh -c` in the story's workspace.
    pub command: String,
    #[serde(default)]
    pub idempotent_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl GateSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            idempotent_safe: false,
            max_attempts: None,
            timeout_secs: None,
        }
    }

    pub fn with_idempotent_safe(mut self, safe: bool) -> Self {
        self.idempotent_safe = safe;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Gate backed by an external shell command.
///
/// Exit status 0 is a pass, any other status a fail; a command that cannot
/// be spawned is an error.
#[derive(Debug, Clone)]
pub struct CommandGate {
    spec: GateSpec,
}

impl CommandGate {
    pub fn new(spec: GateSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &GateSpec {
        &self.spec
    }
}

impl From<GateSpec> for CommandGate {
    fn from(spec: GateSpec) -> Self {
        Self::new(spec)
    }
}

#[async_trait]
impl QualityGate for CommandGate {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn idempotent_safe(&self) -> bool {
        self.spec.idempotent_safe
    }

    fn max_attempts(&self) -> Option<u32> {
        self.spec.max_attempts
    }

    fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_secs.map(Duration::from_secs)
    }

    async fn run(&self, ctx: &GateContext) -> GateReport {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.spec.command)
            .current_dir(&ctx.workspace)
            .env("RALPH_STORY_ID", &ctx.story_id)
            .env("RALPH_GATE", &self.spec.name)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                let diagnostics = truncate_tail(&text, MAX_DIAGNOSTIC_BYTES);
                if output.status.success() {
                    GateReport::pass(diagnostics)
                } else {
                    let code = output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string());
                    GateReport::fail(format!("exit status {}\n{}", code, diagnostics))
                }
            }
            Err(e) => GateReport::error(format!(
                "failed to run `{}`: {}",
                self.spec.command, e
            )),
        }
    }
}

/// Keeps the last `max` bytes of `text` on a char boundary.
fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Progress state for a quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateProgressState {
    /// Gate is currently running
    Running,
    /// Gate completed successfully
    Passed,
    /// Gate failed or could not run
    Failed,
    /// Gate already passed in this cycle before a resume
    Skipped,
}

/// Progress update for a quality gate attempt.
#[derive(Debug, Clone)]
pub struct GateProgressUpdate {
    pub story_id: String,
    /// Name of the quality gate
    pub gate_name: String,
    pub attempt: u32,
    /// Current progress state
    pub state: GateProgressState,
    /// Duration of the attempt (only set for Passed/Failed states)
    pub duration: Option<Duration>,
}

impl GateProgressUpdate {
    pub fn running(story_id: &str, gate_name: &str, attempt: u32) -> Self {
        Self::new(story_id, gate_name, attempt, GateProgressState::Running, None)
    }

    pub fn passed(story_id: &str, gate_name: &str, attempt: u32, duration: Duration) -> Self {
        Self::new(
            story_id,
            gate_name,
            attempt,
            GateProgressState::Passed,
            Some(duration),
        )
    }

    pub fn failed(story_id: &str, gate_name: &str, attempt: u32, duration: Duration) -> Self {
        Self::new(
            story_id,
            gate_name,
            attempt,
            GateProgressState::Failed,
            Some(duration),
        )
    }

    pub fn skipped(story_id: &str, gate_name: &str) -> Self {
        Self::new(story_id, gate_name, 0, GateProgressState::Skipped, None)
    }

    fn new(
        story_id: &str,
        gate_name: &str,
        attempt: u32,
        state: GateProgressState,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            story_id: story_id.to_string(),
            gate_name: gate_name.to_string(),
            attempt,
            state,
            duration,
        }
    }

    /// Check if the gate has completed (Passed or Failed).
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state,
            GateProgressState::Passed | GateProgressState::Failed
        )
    }

    /// Format the duration for display, if available.
    pub fn format_duration(&self) -> Option<String> {
        self.duration.map(|d| {
            if d.as_secs() >= 60 {
                format!(
                    "{}m{:.1}s",
                    d.as_secs() / 60,
                    (d.as_millis() % 60000) as f64 / 1000.0
                )
            } else {
                format!("{:.1}s", d.as_secs_f64())
            }
        })
    }
}

/// One-line summary of the latest attempt per gate.
pub fn summary(attempts: &[GateAttempt]) -> String {
    let mut latest: Vec<&GateAttempt> = Vec::new();
    for attempt in attempts {
        match latest.iter_mut().find(|a| a.gate_name == attempt.gate_name) {
            Some(slot) => *slot = attempt,
            None => latest.push(attempt),
        }
    }
    let total = latest.len();
    let passed = latest
        .iter()
        .filter(|a| a.outcome == GateOutcome::Pass)
        .count();
    let failed: Vec<&str> = latest
        .iter()
        .filter(|a| a.outcome != GateOutcome::Pass)
        .map(|a| a.gate_name.as_str())
        .collect();

    if total == 0 {
        "no gates run".to_string()
    } else if failed.is_empty() {
        format!("All {total} gates passed")
    } else {
        format!(
            "{passed}/{total} gates passed. Failed: {}",
            failed.join(", ")
        )
    }
}
