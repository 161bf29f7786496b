//! Shared fixtures: on-disk backlogs, a scripted agent and scripted gates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use ralph_supervisor::agent::{AgentError, AgentExecutor, CriterionReport};
use ralph_supervisor::backlog::{parse_backlog, AcceptanceCriterion, Backlog, Story};
use ralph_supervisor::experience::InMemoryExperienceStore;
use ralph_supervisor::parallel::ExecutionContext;
use ralph_supervisor::quality::{GateContext, GateReport, QualityGate};
use ralph_supervisor::supervisor::{Supervisor, SupervisorConfig};
use ralph_supervisor::timeout::TimeoutConfig;

pub fn story(id: &str, criteria: usize) -> Story {
    Story::new(id, format!("Story {}", id)).with_criteria(
        (1..=criteria)
            .map(|n| AcceptanceCriterion::new(format!("{}-AC{}", id, n), format!("step {}", n), 60))
            .collect(),
    )
}

/// Writes a backlog into a fresh temp dir and returns both.
pub fn write_backlog(stories: Vec<Story>) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("prd.json");
    save_backlog(&path, &Backlog::new("Fixture", stories));
    (dir, path)
}

pub fn save_backlog(path: &Path, backlog: &Backlog) {
    std::fs::write(path, serde_json::to_string_pretty(backlog).unwrap()).unwrap();
}

pub fn load_backlog(path: &Path) -> Backlog {
    parse_backlog(&std::fs::read_to_string(path).unwrap()).unwrap()
}

/// Short timeouts so watchdog behaviour shows up within a test.
pub fn fast_config(path: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(path).with_timeouts(
        TimeoutConfig::new()
            .with_criterion_timeout(Duration::from_secs(10))
            .with_gate_timeout(Duration::from_secs(10))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_missed_heartbeats_threshold(4)
            .with_startup_grace_period(Duration::ZERO),
    );
    config.pipeline = config.pipeline.clone().with_backoff(1, 5);
    config
}

pub fn build_supervisor(
    config: SupervisorConfig,
    agent: Arc<ScriptedAgent>,
) -> (Supervisor, Arc<InMemoryExperienceStore>) {
    let episodes = Arc::new(InMemoryExperienceStore::new());
    let supervisor = Supervisor::new(config, agent).with_experience_store(episodes.clone());
    (supervisor, episodes)
}

/// What the scripted agent does for one call.
#[derive(Debug, Clone)]
pub enum Action {
    Complete(CriterionReport),
    Fail(CriterionReport),
    Panic,
    /// Never returns and never pulses.
    Hang,
}

type Script = dyn Fn(&str, u32) -> Action + Send + Sync;

/// Agent whose behaviour per criterion id and call number (from 1) is
/// scripted by the test.
pub struct ScriptedAgent {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
    fixes: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(script: impl Fn(&str, u32) -> Action + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            fixes: AtomicU32::new(0),
        })
    }

    /// Completes every criterion without signals.
    pub fn completing() -> Arc<Self> {
        Self::new(|_, _| Action::Complete(CriterionReport::default()))
    }

    /// Criterion ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fixes(&self) -> u32 {
        self.fixes.load(Ordering::SeqCst)
    }

    fn call_number(&self, criterion_id: &str) -> u32 {
        let mut calls = self.calls.lock().unwrap();
        calls.push(criterion_id.to_string());
        calls.iter().filter(|c| c.as_str() == criterion_id).count() as u32
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute_criterion(
        &self,
        _ctx: &ExecutionContext,
        _story: &Story,
        criterion: &AcceptanceCriterion,
    ) -> Result<CriterionReport, AgentError> {
        let call = self.call_number(&criterion.id);
        match (self.script)(&criterion.id, call) {
            Action::Complete(report) => Ok(report),
            Action::Fail(report) => Err(AgentError::Failed {
                status: "exit status: 1".to_string(),
                message: format!("scripted failure of {}", criterion.id),
                report,
            }),
            Action::Panic => panic!("scripted panic in {}", criterion.id),
            Action::Hang => {
                std::future::pending::<()>().await;
                Err(AgentError::Cancelled)
            }
        }
    }

    async fn fix(
        &self,
        _ctx: &ExecutionContext,
        _story: &Story,
        _diagnostics: &str,
    ) -> Result<CriterionReport, AgentError> {
        self.fixes.fetch_add(1, Ordering::SeqCst);
        Ok(CriterionReport::default())
    }
}

/// Gate that answers from a per-story list of outcomes; the last entry
/// repeats. Every run is counted per story.
pub struct ScriptedGate {
    name: String,
    idempotent_safe: bool,
    outcomes: HashMap<String, Vec<GateReport>>,
    default: GateReport,
    hang: bool,
    runs: Mutex<HashMap<String, u32>>,
}

impl ScriptedGate {
    pub fn passing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            idempotent_safe: false,
            outcomes: HashMap::new(),
            default: GateReport::pass("ok"),
            hang: false,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// A gate that never finishes; only cancellation ends its run.
    pub fn hanging(name: &str) -> Self {
        Self {
            hang: true,
            ..Self::passing(name)
        }
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent_safe = true;
        self
    }

    pub fn with_outcomes(mut self, story_id: &str, outcomes: Vec<GateReport>) -> Self {
        self.outcomes.insert(story_id.to_string(), outcomes);
        self
    }

    pub fn runs(&self, story_id: &str) -> u32 {
        self.runs
            .lock()
            .unwrap()
            .get(story_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl QualityGate for ScriptedGate {
    fn name(&self) -> &str {
        &self.name
    }

    fn idempotent_safe(&self) -> bool {
        self.idempotent_safe
    }

    async fn run(&self, ctx: &GateContext) -> GateReport {
        let run = {
            let mut runs = self.runs.lock().unwrap();
            let count = runs.entry(ctx.story_id.clone()).or_insert(0);
            *count += 1;
            *count as usize
        };
        if self.hang {
            std::future::pending::<()>().await;
        }
        match self.outcomes.get(&ctx.story_id) {
            Some(outcomes) if !outcomes.is_empty() => {
                outcomes[(run - 1).min(outcomes.len() - 1)].clone()
            }
            _ => self.default.clone(),
        }
    }
}
