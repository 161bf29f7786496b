//! File and environment settings.
//!
//! Settings come from an optional TOML file (`ralph.toml` in the working
//! directory unless a path is given) and are then overridden by `RALPH_*`
//! environment variables, with `__` separating nested keys:
//!
//! ```text
//! RALPH_WORKERS__MAX_WORKERS=3
//! RALPH_COMPLEXITY__THRESHOLD=6.5
//! ```
//!
//! [`SupervisorSettings`] is the file format; the runtime configs of each
//! component are derived from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::agent::CommandAgent;
use crate::complexity::ComplexityConfig;
use crate::error::{SupervisorError, SupervisorResult};
use crate::parallel::CoordinatorConfig;
use crate::quality::{CommandGate, GateSpec, PipelineConfig, QualityGate};
use crate::split::SplitConfig;
use crate::supervisor::SupervisorConfig;
use crate::timeout::TimeoutConfig;

/// Settings file looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "ralph.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RALPH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Backlog file to supervise
    pub backlog: PathBuf,
    pub agent: AgentSettings,
    pub workers: WorkerSettings,
    pub timeouts: TimeoutSettings,
    pub complexity: ComplexitySettings,
    pub split: SplitSettings,
    pub quality: QualitySettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backlog: PathBuf::from("prd.json"),
            agent: AgentSettings::default(),
            workers: WorkerSettings::default(),
            timeouts: TimeoutSettings::default(),
            complexity: ComplexitySettings::default(),
            split: SplitSettings::default(),
            quality: QualitySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Shell command run once per acceptance criterion
    pub command: String,

    /// Shell command run with gate diagnostics between fix cycles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_command: Option<String>,

    /// The agent prints `HEARTBEAT` lines itself
    pub heartbeats: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude --print \"$RALPH_CRITERION\"".to_string(),
            fix_command: None,
            heartbeats: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
    pub keep_workspaces: bool,
    pub crash_retry_budget: u32,
    pub max_criterion_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 1,
            keep_workspaces: false,
            crash_retry_budget: 2,
            max_criterion_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub criterion_timeout_secs: u64,
    pub gate_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub startup_grace_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let defaults = TimeoutConfig::default();
        Self {
            criterion_timeout_secs: defaults.criterion_timeout.as_secs(),
            gate_timeout_secs: defaults.gate_timeout.as_secs(),
            heartbeat_interval_secs: defaults.heartbeat_interval.as_secs(),
            missed_heartbeats: defaults.missed_heartbeats_threshold,
            startup_grace_secs: defaults.startup_grace_period.as_secs(),
        }
    }
}

impl From<&TimeoutSettings> for TimeoutConfig {
    fn from(settings: &TimeoutSettings) -> Self {
        TimeoutConfig::new()
            .with_criterion_timeout(Duration::from_secs(settings.criterion_timeout_secs))
            .with_gate_timeout(Duration::from_secs(settings.gate_timeout_secs))
            .with_heartbeat_interval(Duration::from_secs(settings.heartbeat_interval_secs))
            .with_missed_heartbeats_threshold(settings.missed_heartbeats)
            .with_startup_grace_period(Duration::from_secs(settings.startup_grace_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexitySettings {
    pub threshold: f64,
    pub time_overrun_saturation: f64,
    pub scope_saturation: f64,
    pub error_saturation: f64,
    pub clarification_saturation: f64,
}

impl Default for ComplexitySettings {
    fn default() -> Self {
        let defaults = ComplexityConfig::default();
        Self {
            threshold: defaults.threshold,
            time_overrun_saturation: defaults.time_overrun_saturation,
            scope_saturation: defaults.scope_saturation,
            error_saturation: defaults.error_saturation,
            clarification_saturation: defaults.clarification_saturation,
        }
    }
}

impl From<&ComplexitySettings> for ComplexityConfig {
    fn from(settings: &ComplexitySettings) -> Self {
        ComplexityConfig::new()
            .with_threshold(settings.threshold)
            .with_time_overrun_saturation(settings.time_overrun_saturation)
            .with_scope_saturation(settings.scope_saturation)
            .with_error_saturation(settings.error_saturation)
            .with_clarification_saturation(settings.clarification_saturation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitSettings {
    pub auto_approve: bool,
    pub max_criteria_per_child: usize,
    pub max_children: usize,
}

impl Default for SplitSettings {
    fn default() -> Self {
        let defaults = SplitConfig::default();
        Self {
            auto_approve: defaults.auto_approve,
            max_criteria_per_child: defaults.max_criteria_per_child,
            max_children: defaults.max_children,
        }
    }
}

impl From<&SplitSettings> for SplitConfig {
    fn from(settings: &SplitSettings) -> Self {
        SplitConfig::new()
            .with_auto_approve(settings.auto_approve)
            .with_max_criteria_per_child(settings.max_criteria_per_child)
            .with_max_children(settings.max_children)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySettings {
    /// Attempts per gate unless the gate sets its own
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fix cycles after a terminal rejection (0 = the story fails at once)
    pub max_fix_cycles: u32,
    /// Gates in execution order
    pub gates: Vec<GateSettings>,
}

impl Default for QualitySettings {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: defaults.initial_backoff_ms,
            max_backoff_ms: defaults.max_backoff_ms,
            max_fix_cycles: 0,
            gates: vec![
                GateSettings {
                    name: "build".to_string(),
                    command: "cargo build".to_string(),
                    idempotent_safe: true,
                    max_attempts: None,
                    timeout_secs: None,
                },
                GateSettings {
                    name: "tests".to_string(),
                    command: "cargo test".to_string(),
                    idempotent_safe: true,
                    max_attempts: None,
                    timeout_secs: None,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSettings {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub idempotent_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl From<&GateSettings> for GateSpec {
    fn from(settings: &GateSettings) -> Self {
        GateSpec {
            name: settings.name.clone(),
            command: settings.command.clone(),
            idempotent_safe: settings.idempotent_safe,
            max_attempts: settings.max_attempts,
            timeout_secs: settings.timeout_secs,
        }
    }
}

impl SupervisorSettings {
    /// Loads `path` (required) or `ralph.toml` (optional), then applies
    /// `RALPH_*` environment overrides.
    pub fn load(path: Option<&Path>) -> SupervisorResult<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> SupervisorResult<Self> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::from(Path::new(DEFAULT_SETTINGS_FILE))
                .format(FileFormat::Toml)
                .required(false),
        };
        let settings: SupervisorSettings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if self.agent.command.trim().is_empty() {
            return Err(SupervisorError::Config("agent.command is empty".to_string()));
        }
        if self.workers.max_workers == 0 {
            return Err(SupervisorError::Config(
                "workers.max_workers must be at least 1".to_string(),
            ));
        }
        if !(self.complexity.threshold > 0.0 && self.complexity.threshold <= 10.0) {
            return Err(SupervisorError::Config(format!(
                "complexity.threshold must be in (0, 10], got {}",
                self.complexity.threshold
            )));
        }
        if self.split.max_criteria_per_child == 0 || self.split.max_children < 2 {
            return Err(SupervisorError::Config(
                "split needs max_criteria_per_child >= 1 and max_children >= 2".to_string(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for gate in &self.quality.gates {
            if !names.insert(gate.name.as_str()) {
                return Err(SupervisorError::Config(format!(
                    "duplicate gate name '{}'",
                    gate.name
                )));
            }
        }
        Ok(())
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> SupervisorResult<String> {
        toml::to_string_pretty(self).map_err(|e| SupervisorError::Config(e.to_string()))
    }

    /// Runtime configuration for `backlog`, or the configured backlog.
    pub fn supervisor_config(&self, backlog: Option<PathBuf>) -> SupervisorConfig {
        let backlog = backlog.unwrap_or_else(|| self.backlog.clone());
        let base = SupervisorConfig::new(&backlog);
        let coordinator = CoordinatorConfig::new()
            .with_work_root(base.coordinator.work_root.clone())
            .with_max_workers(self.workers.max_workers)
            .with_keep_workspaces(self.workers.keep_workspaces);

        base.with_coordinator(coordinator)
            .with_max_fix_cycles(self.quality.max_fix_cycles)
            .with_crash_retry_budget(self.workers.crash_retry_budget)
            .with_max_criterion_attempts(self.workers.max_criterion_attempts)
            .with_agent_heartbeats(self.agent.heartbeats)
            .with_timeouts((&self.timeouts).into())
            .with_complexity((&self.complexity).into())
            .with_split((&self.split).into())
            .with_pipeline(
                PipelineConfig::new()
                    .with_max_attempts(self.quality.max_attempts)
                    .with_backoff(self.quality.initial_backoff_ms, self.quality.max_backoff_ms)
                    .with_gate_timeout(Duration::from_secs(self.timeouts.gate_timeout_secs)),
            )
    }

    pub fn gates(&self) -> Vec<Arc<dyn QualityGate>> {
        self.quality
            .gates
            .iter()
            .map(|gate| Arc::new(CommandGate::new(gate.into())) as Arc<dyn QualityGate>)
            .collect()
    }

    pub fn agent(&self) -> CommandAgent {
        let agent = CommandAgent::new(self.agent.command.clone());
        match &self.agent.fix_command {
            Some(fix) => agent.with_fix_command(fix.clone()),
            None => agent,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        let result = SupervisorSettings::load_with_env(Some(&missing), env(&[]));
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = SupervisorSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.workers.max_workers, 1);
        assert_eq!(settings.quality.max_fix_cycles, 0);
        assert_eq!(settings.complexity.threshold, 7.0);
    }

    #[test]
    fn test_file_then_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ralph.toml");
        std::fs::write(
            &path,
            r#"
backlog = "work/prd.json"

[workers]
max_workers = 2

[complexity]
threshold = 6.0

[[quality.gates]]
name = "lint"
command = "cargo clippy"
idempotent_safe = true
max_attempts = 1
"#,
        )
        .unwrap();

        let settings = SupervisorSettings::load_with_env(
            Some(&path),
            env(&[("RALPH_WORKERS__MAX_WORKERS", "3")]),
        )
        .unwrap();
        assert_eq!(settings.workers.max_workers, 3);
        assert_eq!(settings.complexity.threshold, 6.0);
        assert_eq!(settings.backlog, PathBuf::from("work/prd.json"));
        assert_eq!(settings.quality.gates.len(), 1);
        assert_eq!(settings.quality.gates[0].max_attempts, Some(1));
        // Untouched sections keep their defaults.
        assert_eq!(settings.workers.crash_retry_budget, 2);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ralph.toml");
        std::fs::write(&path, "[complexity]\nthreshold = 12.0\n").unwrap();
        let result = SupervisorSettings::load_with_env(Some(&path), env(&[]));
        assert!(matches!(result, Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_duplicate_gate_names_rejected() {
        let mut settings = SupervisorSettings::default();
        let gate = settings.quality.gates[0].clone();
        settings.quality.gates.push(gate);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let rendered = SupervisorSettings::default().to_toml().unwrap();
        assert!(rendered.contains("[workers]"));
        let parsed: SupervisorSettings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, SupervisorSettings::default());
    }

    #[test]
    fn test_runtime_config_conversion() {
        let mut settings = SupervisorSettings::default();
        settings.workers.max_workers = 4;
        settings.quality.max_fix_cycles = 2;
        settings.timeouts.gate_timeout_secs = 30;
        settings.split.auto_approve = false;

        let config = settings.supervisor_config(Some(PathBuf::from("/tmp/work/prd.json")));
        assert_eq!(config.backlog_path, PathBuf::from("/tmp/work/prd.json"));
        assert_eq!(config.coordinator.max_workers, 4);
        assert_eq!(config.coordinator.work_root, PathBuf::from("/tmp/work"));
        assert_eq!(config.max_fix_cycles, 2);
        assert_eq!(config.timeouts.gate_timeout, Duration::from_secs(30));
        assert_eq!(config.pipeline.gate_timeout_secs, 30);
        assert!(!config.split.auto_approve);
        assert_eq!(settings.gates().len(), 2);
    }
}
