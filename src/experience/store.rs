use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::episode::Episode;
use crate::lock::RUNTIME_DIR;

const EXPERIENCE_DIR_NAME: &str = "experience";
const EPISODES_FILE_NAME: &str = "episodes.jsonl";

/// Environment variable for episode retention period (days).
pub const RETENTION_ENV_VAR: &str = "RALPH_EXPERIENCE_RETENTION_DAYS";

/// Default retention period in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Errors that can occur during experience storage operations.
#[derive(Error, Debug)]
pub enum ExperienceError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Episodes must carry a domain tag.
    #[error("episode has an empty domain tag")]
    MissingDomain,
}

/// Result type for experience storage operations.
pub type ExperienceResult<T> = Result<T, ExperienceError>;

/// Episodes for one domain, newest first, produced on demand.
pub type EpisodeIter = Box<dyn Iterator<Item = Episode> + Send>;

/// Narrow interface to the long-term experience store.
#[async_trait]
pub trait ExperienceStore: Send + Sync {
    async fn record(&self, episode: Episode) -> ExperienceResult<()>;

    async fn query(&self, domain: &str) -> ExperienceResult<EpisodeIter>;
}

/// Configuration for the JSONL experience store.
#[derive(Debug, Clone)]
pub struct ExperienceConfig {
    /// Retention period in days (0 disables retention pruning).
    pub retention_days: u64,
}

impl ExperienceConfig {
    pub fn new(retention_days: u64) -> Self {
        Self { retention_days }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let retention_days = env::var(RETENTION_ENV_VAR)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self { retention_days }
    }
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Append-only episode log at `<base>/.ralph/experience/episodes.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlExperienceStore {
    root_dir: PathBuf,
    retention_days: u64,
}

impl JsonlExperienceStore {
    pub fn new(base_dir: impl Into<PathBuf>, config: ExperienceConfig) -> ExperienceResult<Self> {
        let root_dir = base_dir.into().join(RUNTIME_DIR).join(EXPERIENCE_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self {
            root_dir,
            retention_days: config.retention_days,
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn episodes_path(&self) -> PathBuf {
        self.root_dir.join(EPISODES_FILE_NAME)
    }

    /// Drops episodes older than the retention period. Returns how many
    /// were removed.
    pub fn enforce_retention(&self) -> ExperienceResult<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }
        let lines = match read_lines(&self.episodes_path())? {
            Some(lines) => lines,
            None => return Ok(0),
        };

        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut kept = Vec::with_capacity(lines.len());
        let mut removed = 0;
        for line in lines {
            match serde_json::from_str::<Episode>(&line) {
                Ok(episode) if episode.recorded_at < cutoff => removed += 1,
                _ => kept.push(line),
            }
        }
        if removed == 0 {
            return Ok(0);
        }

        let temp_path = self.root_dir.join(format!("{}.tmp", EPISODES_FILE_NAME));
        let mut file = fs::File::create(&temp_path)?;
        for line in &kept {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
        fs::rename(&temp_path, self.episodes_path())?;
        Ok(removed)
    }

    fn append(&self, episode: &Episode) -> ExperienceResult<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.episodes_path())?;
        let json = serde_json::to_string(episode)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;
        Ok(())
    }
}

#[async_trait]
impl ExperienceStore for JsonlExperienceStore {
    async fn record(&self, episode: Episode) -> ExperienceResult<()> {
        if episode.domain.trim().is_empty() {
            return Err(ExperienceError::MissingDomain);
        }
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append(&episode))
            .await
            .map_err(|e| ExperienceError::Io(io::Error::other(e.to_string())))??;
        debug!(path = %self.episodes_path().display(), "recorded episode");
        Ok(())
    }

    async fn query(&self, domain: &str) -> ExperienceResult<EpisodeIter> {
        let path = self.episodes_path();
        let lines = tokio::task::spawn_blocking(move || read_lines(&path))
            .await
            .map_err(|e| ExperienceError::Io(io::Error::other(e.to_string())))??
            .unwrap_or_default();
        let domain = domain.to_string();
        Ok(Box::new(
            lines
                .into_iter()
                .rev()
                .filter_map(|line| serde_json::from_str::<Episode>(&line).ok())
                .filter(move |episode| episode.domain == domain),
        ))
    }
}

fn read_lines(path: &Path) -> ExperienceResult<Option<Vec<String>>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ExperienceError::Io(err)),
    };
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(Some(lines))
}

/// Experience store kept in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryExperienceStore {
    episodes: Mutex<Vec<Episode>>,
}

impl InMemoryExperienceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.episodes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.episodes.lock().await.is_empty()
    }

    pub async fn episodes(&self) -> Vec<Episode> {
        self.episodes.lock().await.clone()
    }
}

#[async_trait]
impl ExperienceStore for InMemoryExperienceStore {
    async fn record(&self, episode: Episode) -> ExperienceResult<()> {
        if episode.domain.trim().is_empty() {
            return Err(ExperienceError::MissingDomain);
        }
        self.episodes.lock().await.push(episode);
        Ok(())
    }

    async fn query(&self, domain: &str) -> ExperienceResult<EpisodeIter> {
        let matching: Vec<Episode> = self
            .episodes
            .lock()
            .await
            .iter()
            .rev()
            .filter(|e| e.domain == domain)
            .cloned()
            .collect();
        Ok(Box::new(matching.into_iter()))
    }
}
