//! Backlog-level process lock.
//!
//! At most one live supervisor may drive a backlog. The lock is a JSON file
//! in the runtime directory next to the backlog, named after the backlog
//! file. It is written to a private staging file first and published with a
//! hard link, so it appears complete and two processes can never both
//! publish. A lock whose owning process is gone is stale and is taken over,
//! but only while holding the takeover marker: the marker is the only way a
//! foreign lock file is ever removed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Directory (next to the backlog) holding supervisor runtime files.
pub const RUNTIME_DIR: &str = ".ralph";
pub const LOCK_EXTENSION: &str = "lock";
const TAKEOVER_EXTENSION: &str = "takeover";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("backlog is locked by live process {pid} since {since}")]
    Conflict { pid: u32, since: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type LockResult<T> = Result<T, LockError>;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    /// Token unique to one acquisition, so a guard never deletes a lock it
    /// does not own.
    pub instance: String,
    pub backlog: PathBuf,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn conflict(&self) -> LockError {
        LockError::Conflict {
            pid: self.pid,
            since: self.acquired_at.to_rfc3339(),
        }
    }
}

/// Acquires and inspects the lock for one backlog.
#[derive(Debug, Clone)]
pub struct LockManager {
    backlog_path: PathBuf,
    lock_path: PathBuf,
}

impl LockManager {
    pub fn new(backlog_path: impl Into<PathBuf>) -> Self {
        let backlog_path = backlog_path.into();
        let lock_path = lock_path_for(&backlog_path);
        Self {
            backlog_path,
            lock_path,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Takes the lock or fails with [`LockError::Conflict`] when a live
    /// process holds it. Never touches the backlog itself.
    pub async fn acquire(&self) -> LockResult<LockGuard> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.acquire_blocking())
            .await
            .map_err(|e| LockError::Io(io::Error::other(e.to_string())))?
    }

    fn acquire_blocking(&self) -> LockResult<LockGuard> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            instance: new_instance_token(),
            backlog: self.backlog_path.clone(),
            acquired_at: Utc::now(),
        };

        let staged = self.lock_path.with_extension(format!("{}.tmp", info.instance));
        write_synced(&staged, &info)?;
        let result = self.publish_or_take_over(&staged);
        if let Err(e) = fs::remove_file(&staged) {
            warn!(path = %staged.display(), error = %e, "failed to remove staged lock");
        }
        result?;

        info!(
            path = %self.lock_path.display(),
            pid = info.pid,
            "acquired supervisor lock"
        );
        Ok(LockGuard {
            path: self.lock_path.clone(),
            instance: info.instance,
            released: false,
        })
    }

    fn publish_or_take_over(&self, staged: &Path) -> LockResult<()> {
        match publish(staged, &self.lock_path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(holder) = self.live_holder()? {
            return Err(holder.conflict());
        }

        let _marker = TakeoverMarker::acquire(self.lock_path.with_extension(format!(
            "{}.{}",
            LOCK_EXTENSION, TAKEOVER_EXTENSION
        )))?;
        // Under the marker nobody else unlinks the lock, and publishing
        // never overwrites, so the holder read here is the one removed.
        if let Some(holder) = self.live_holder()? {
            return Err(holder.conflict());
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match publish(staged, &self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(read_lock(&self.lock_path)?.conflict())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The lock's holder if that process is alive. Stale, missing and
    /// unreadable locks all yield `None`.
    fn live_holder(&self) -> LockResult<Option<LockInfo>> {
        match read_lock(&self.lock_path) {
            Ok(holder) if is_process_alive(holder.pid) => Ok(Some(holder)),
            Ok(holder) => {
                warn!(
                    pid = holder.pid,
                    since = %holder.acquired_at,
                    "supervisor lock is stale"
                );
                Ok(None)
            }
            Err(LockError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(LockError::Io(e)) => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "supervisor lock is unreadable");
                Ok(None)
            }
        }
    }

    /// Current holder, if any. A stale lock is still reported.
    pub fn holder(&self) -> LockResult<Option<LockInfo>> {
        match read_lock(&self.lock_path) {
            Ok(info) => Ok(Some(info)),
            Err(LockError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Held for the supervisor's whole run; the lock file is removed on release
/// or drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    instance: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> LockResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> LockResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_lock(&self.path) {
            Ok(info) if info.instance == self.instance => {
                fs::remove_file(&self.path)?;
                info!(path = %self.path.display(), "released supervisor lock");
                Ok(())
            }
            Ok(info) => {
                warn!(
                    pid = info.pid,
                    "supervisor lock was taken over by another instance; leaving it"
                );
                Ok(())
            }
            Err(LockError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(error = %e, "failed to release supervisor lock");
        }
    }
}

/// Exclusive right to remove a stale lock, held for the few operations of
/// a takeover. Removed on drop.
struct TakeoverMarker {
    path: PathBuf,
}

impl TakeoverMarker {
    fn acquire(path: PathBuf) -> LockResult<Self> {
        let mut cleared = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let owner = fs::read_to_string(&path)
                .ok()
                .and_then(|pid| pid.trim().parse::<u32>().ok());
            match owner {
                // A dead owner crashed mid-takeover; clear it once.
                Some(pid) if !cleared && !is_process_alive(pid) => {
                    warn!(pid, "removing abandoned lock takeover marker");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    cleared = true;
                }
                owner => {
                    return Err(LockError::Conflict {
                        pid: owner.unwrap_or_default(),
                        since: "a stale lock takeover".to_string(),
                    })
                }
            }
        }
    }
}

impl Drop for TakeoverMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock takeover marker");
        }
    }
}

/// `<backlog-dir>/.ralph/<backlog-file-name>.lock`
pub fn lock_path_for(backlog_path: &Path) -> PathBuf {
    let dir = backlog_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = backlog_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backlog".to_string());
    dir.join(RUNTIME_DIR)
        .join(format!("{}.{}", name, LOCK_EXTENSION))
}

fn write_synced(path: &Path, info: &LockInfo) -> LockResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&serde_json::to_vec_pretty(info)?)?;
    file.sync_all()?;
    Ok(())
}

/// Links the complete staged file into place; fails if a lock exists.
fn publish(staged: &Path, lock_path: &Path) -> io::Result<()> {
    fs::hard_link(staged, lock_path)
}

fn read_lock(path: &Path) -> LockResult<LockInfo> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn new_instance_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(
        "{}-{:x}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Whether a process with the given pid currently exists.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(error = %e, "liveness probe failed; assuming holder is alive");
            true
        }
    }
}
