//! Lease watchdog for crash detection.
//!
//! Every live lease is registered with the watchdog and pulsed by its worker
//! (and, through the execution context, by the agent). A background task
//! periodically checks elapsed time since each lease's last pulse and sends
//! events through a channel when pulses stop arriving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::TimeoutConfig;

/// Events emitted by the lease watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Heartbeats are being missed but the grace period has not run out.
    Warning {
        story_id: String,
        /// Number of missed heartbeats.
        missed: u32,
        /// Elapsed seconds since last heartbeat.
        elapsed_secs: u64,
        /// Seconds until the lease is treated as crashed.
        remaining_secs: u64,
    },
    /// The grace period ran out: the worker is considered crashed.
    StallDetected {
        story_id: String,
        /// Lease attempt the stall applies to.
        attempt: u64,
        missed: u32,
        elapsed_secs: u64,
        /// Grace period in seconds that was exceeded.
        threshold_secs: u64,
    },
}

impl HeartbeatEvent {
    pub fn story_id(&self) -> &str {
        match self {
            HeartbeatEvent::Warning { story_id, .. }
            | HeartbeatEvent::StallDetected { story_id, .. } => story_id,
        }
    }
}

#[derive(Debug)]
struct HeartbeatEntry {
    attempt: u64,
    registered_at: Instant,
    last: Instant,
    last_warning_sent: Option<u32>,
    stalled: bool,
}

type HeartbeatTable = Arc<Mutex<HashMap<String, HeartbeatEntry>>>;

/// Cloneable handle used by a worker or agent to pulse one lease.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    story_id: String,
    table: HeartbeatTable,
}

impl HeartbeatHandle {
    /// Records a heartbeat pulse for the lease.
    pub async fn pulse(&self) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get_mut(&self.story_id) {
            entry.last = Instant::now();
            entry.last_warning_sent = None;
        }
    }

    pub fn story_id(&self) -> &str {
        &self.story_id
    }
}

/// Heartbeat watchdog over all live leases.
///
/// A stalled lease is reported exactly once; the supervisor then
/// force-releases it, which unregisters the entry.
pub struct LeaseWatchdog {
    config: TimeoutConfig,
    table: HeartbeatTable,
    sender: mpsc::Sender<HeartbeatEvent>,
    stop_flag: Arc<AtomicBool>,
    task_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LeaseWatchdog {
    /// Creates a new watchdog and the receiver for its events.
    pub fn new(config: TimeoutConfig) -> (Self, mpsc::Receiver<HeartbeatEvent>) {
        let (sender, receiver) = mpsc::channel(64);

        let watchdog = Self {
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
            sender,
            stop_flag: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(Mutex::new(None)),
        };

        (watchdog, receiver)
    }

    /// Starts tracking a lease. Re-registering replaces the previous attempt.
    pub async fn register(&self, story_id: &str, attempt: u64) -> HeartbeatHandle {
        let now = Instant::now();
        let mut table = self.table.lock().await;
        table.insert(
            story_id.to_string(),
            HeartbeatEntry {
                attempt,
                registered_at: now,
                last: now,
                last_warning_sent: None,
                stalled: false,
            },
        );
        HeartbeatHandle {
            story_id: story_id.to_string(),
            table: Arc::clone(&self.table),
        }
    }

    /// Stops tracking a lease.
    pub async fn unregister(&self, story_id: &str) {
        self.table.lock().await.remove(story_id);
    }

    pub async fn pulse(&self, story_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get_mut(story_id) {
            entry.last = Instant::now();
            entry.last_warning_sent = None;
        }
    }

    /// Evaluates every registered lease once and returns the resulting events.
    pub async fn check_now(&self) -> Vec<HeartbeatEvent> {
        check_table(&self.table, &self.config).await
    }

    /// Starts the background monitoring task.
    ///
    /// Every `heartbeat_interval` the task evaluates all leases and forwards
    /// warnings and stall detections to the event channel. It runs until
    /// `stop()` is called.
    pub async fn start_monitoring(&self) {
        self.stop_flag.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let table = Arc::clone(&self.table);
        let sender = self.sender.clone();
        let stop_flag = Arc::clone(&self.stop_flag);

        let handle = tokio::spawn(async move {
            let interval = config.heartbeat_interval;
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                tokio::time::sleep(interval).await;

                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                for event in check_table(&table, &config).await {
                    if sender.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut task = self.task_handle.lock().await;
        *task = Some(handle);
    }

    /// Stops the background monitoring task and waits for it to finish.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);

        let handle = {
            let mut task = self.task_handle.lock().await;
            task.take()
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        let task = self.task_handle.lock().await;
        if let Some(handle) = task.as_ref() {
            !handle.is_finished()
        } else {
            false
        }
    }

    pub async fn tracked(&self) -> usize {
        self.table.lock().await.len()
    }
}

async fn check_table(table: &HeartbeatTable, config: &TimeoutConfig) -> Vec<HeartbeatEvent> {
    let interval = config.heartbeat_interval;
    let threshold = config.missed_heartbeats_threshold;
    let threshold_secs = config.lease_grace_period().as_secs();
    let mut events = Vec::new();

    if interval.is_zero() {
        return events;
    }

    let mut table = table.lock().await;
    for (story_id, entry) in table.iter_mut() {
        if entry.stalled || entry.registered_at.elapsed() < config.startup_grace_period {
            continue;
        }

        let elapsed = entry.last.elapsed();
        let missed = (elapsed.as_secs_f64() / interval.as_secs_f64()).floor() as u32;
        let elapsed_secs = elapsed.as_secs();

        if missed >= threshold {
            entry.stalled = true;
            events.push(HeartbeatEvent::StallDetected {
                story_id: story_id.clone(),
                attempt: entry.attempt,
                missed,
                elapsed_secs,
                threshold_secs,
            });
        } else if missed >= threshold.saturating_sub(1) && missed > 0 {
            if entry.last_warning_sent != Some(missed) {
                events.push(HeartbeatEvent::Warning {
                    story_id: story_id.clone(),
                    missed,
                    elapsed_secs,
                    remaining_secs: threshold_secs.saturating_sub(elapsed_secs),
                });
                entry.last_warning_sent = Some(missed);
            }
        } else if missed == 0 {
            entry.last_warning_sent = None;
        }
    }

    events
}
