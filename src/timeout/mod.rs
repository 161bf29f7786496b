//! Timeout configuration and lease liveness monitoring.
//!
//! This module provides the timeouts applied to acceptance criteria and gate
//! attempts, plus the heartbeat parameters used by the [`LeaseWatchdog`] to
//! decide when a worker has crashed.

pub mod heartbeat;

use std::time::Duration;

pub use heartbeat::{HeartbeatEvent, HeartbeatHandle, LeaseWatchdog};

/// Configuration for timeout behavior during story execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum time allowed for the agent to complete one acceptance criterion.
    /// Default: 900 seconds (15 minutes)
    pub criterion_timeout: Duration,

    /// Maximum time allowed for a single quality gate attempt.
    /// Default: 600 seconds (10 minutes)
    pub gate_timeout: Duration,

    /// Interval between liveness checks of live leases.
    /// Default: 30 seconds
    pub heartbeat_interval: Duration,

    /// Number of missed heartbeats before a lease is treated as crashed.
    /// Default: 3
    pub missed_heartbeats_threshold: u32,

    /// Time after a lease is created during which it is never treated as
    /// stalled. Covers workspace setup and agent start-up.
    /// Default: 60 seconds
    pub startup_grace_period: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            criterion_timeout: Duration::from_secs(900),
            gate_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats_threshold: 3,
            startup_grace_period: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grace period after which a silent lease counts as a crash.
    pub fn lease_grace_period(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats_threshold
    }

    pub fn with_criterion_timeout(mut self, timeout: Duration) -> Self {
        self.criterion_timeout = timeout;
        self
    }

    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_missed_heartbeats_threshold(mut self, threshold: u32) -> Self {
        self.missed_heartbeats_threshold = threshold;
        self
    }

    /// Sets the startup grace period applied to fresh leases.
    pub fn with_startup_grace_period(mut self, grace_period: Duration) -> Self {
        self.startup_grace_period = grace_period;
        self
    }
}
