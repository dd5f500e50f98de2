//! Agent health tracking types.
//!
//! `HealthStatus` is the per-agent record owned by the health monitor. The
//! state machine lives on the record itself so it can be exercised without a
//! running monitor:
//!
//! - `Unknown` until the first check (or when the agent is gone)
//! - `Healthy` after any successful check, failure count reset to 0
//! - `Degraded` while `0 < consecutive_fails < max_failures`
//! - `Unhealthy` once `consecutive_fails >= max_failures`

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse health state derived from consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
            HealthState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health record for a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthStatus {
    pub state: HealthState,
    /// When the last check completed.
    pub last_check: Option<DateTime<Utc>>,
    /// When the last successful check completed.
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_fails: u32,
    /// Duration of the last check in milliseconds.
    pub response_time_ms: u64,
    /// Error from the last failed check; cleared on success.
    pub error_message: Option<String>,
    /// Free-form numeric gauges attached by the monitor.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl HealthStatus {
    /// Record a successful check.
    pub fn record_success(&mut self, at: DateTime<Utc>, response_time_ms: u64) {
        self.state = HealthState::Healthy;
        self.consecutive_fails = 0;
        self.last_check = Some(at);
        self.last_success = Some(at);
        self.response_time_ms = response_time_ms;
        self.error_message = None;
    }

    /// Record a failed check and escalate the state.
    pub fn record_failure(
        &mut self,
        at: DateTime<Utc>,
        response_time_ms: u64,
        error: impl Into<String>,
        max_failures: u32,
    ) {
        self.consecutive_fails = self.consecutive_fails.saturating_add(1);
        self.last_check = Some(at);
        self.response_time_ms = response_time_ms;
        self.error_message = Some(error.into());
        self.state = if self.consecutive_fails >= max_failures {
            HealthState::Unhealthy
        } else {
            HealthState::Degraded
        };
    }

    /// Record that the agent could not be found. A replacement instance
    /// starts counting failures from zero.
    pub fn record_missing(&mut self, at: DateTime<Utc>) {
        self.state = HealthState::Unknown;
        self.consecutive_fails = 0;
        self.last_check = Some(at);
        self.error_message = Some("agent not found".to_string());
    }

    /// Forget the failure streak, e.g. after the agent was recreated.
    /// History timestamps are kept.
    pub fn reset(&mut self) {
        self.state = HealthState::Unknown;
        self.consecutive_fails = 0;
        self.error_message = None;
    }
}
