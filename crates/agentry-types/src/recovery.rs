//! Recovery strategy types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// What the recovery manager does on each attempt.
///
/// Unknown action names are rejected when the strategy is deserialized, so a
/// misconfigured action never reaches the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Stop the agent (keeping its config) and create it again.
    #[default]
    Restart,
    /// Ask the agent to reload its configuration in place.
    Reload,
    /// Same mechanics as `Restart`.
    Recreate,
    /// Hand off to a human through the orchestrator.
    Escalate,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::Restart => write!(f, "restart"),
            RecoveryAction::Reload => write!(f, "reload"),
            RecoveryAction::Recreate => write!(f, "recreate"),
            RecoveryAction::Escalate => write!(f, "escalate"),
        }
    }
}

/// Per-agent recovery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wait after the first failed attempt, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Multiplier applied to the delay after every wait. At least 1.0.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub action: RecoveryAction,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
            action: RecoveryAction::default(),
        }
    }
}

impl RecoveryStrategy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reject strategies the retry loop cannot run.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        Ok(())
    }

    /// The wait following `delay`, saturating at `Duration::MAX`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(Duration::MAX)
    }
}

/// How a recovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// The action succeeded and the agent is expected to be back.
    Recovered,
    /// A human was notified; the agent is not recovered.
    Escalated,
    /// Every attempt failed.
    Failed,
}

/// One entry of an agent's recovery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub agent_id: AgentId,
    pub action: RecoveryAction,
    pub outcome: RecoveryOutcome,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
