//! Metric snapshots handed out by the runtime components.
//!
//! Every component owns its counters and only ever returns copies of these
//! structs; nothing outside the component can mutate them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery counters of the message bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBusMetrics {
    pub total_messages: u64,
    pub successful_delivery: u64,
    pub failed_delivery: u64,
    /// Moving average of successful delivery latency in microseconds,
    /// updated as `(old + latest) / 2`.
    pub average_latency_us: u64,
}

impl MessageBusMetrics {
    /// Fold one successful delivery latency into the average.
    pub fn record_latency(&mut self, latest_us: u64) {
        self.average_latency_us = if self.successful_delivery <= 1 {
            latest_us
        } else {
            (self.average_latency_us + latest_us) / 2
        };
    }
}

/// Registry snapshot: live classification plus lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryMetrics {
    pub total_agents: usize,
    /// Agents currently `Idle` or `Busy`.
    pub active_agents: usize,
    /// Agents currently `Error` or `Offline`.
    pub failed_agents: usize,
    pub agents_created: u64,
    pub agents_stopped: u64,
    pub creation_failures: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Health monitor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMonitorMetrics {
    pub total_checks: u64,
    pub failed_checks: u64,
    pub sweeps: u64,
    pub healthy_agents: usize,
    pub degraded_agents: usize,
    pub unhealthy_agents: usize,
    pub alerts_sent: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Recovery manager counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub recoveries_started: u64,
    pub recovered: u64,
    pub failed: u64,
    pub escalations: u64,
    pub total_attempts: u64,
}

/// Per-agent message processing counters, kept by each agent under its own
/// lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub messages_processed: u64,
    pub messages_failed: u64,
    /// Processing time per handled message type name, in total milliseconds.
    #[serde(default)]
    pub processing_ms_by_type: BTreeMap<String, u64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}
