//! Runtime configuration types.
//!
//! `RuntimeConfig` represents the top-level `config.toml` that sizes the
//! bus, paces the health loops, and sets recovery policy. All fields have
//! defaults, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, AgentId};
use crate::error::ConfigError;
use crate::recovery::RecoveryStrategy;

/// Top-level configuration for the agent runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Agents to register at startup, keyed by agent id.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Message bus sizing and delivery timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of the ingress queue between `send` and the dispatch loop.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// How long a delivery may wait on a full mailbox.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Mailbox size used when an agent config does not set one.
    #[serde(default = "default_mailbox_size")]
    pub default_mailbox_size: usize,
}

fn default_ingress_capacity() -> usize {
    1_000
}

fn default_delivery_timeout_ms() -> u64 {
    5_000
}

fn default_mailbox_size() -> usize {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: default_ingress_capacity(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            default_mailbox_size: default_mailbox_size(),
        }
    }
}

impl BusConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Registry lifecycle timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval of the registry's lightweight health loop.
    #[serde(default = "default_interval_secs")]
    pub health_interval_secs: u64,

    /// Upper bound on a single agent's graceful stop.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Upper bound on a single health check issued by the registry loop.
    #[serde(default = "default_check_timeout_secs")]
    pub health_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_check_timeout_secs() -> u64 {
    10
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            health_timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// Health monitor pacing and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    /// Consecutive failures before an agent is `Unhealthy`.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_max_failures() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            max_failures: default_max_failures(),
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

/// Recovery policy: default strategy, per-agent overrides, auto-recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Start recovery automatically when an agent turns unhealthy.
    #[serde(default = "default_auto_recover")]
    pub auto_recover: bool,

    /// Recovery records kept per agent.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub default_strategy: RecoveryStrategy,

    #[serde(default)]
    pub overrides: BTreeMap<String, RecoveryStrategy>,
}

fn default_auto_recover() -> bool {
    true
}

fn default_history_limit() -> usize {
    50
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recover: default_auto_recover(),
            history_limit: default_history_limit(),
            default_strategy: RecoveryStrategy::default(),
            overrides: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.bus.ingress_capacity == 0 {
            return invalid("bus.ingress_capacity must be greater than 0");
        }
        if self.bus.delivery_timeout_ms == 0 {
            return invalid("bus.delivery_timeout_ms must be greater than 0");
        }
        if self.bus.default_mailbox_size == 0 {
            return invalid("bus.default_mailbox_size must be greater than 0");
        }
        if self.registry.health_interval_secs == 0 || self.health.check_interval_secs == 0 {
            return invalid("health intervals must be greater than 0");
        }
        if self.registry.stop_timeout_secs == 0 {
            return invalid("registry.stop_timeout_secs must be greater than 0");
        }
        if self.health.check_timeout_secs == 0 || self.registry.health_timeout_secs == 0 {
            return invalid("health check timeouts must be greater than 0");
        }
        if self.health.max_failures == 0 {
            return invalid("health.max_failures must be greater than 0");
        }

        let strategies = std::iter::once(("default", &self.recovery.default_strategy)).chain(
            self.recovery
                .overrides
                .iter()
                .map(|(id, strategy)| (id.as_str(), strategy)),
        );
        for (name, strategy) in strategies {
            strategy
                .validate()
                .map_err(|reason| ConfigError::Invalid(format!("recovery strategy '{name}': {reason}")))?;
        }

        for (id, agent) in &self.agents {
            AgentId::parse(id).map_err(ConfigError::Invalid)?;
            if agent.mailbox_size == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "agent '{id}': mailbox_size must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
