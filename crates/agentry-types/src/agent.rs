//! Agent identity, status, and configuration types.
//!
//! `AgentId` is the addressing unit for the message bus and the key of the
//! registry's agent table. `AgentConfig` is the construction recipe the
//! registry keeps so an agent can be recreated after a stop.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Conventional identity of the alert sink. Not an addressable agent.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Well-known sender identity of the agent registry.
pub const REGISTRY_ID: &str = "registry";

/// Well-known sender identity of the health monitor.
pub const HEALTH_MONITOR_ID: &str = "health_monitor";

/// Well-known sender identity of the recovery manager.
pub const RECOVERY_MANAGER_ID: &str = "recovery_manager";

/// Opaque, stable identity of an agent.
///
/// Reused across restarts of the same logical agent, unique among the
/// agents registered at any one time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Wrap a trusted identifier (literals, config keys already validated).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an identifier supplied by a caller, rejecting blank input.
    pub fn parse(id: &str) -> Result<Self, String> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err("agent id must not be empty".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The alert sink identity.
    pub fn orchestrator() -> Self {
        Self::new(ORCHESTRATOR_ID)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of an agent, mutated only by the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Offline,
    Starting,
    Idle,
    Busy,
    Error,
    Stopping,
}

impl AgentStatus {
    /// Whether the agent is up and able to take work.
    pub fn is_active(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }

    /// Whether the agent counts as failed in registry metrics.
    pub fn is_failed(self) -> bool {
        matches!(self, AgentStatus::Error | AgentStatus::Offline)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Starting => write!(f, "starting"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Construction recipe for an agent, persisted by the registry independently
/// of the live instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Which factory builds this agent (e.g. "echo", "security").
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Capacity of the agent's mailbox. Unset means the bus default
    /// (`bus.default_mailbox_size`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox_size: Option<usize>,

    /// Disabled agents are registered but not started automatically.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Capability tags advertised by the agent, in order.
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Free-form settings handed to the agent's factory.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

fn default_kind() -> String {
    "echo".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            mailbox_size: None,
            enabled: default_enabled(),
            capabilities: Vec::new(),
            settings: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    /// Config of the given kind with every other field defaulted.
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Mailbox capacity for this agent, falling back to `bus_default`.
    pub fn mailbox_capacity(&self, bus_default: usize) -> usize {
        self.mailbox_size.unwrap_or(bus_default)
    }
}

/// Point-in-time description of a live agent, as listed by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
}
