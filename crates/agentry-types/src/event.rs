//! Lifecycle events broadcast by the runtime.
//!
//! `RuntimeEvent` is observed by the CLI, tests, and the auto-recovery
//! listener. Events are advisory: a lagging subscriber may miss some, and
//! agents never receive them through their mailboxes.

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::health::HealthState;
use crate::recovery::RecoveryAction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// An agent was constructed and started by the registry.
    AgentCreated { agent_id: AgentId, kind: String },

    /// An agent was stopped. `config_retained` is true for restarts.
    AgentStopped {
        agent_id: AgentId,
        config_retained: bool,
    },

    /// The health monitor moved an agent to a new state.
    HealthChanged {
        agent_id: AgentId,
        from: HealthState,
        to: HealthState,
        consecutive_fails: u32,
    },

    /// The recovery manager began working on an agent.
    RecoveryStarted {
        agent_id: AgentId,
        action: RecoveryAction,
        max_retries: u32,
    },

    /// Recovery brought the agent back.
    RecoverySucceeded { agent_id: AgentId, attempts: u32 },

    /// All attempts were exhausted or a configuration error stopped recovery.
    RecoveryFailed {
        agent_id: AgentId,
        attempts: u32,
        error: String,
    },

    /// A human was asked to intervene.
    RecoveryEscalated { agent_id: AgentId, reason: String },
}

impl RuntimeEvent {
    /// The agent the event is about.
    pub fn agent_id(&self) -> &AgentId {
        match self {
            RuntimeEvent::AgentCreated { agent_id, .. }
            | RuntimeEvent::AgentStopped { agent_id, .. }
            | RuntimeEvent::HealthChanged { agent_id, .. }
            | RuntimeEvent::RecoveryStarted { agent_id, .. }
            | RuntimeEvent::RecoverySucceeded { agent_id, .. }
            | RuntimeEvent::RecoveryFailed { agent_id, .. }
            | RuntimeEvent::RecoveryEscalated { agent_id, .. } => agent_id,
        }
    }
}
