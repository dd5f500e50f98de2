//! Agent-to-agent messaging domain types.
//!
//! Defines the `AgentMessage` envelope delivered through the message bus and
//! the `MessagePayload` sum type. The message type is derived from the payload
//! variant, so a handler keyed on `MessageType::Task` always receives a
//! `MessagePayload::Task`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;

/// Handler selector on the receiving agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Task,
    Result,
    Error,
    Status,
    HealthCheck,
    Coordination,
    Shutdown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Task => write!(f, "task"),
            MessageType::Result => write!(f, "result"),
            MessageType::Error => write!(f, "error"),
            MessageType::Status => write!(f, "status"),
            MessageType::HealthCheck => write!(f, "health_check"),
            MessageType::Coordination => write!(f, "coordination"),
            MessageType::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Advisory priority. Never changes mailbox ordering, which is FIFO.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A unit of work requested from an agent, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Analyze a target (file, module, package).
    Analyze { target: String },
    /// Apply the fix for a previously reported issue.
    ApplyFix {
        issue_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        patch: Option<String>,
    },
    /// Generate an artifact (tests, docs) for a target.
    Generate { target: String, artifact: String },
    /// Run a named suite (tests, benchmarks).
    Run { suite: String },
    /// Re-read configuration in place. Sent by the recovery manager.
    ReloadConfig,
    /// Escape hatch for worker-specific actions.
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl TaskRequest {
    /// Stable action name, e.g. `"reload_config"`.
    pub fn action(&self) -> &str {
        match self {
            TaskRequest::Analyze { .. } => "analyze",
            TaskRequest::ApplyFix { .. } => "apply_fix",
            TaskRequest::Generate { .. } => "generate",
            TaskRequest::Run { .. } => "run",
            TaskRequest::ReloadConfig => "reload_config",
            TaskRequest::Custom { name, .. } => name,
        }
    }
}

/// Outcome of a task, sent back to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub action: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
}

/// Classification of an error notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HealthCheckFailed,
    AgentUnhealthy,
    SystemDegraded,
    RecoveryEscalation,
    ProcessingFailed,
}

/// Error notification, usually addressed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    /// Agent the notice is about, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub message: String,
    /// Whether a human needs to act.
    #[serde(default)]
    pub action_required: bool,
}

/// Status report from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: crate::agent::AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Free-form coordination note between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationNote {
    pub topic: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Message body, one variant per `MessageType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    Task(TaskRequest),
    Result(TaskResult),
    Error(ErrorNotice),
    Status(StatusReport),
    HealthCheck,
    Coordination(CoordinationNote),
    Shutdown { reason: String },
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Task(_) => MessageType::Task,
            MessagePayload::Result(_) => MessageType::Result,
            MessagePayload::Error(_) => MessageType::Error,
            MessagePayload::Status(_) => MessageType::Status,
            MessagePayload::HealthCheck => MessageType::HealthCheck,
            MessagePayload::Coordination(_) => MessageType::Coordination,
            MessagePayload::Shutdown { .. } => MessageType::Shutdown,
        }
    }
}

/// A message exchanged through the bus.
///
/// `id` and `timestamp` are left empty by producers and stamped by the bus on
/// first send. Values a producer supplies are kept, so a retried send of the
/// same message carries the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub sender: AgentId,
    pub receiver: AgentId,
    pub payload: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AgentMessage {
    /// Unstamped message with medium priority and no correlation.
    pub fn new(sender: AgentId, receiver: AgentId, payload: MessagePayload) -> Self {
        Self {
            id: None,
            sender,
            receiver,
            payload,
            timestamp: None,
            priority: Priority::default(),
            correlation_id: None,
            context: BTreeMap::new(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Fill in `id` and `timestamp` where absent.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        if self.id.is_none() {
            self.id = Some(Uuid::now_v7());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }

    /// Independent copy addressed to another receiver.
    pub fn readdressed(&self, receiver: AgentId) -> Self {
        let mut copy = self.clone();
        copy.receiver = receiver;
        copy
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
