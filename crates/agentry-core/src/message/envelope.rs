//! Helper constructors for `AgentMessage` envelopes.
//!
//! Reduces boilerplate when building tasks, alerts and replies. Messages are
//! left unstamped; the bus assigns `id` and `timestamp` on send.

use agentry_types::agent::{AgentId, AgentStatus};
use agentry_types::message::{
    AgentMessage, ErrorKind, ErrorNotice, MessagePayload, Priority, StatusReport, TaskRequest,
    TaskResult,
};

/// Build a task request.
pub fn task(sender: AgentId, receiver: AgentId, request: TaskRequest) -> AgentMessage {
    AgentMessage::new(sender, receiver, MessagePayload::Task(request))
}

/// Build a `Critical` error notice addressed to the orchestrator.
pub fn alert(
    sender: AgentId,
    kind: ErrorKind,
    about: Option<AgentId>,
    message: impl Into<String>,
    action_required: bool,
) -> AgentMessage {
    AgentMessage::new(
        sender,
        AgentId::orchestrator(),
        MessagePayload::Error(ErrorNotice {
            kind,
            agent_id: about,
            message: message.into(),
            action_required,
        }),
    )
    .with_priority(Priority::Critical)
}

/// Build a status report.
pub fn status(
    sender: AgentId,
    receiver: AgentId,
    status: AgentStatus,
    detail: Option<String>,
) -> AgentMessage {
    AgentMessage::new(
        sender,
        receiver,
        MessagePayload::Status(StatusReport { status, detail }),
    )
}

/// Build a shutdown request.
pub fn shutdown(sender: AgentId, receiver: AgentId, reason: impl Into<String>) -> AgentMessage {
    AgentMessage::new(
        sender,
        receiver,
        MessagePayload::Shutdown {
            reason: reason.into(),
        },
    )
    .with_priority(Priority::High)
}

/// Build a reply to `original`, addressed to its sender.
///
/// The reply carries the original correlation id, or the original message id
/// when the request had none, and keeps the request's priority.
pub fn reply(sender: AgentId, original: &AgentMessage, payload: MessagePayload) -> AgentMessage {
    let correlation = original
        .correlation_id
        .clone()
        .or_else(|| original.id.map(|id| id.to_string()));

    let mut msg =
        AgentMessage::new(sender, original.sender.clone(), payload).with_priority(original.priority);
    msg.correlation_id = correlation;
    msg
}

/// Build a reply carrying a task result.
pub fn task_result(
    sender: AgentId,
    original: &AgentMessage,
    action: impl Into<String>,
    success: bool,
    output: serde_json::Value,
) -> AgentMessage {
    reply(
        sender,
        original,
        MessagePayload::Result(TaskResult {
            action: action.into(),
            success,
            output,
        }),
    )
}
