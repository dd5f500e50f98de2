//! Built-in demonstration agents.
//!
//! Only one kind ships with the binary: `echo`, a `BaseAgent` that answers
//! every task with a result echoing the request. Configured agents of any
//! other kind stay registered without a factory and are skipped at start.

use std::sync::Arc;
use std::time::Duration;

use agentry_core::AgentRuntime;
use agentry_core::agent::{Agent, AgentFactory, BaseAgent, BoxAgent};
use agentry_core::message::{MessageBus, envelope};
use agentry_core::registry::RegistryError;
use agentry_types::agent::{AgentConfig, AgentId};
use agentry_types::error::AgentError;
use agentry_types::message::{AgentMessage, MessagePayload, MessageType, TaskRequest};
use serde_json::json;
use tracing::{debug, info};

pub const ECHO_KIND: &str = "echo";

/// Register the factory matching each configured agent's kind.
///
/// Returns the agents whose kind has no built-in implementation.
pub fn register_builtin_factories(
    runtime: &AgentRuntime,
) -> Result<Vec<(AgentId, String)>, RegistryError> {
    let mut unknown = Vec::new();
    for (id, config) in &runtime.config().agents {
        let id = AgentId::new(id.as_str());
        match config.kind.as_str() {
            ECHO_KIND => runtime.registry().register_factory(id, echo_factory())?,
            other => unknown.push((id, other.to_string())),
        }
    }
    Ok(unknown)
}

pub fn echo_factory() -> impl AgentFactory + 'static {
    |id: &AgentId, config: &AgentConfig, bus: &Arc<MessageBus>| -> Result<BoxAgent, AgentError> {
        Ok(BoxAgent::new(build_echo(id, config, bus)))
    }
}

/// Build an echo agent. `settings.delay_ms` simulates work per task.
pub fn build_echo(id: &AgentId, config: &AgentConfig, bus: &Arc<MessageBus>) -> BaseAgent {
    let delay = config
        .settings
        .get("delay_ms")
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_millis);

    let agent = BaseAgent::new(
        id.clone(),
        config.capabilities.clone(),
        config.mailbox_capacity(bus.default_mailbox_size()),
        Arc::clone(bus),
    );

    let worker = agent.clone();
    agent.register_handler(MessageType::Task, move |msg: AgentMessage| {
        let worker = worker.clone();
        async move { handle_task(&worker, msg, delay).await }
    });

    let observer = agent.clone();
    agent.register_handler(MessageType::Status, move |msg: AgentMessage| {
        let observer = observer.clone();
        async move {
            if let MessagePayload::Status(report) = &msg.payload {
                debug!(agent_id = %observer.id(), from = %msg.sender, status = %report.status, "status report");
            }
            Ok(())
        }
    });

    agent
}

async fn handle_task(
    agent: &BaseAgent,
    msg: AgentMessage,
    delay: Option<Duration>,
) -> Result<(), AgentError> {
    let MessagePayload::Task(request) = &msg.payload else {
        return Err(AgentError::Processing("expected a task payload".to_string()));
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    // Reload requests come from the recovery manager, which has no mailbox.
    if *request == TaskRequest::ReloadConfig {
        info!(agent_id = %agent.id(), from = %msg.sender, "configuration reload requested");
        return Ok(());
    }

    let echoed =
        serde_json::to_value(request).map_err(|e| AgentError::Processing(e.to_string()))?;
    let result = envelope::task_result(
        agent.id().clone(),
        &msg,
        request.action(),
        true,
        json!({ "echo": echoed }),
    );
    agent.send(result)
}
