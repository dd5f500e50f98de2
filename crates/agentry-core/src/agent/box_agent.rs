//! BoxAgent -- object-safe dynamic dispatch wrapper for Agent.
//!
//! 1. Define an object-safe `AgentDyn` trait with boxed futures
//! 2. Blanket-impl `AgentDyn` for all `T: Agent`
//! 3. `BoxAgent` wraps `Box<dyn AgentDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use agentry_types::agent::{AgentId, AgentInfo, AgentStatus};
use agentry_types::error::AgentError;
use agentry_types::message::AgentMessage;
use agentry_types::metrics::AgentMetrics;

use super::contract::Agent;

type AgentFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;

/// Object-safe version of [`Agent`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing `Agent`.
pub trait AgentDyn: Send + Sync {
    fn id(&self) -> &AgentId;

    fn status(&self) -> AgentStatus;

    fn capabilities(&self) -> &[String];

    fn start_boxed(&self) -> AgentFuture<'_>;

    fn stop_boxed(&self) -> AgentFuture<'_>;

    fn process_message_boxed(&self, msg: AgentMessage) -> AgentFuture<'_>;

    fn health_check_boxed(&self) -> AgentFuture<'_>;

    fn metrics(&self) -> AgentMetrics;
}

impl<T: Agent> AgentDyn for T {
    fn id(&self) -> &AgentId {
        Agent::id(self)
    }

    fn status(&self) -> AgentStatus {
        Agent::status(self)
    }

    fn capabilities(&self) -> &[String] {
        Agent::capabilities(self)
    }

    fn start_boxed(&self) -> AgentFuture<'_> {
        Box::pin(self.start())
    }

    fn stop_boxed(&self) -> AgentFuture<'_> {
        Box::pin(self.stop())
    }

    fn process_message_boxed(&self, msg: AgentMessage) -> AgentFuture<'_> {
        Box::pin(self.process_message(msg))
    }

    fn health_check_boxed(&self) -> AgentFuture<'_> {
        Box::pin(self.health_check())
    }

    fn metrics(&self) -> AgentMetrics {
        Agent::metrics(self)
    }
}

/// Type-erased agent, as stored by the registry.
pub struct BoxAgent {
    inner: Box<dyn AgentDyn>,
}

impl BoxAgent {
    pub fn new<T: Agent + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &AgentId {
        self.inner.id()
    }

    pub fn status(&self) -> AgentStatus {
        self.inner.status()
    }

    pub fn capabilities(&self) -> &[String] {
        self.inner.capabilities()
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        self.inner.start_boxed().await
    }

    pub async fn stop(&self) -> Result<(), AgentError> {
        self.inner.stop_boxed().await
    }

    pub async fn process_message(&self, msg: AgentMessage) -> Result<(), AgentError> {
        self.inner.process_message_boxed(msg).await
    }

    pub async fn health_check(&self) -> Result<(), AgentError> {
        self.inner.health_check_boxed().await
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.inner.metrics()
    }

    /// Listing entry for this agent.
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id().clone(),
            status: self.status(),
            capabilities: self.capabilities().to_vec(),
        }
    }
}

impl std::fmt::Debug for BoxAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgent")
            .field("id", self.id())
            .field("status", &self.status())
            .finish()
    }
}
