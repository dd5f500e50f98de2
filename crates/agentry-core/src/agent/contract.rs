//! Agent trait definition.
//!
//! This is the boundary every worker implements to take part in the runtime.
//! Uses RPITIT (Rust 2024 edition) for the async lifecycle methods; the
//! registry stores agents behind [`BoxAgent`](super::BoxAgent).

use agentry_types::agent::{AgentId, AgentStatus};
use agentry_types::error::AgentError;
use agentry_types::message::AgentMessage;
use agentry_types::metrics::AgentMetrics;

/// A long-running worker driven by the registry.
///
/// All methods take `&self`: implementations keep their mutable state behind
/// their own locks, so the registry can hold agents in an `Arc` and call them
/// concurrently with the agent's own processing loop.
pub trait Agent: Send + Sync {
    /// Stable identity, never empty.
    fn id(&self) -> &AgentId;

    fn status(&self) -> AgentStatus;

    /// Ordered capability tags.
    fn capabilities(&self) -> &[String];

    /// Move toward `Idle`. Called at most once per instance.
    fn start(&self) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// Release every resource and end `Offline`.
    ///
    /// Must tolerate being called late, or more than once.
    fn stop(&self) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// Dispatch one message by type. Unhandled types yield
    /// `AgentError::NoHandler`.
    fn process_message(
        &self,
        msg: AgentMessage,
    ) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// `Ok(())` means healthy.
    fn health_check(&self) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;

    /// Processing counters. Agents that keep none report zeroes.
    fn metrics(&self) -> AgentMetrics {
        AgentMetrics::default()
    }
}
