//! Agent construction recipes.
//!
//! The registry never builds agents itself; it asks the factory registered
//! for an agent id. Closures with the right signature are factories.

use std::sync::Arc;

use agentry_types::agent::{AgentConfig, AgentId};
use agentry_types::error::AgentError;

use super::box_agent::BoxAgent;
use crate::message::MessageBus;

/// Builds an unstarted agent for `id` from its config.
pub trait AgentFactory: Send + Sync {
    fn create(
        &self,
        id: &AgentId,
        config: &AgentConfig,
        bus: &Arc<MessageBus>,
    ) -> Result<BoxAgent, AgentError>;
}

impl<F> AgentFactory for F
where
    F: Fn(&AgentId, &AgentConfig, &Arc<MessageBus>) -> Result<BoxAgent, AgentError> + Send + Sync,
{
    fn create(
        &self,
        id: &AgentId,
        config: &AgentConfig,
        bus: &Arc<MessageBus>,
    ) -> Result<BoxAgent, AgentError> {
        self(id, config, bus)
    }
}

/// Shared, type-erased factory.
pub type BoxAgentFactory = Arc<dyn AgentFactory>;
