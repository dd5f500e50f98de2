//! Agent capability contract and shared worker plumbing.
//!
//! - `contract` -- the `Agent` trait every worker implements (RPITIT)
//! - `box_agent` -- `AgentDyn` + `BoxAgent` for dynamic dispatch
//! - `factory` -- `AgentFactory`, how the registry constructs agents
//! - `base` -- `BaseAgent`: status cell, handler table and mailbox loop

pub mod base;
pub mod box_agent;
pub mod contract;
pub mod factory;

pub use base::{BaseAgent, MessageHandler};
pub use box_agent::{AgentDyn, BoxAgent};
pub use contract::Agent;
pub use factory::{AgentFactory, BoxAgentFactory};
