//! Agent communication and lifecycle orchestration for Agentry.
//!
//! Agents exchange `AgentMessage`s through the `MessageBus`; the
//! `AgentRegistry` owns their lifecycle, the `HealthMonitor` watches them and
//! the `RecoveryManager` brings failed agents back. `AgentRuntime` wires all
//! of it together. Depends only on `agentry-types` and async plumbing, never
//! on the CLI or tracing setup.

pub mod agent;
pub mod clock;
pub mod event;
pub mod health;
pub mod message;
pub mod recovery;
pub mod registry;
pub mod runtime;
pub mod task;

mod sync;

#[cfg(test)]
mod testing;

pub use runtime::AgentRuntime;
