//! Authoritative agent health tracking.
//!
//! The `HealthMonitor` sweeps every live agent concurrently, keeps a
//! `HealthStatus` per agent, publishes `HealthChanged` events on state
//! transitions and alerts the orchestrator through the bus.

pub mod monitor;

pub use monitor::HealthMonitor;
