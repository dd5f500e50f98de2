//! Supervised recovery of unhealthy agents.
//!
//! The `RecoveryManager` is the only component that restarts or recreates
//! agents outside the normal lifecycle calls. It runs a bounded number of
//! attempts with geometric backoff and escalates to the orchestrator when
//! every attempt fails.

pub mod manager;

pub use manager::{RecoveryError, RecoveryManager};
