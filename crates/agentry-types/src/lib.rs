//! Shared domain types for Agentry.
//!
//! This crate contains the types exchanged across the runtime: agent
//! identities and configs, the message envelope and payloads, health and
//! recovery records, metric snapshots, runtime events, and their error types.
//!
//! No async runtime dependencies -- only serde, serde_json, uuid, chrono,
//! thiserror and toml.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod message;
pub mod metrics;
pub mod recovery;
