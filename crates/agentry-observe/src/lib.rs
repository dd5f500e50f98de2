//! Observability setup for Agentry binaries.
//!
//! The runtime crates only emit `tracing` events and spans; installing a
//! subscriber (and optionally an OpenTelemetry bridge) is the binary's job.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingError, TracingGuard, TracingOptions, init_tracing};
