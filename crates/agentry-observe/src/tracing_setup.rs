//! Global subscriber installation for Agentry binaries.
//!
//! Layers, outermost first: an `EnvFilter` (`RUST_LOG` overrides the
//! caller's default), one `fmt` layer in either human or JSON form, and an
//! optional OpenTelemetry bridge exporting spans to stdout.
//!
//! ```no_run
//! use agentry_observe::{LogFormat, TracingOptions};
//!
//! let _guard = agentry_observe::init_tracing(&TracingOptions {
//!     default_filter: "info,agentry_core=debug".to_string(),
//!     format: LogFormat::Json,
//!     otel: false,
//! })
//! .unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Shape of the log lines written to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry with the stdout exporter.
    pub otel: bool,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_filter: "warn".to_string(),
            format: LogFormat::Pretty,
            otel: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Keeps the OpenTelemetry provider alive; flushes and shuts it down on drop.
#[must_use = "dropping the guard shuts down span export"]
#[derive(Debug, Default)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    pub fn otel_enabled(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Warning: OTel tracer provider shutdown error: {e}");
            }
        }
    }
}

/// Build the level filter: `RUST_LOG` when set and valid, else `default`.
pub fn resolve_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// Span close events are always on, so the component spans
/// (`message_bus`, `agent_registry`, `health_monitor`, `recovery_manager`,
/// `agent`) report their lifetimes.
pub fn init_tracing(options: &TracingOptions) -> Result<TracingGuard, TracingError> {
    let (pretty, json) = match options.format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            ),
        ),
    };

    let provider = options.otel.then(|| {
        SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("agentry")));

    tracing_subscriber::registry()
        .with(resolve_filter(&options.default_filter))
        .with(pretty)
        .with(json)
        .with(otel)
        .try_init()?;

    if let Some(provider) = &provider {
        opentelemetry::global::set_tracer_provider(provider.clone());
    }
    Ok(TracingGuard { provider })
}
