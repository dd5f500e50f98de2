//! CLI command definitions for the `agentry` binary.

pub mod report;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use agentry_observe::{LogFormat, TracingOptions};
use clap::{Parser, Subcommand};

/// Run and inspect an Agentry agent runtime.
#[derive(Parser)]
#[command(name = "agentry", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write log lines as JSON objects.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Config file (defaults to ~/.agentry/config.toml).
    #[arg(long, global = true, env = "AGENTRY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the runtime with the configured agents and run until Ctrl+C.
    Run {
        /// Stop on its own after this many seconds.
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },

    /// Load and validate the config, then print what would run.
    Validate,
}

impl Cli {
    /// Default log filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,agentry_core=debug",
            _ => "trace",
        }
    }

    pub fn tracing_options(&self) -> TracingOptions {
        TracingOptions {
            default_filter: self.log_filter().to_string(),
            format: if self.log_json {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
            otel: self.otel,
        }
    }
}
