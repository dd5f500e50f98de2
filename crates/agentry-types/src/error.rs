use thiserror::Error;

use crate::message::MessageType;

/// Errors returned by implementations of the agent contract.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no handler registered for message type '{0}'")]
    NoHandler(MessageType),

    #[error("agent already started")]
    AlreadyStarted,

    #[error("agent is not running")]
    NotRunning,

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("message processing failed: {0}")]
    Processing(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("agent construction failed: {0}")]
    Construction(String),
}

/// Errors from loading or validating runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
