//! Error taxonomy for the agents.
//!
//! Transient errors (sample, actuator, transport, connection, publish) are
//! recovered inside the loop that produced them. Only [`ResourceError`] and
//! [`ConfigError`] raised during startup end the process, wrapped in
//! [`AgentError`].

use std::time::Duration;

/// A single sample could not be produced. The cycle is skipped.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("sensor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed sample {line:?}: {reason}")]
    Malformed { line: String, reason: String },
    #[error("value {value} outside physical range (max {max})")]
    OutOfRange { value: f64, max: f64 },
    #[error("sensor read did not complete within {0:?}")]
    Timeout(Duration),
    #[error("sensor produced no data")]
    Empty,
    #[error("sensor read task failed: {0}")]
    Task(String),
}

impl SampleError {
    pub fn malformed(line: impl Into<String>, reason: impl Into<String>) -> Self {
        SampleError::Malformed {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// The actuator rejected a write.
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("actuator I/O error: {0}")]
    Io(String),
    #[error("actuator not initialised")]
    NotInitialised,
}

/// Raised by a live transport handle.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport request queue is full")]
    QueueFull,
    #[error("transport closed: {0}")]
    Closed(String),
}

/// A connection attempt failed. Recovered by the manager's retry loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
}

/// A publish attempt failed. Never retried synchronously.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport not ready")]
    NotReady,
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A required device is missing at startup.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open {resource}: {reason}")]
    Open { resource: String, reason: String },
    #[error("failed to drive actuator to its safe state: {0}")]
    Actuator(#[from] ActuatorError),
}

/// Startup configuration is missing or invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("MQTT_USERNAME and MQTT_PASSWORD must both be set")]
    MissingCredentials,
    #[error("invalid thresholds: on ({on}) must be greater than off ({off})")]
    InvalidThresholds { on: f64, off: f64 },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("cannot read config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Startup-fatal outcome of an agent run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AgentError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            AgentError::Resource(_) => 1,
            AgentError::Config(_) => 2,
        }
    }
}

/// Exit code for an arbitrary error chain, looking through wrappers such as
/// `anyhow` context: 2 for configuration errors, 1 for anything else.
pub fn exit_code_of(err: &(dyn std::error::Error + 'static)) -> u8 {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(agent) = e.downcast_ref::<AgentError>() {
            return agent.exit_code();
        }
        if e.is::<ConfigError>() {
            return 2;
        }
        if e.is::<ResourceError>() {
            return 1;
        }
        current = e.source();
    }
    1
}
