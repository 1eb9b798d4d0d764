//! Boatwatch agent core.
//!
//! Shared by the fan controller and the climate forwarder:
//! - Hysteresis controller driving a binary output without chatter
//! - Connection manager that (re)tries the broker off the sampling path
//! - Telemetry publisher that never blocks the cycle on the network
//! - Agent loop with guaranteed actuator-off teardown

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod gpio;
pub mod hysteresis;
pub mod logging;
pub mod models;
pub mod mqtt;
pub mod ports;
pub mod telemetry;

pub use agent::{AgentLoop, AgentPhase, AgentSummary, LoopTiming, TelemetryTarget};
pub use config::{AgentKind, AgentSettings, Credentials};
pub use connection::{Ack, ConnectionManager, ConnectionState};
pub use error::{
    exit_code_of, ActuatorError, AgentError, ConfigError, ConnectionError, PublishError,
    ResourceError, SampleError, TransportError,
};
pub use gpio::GpioOutput;
pub use hysteresis::HysteresisController;
pub use models::{round_wire, ActuatorState, Reading, TelemetryPayload, Thresholds};
pub use mqtt::{MqttConnector, MqttTransport};
pub use ports::{Actuator, Connector, DeliveryGuarantee, NoActuator, SampleSource, Transport};
pub use telemetry::{
    ClimateSchema, FanSchema, PayloadSchema, PublishOutcome, SkipReason, TelemetryPublisher,
};

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
