//! Boatwatch SHT45 forwarder
//!
//! Finds the SHT4x Trinkey on USB serial, forwards temperature (°F) and
//! humidity to MQTT on a slow cadence, and optionally switches a relay on
//! the temperature when a GPIO pin is configured.

mod serial;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use boatwatch_core::{
    exit_code_of, logging, shutdown_signal, Actuator, AgentKind, AgentLoop, AgentSettings,
    AgentSummary, ClimateSchema, GpioOutput, HysteresisController, MqttConnector, NoActuator,
    TelemetryTarget,
};
use serial::SerialLineSource;
use tracing::{error, info};

const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    info!("🌡️ Boatwatch SHT45 forwarder starting...");

    match run().await {
        Ok(summary) => {
            info!(?summary, "SHT45 forwarder stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::from(exit_code_of(e.as_ref()))
        }
    }
}

async fn run() -> Result<AgentSummary> {
    let settings =
        AgentSettings::load(AgentKind::Sht45).context("Failed to load forwarder settings")?;
    let thresholds = settings.thresholds()?;

    let port = match &settings.serial_port {
        Some(port) => port.clone(),
        None => serial::find_device(&settings.serial_description)
            .context("SHT4x sensor not connected")?,
    };
    let source = SerialLineSource::open(&port, settings.baud_rate, SERIAL_TIMEOUT)?;
    info!(port = source.name(), topic = %settings.topic, "Sensor found");

    let relay: Box<dyn Actuator> = match settings.gpio {
        Some(pin) => Box::new(
            GpioOutput::open_async(pin)
                .await
                .with_context(|| format!("Failed to open relay on GPIO{}", pin))?,
        ),
        None => {
            info!("No relay configured, forwarding only");
            Box::new(NoActuator::default())
        }
    };

    let agent = AgentLoop::new(
        source,
        relay,
        MqttConnector::from_settings(&settings),
        HysteresisController::new(thresholds),
        TelemetryTarget::new(settings.topic.clone(), ClimateSchema),
        settings.timing(),
    );

    let summary = agent
        .run(shutdown_signal())
        .await
        .context("SHT45 forwarder failed to start")?;
    Ok(summary)
}
