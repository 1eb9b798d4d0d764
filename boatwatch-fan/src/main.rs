//! Boatwatch fan controller
//!
//! Reads the CPU thermal zone every period, switches the case fan on a GPIO
//! pin with hysteresis, and reports `{"temp", "fan"}` over MQTT. Broker
//! outages never stop the fan control.

mod thermal;

use std::process::ExitCode;

use anyhow::{Context, Result};
use boatwatch_core::{
    exit_code_of, logging, shutdown_signal, AgentKind, AgentLoop, AgentSettings, AgentSummary,
    ConfigError, FanSchema, GpioOutput, HysteresisController, MqttConnector, TelemetryTarget,
};
use thermal::ThermalZoneSource;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");
    info!("🌀 Boatwatch fan controller starting...");

    match run().await {
        Ok(summary) => {
            info!(?summary, "Fan controller stopped");
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
        AgentSettings::load(AgentKind::Fan).context("Failed to load fan controller settings")?;
    let thresholds = settings.thresholds()?;
    let pin = settings.gpio.ok_or_else(|| ConfigError::InvalidValue {
        key: "BOATWATCH_GPIO".to_string(),
        reason: "the fan controller needs an output pin".to_string(),
    })?;

    info!(
        broker = %settings.broker,
        topic = %settings.topic,
        on = thresholds.on(),
        off = thresholds.off(),
        pin,
        "Configuration loaded"
    );

    let source = ThermalZoneSource::new(&settings.thermal_path);
    info!(zone = %source.path().display(), "Reading CPU temperature");
    let fan = GpioOutput::open_async(pin)
        .await
        .with_context(|| format!("Failed to open fan on GPIO{}", pin))?;
    let connector = MqttConnector::from_settings(&settings);

    let agent = AgentLoop::new(
        source,
        fan,
        connector,
        HysteresisController::new(thresholds),
        TelemetryTarget::new(settings.topic.clone(), FanSchema),
        settings.timing(),
    );

    let summary = agent
        .run(shutdown_signal())
        .await
        .context("Fan controller failed to start")?;
    Ok(summary)
}
