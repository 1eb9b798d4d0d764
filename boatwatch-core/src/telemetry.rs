//! Telemetry publishing.
//!
//! Turns a reading plus the committed actuator state into a JSON payload and
//! hands it to the [`ConnectionManager`]. Every failure ends up in the
//! returned [`PublishOutcome`]; nothing here returns an error or waits on the
//! network.

use std::fmt;

use tracing::debug;

use crate::connection::{Ack, ConnectionManager};
use crate::error::PublishError;
use crate::models::{ActuatorState, Reading, TelemetryPayload};
use crate::ports::{DeliveryGuarantee, Transport};

/// Fixed key set of a wire payload.
pub trait PayloadSchema: Send + Sync + 'static {
    fn build(&self, reading: &Reading, state: ActuatorState) -> TelemetryPayload;
}

impl PayloadSchema for Box<dyn PayloadSchema> {
    fn build(&self, reading: &Reading, state: ActuatorState) -> TelemetryPayload {
        (**self).build(reading, state)
    }
}

/// `{"temp": <°C>, "fan": 0|1}`
#[derive(Debug, Clone, Copy, Default)]
pub struct FanSchema;

impl PayloadSchema for FanSchema {
    fn build(&self, reading: &Reading, state: ActuatorState) -> TelemetryPayload {
        TelemetryPayload::new()
            .number("temp", reading.value())
            .flag("fan", state.is_on())
    }
}

/// `{"temperature": <°F>, "humidity": <%>}`
#[derive(Debug, Clone, Copy, Default)]
pub struct ClimateSchema;

impl PayloadSchema for ClimateSchema {
    fn build(&self, reading: &Reading, _state: ActuatorState) -> TelemetryPayload {
        let payload = TelemetryPayload::new().number("temperature", reading.value());
        match reading.secondary().first() {
            Some(humidity) => payload.number("humidity", *humidity),
            None => payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered(Ack),
    Skipped(SkipReason),
    Rejected(String),
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Delivered(ack) => write!(f, "delivered #{}", ack.sequence),
            PublishOutcome::Skipped(SkipReason::NotConnected) => f.write_str("skipped (not connected)"),
            PublishOutcome::Rejected(reason) => write!(f, "rejected ({reason})"),
        }
    }
}

pub struct TelemetryPublisher<T: Transport> {
    connection: ConnectionManager<T>,
    channel: String,
    schema: Box<dyn PayloadSchema>,
}

impl<T: Transport> TelemetryPublisher<T> {
    pub fn new(
        connection: ConnectionManager<T>,
        channel: impl Into<String>,
        schema: impl PayloadSchema,
    ) -> Self {
        Self {
            connection,
            channel: channel.into(),
            schema: Box::new(schema),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn publish(&self, reading: &Reading, state: ActuatorState) -> PublishOutcome {
        let payload = self.schema.build(reading, state);
        let bytes = match payload.encode() {
            Ok(bytes) => bytes,
            Err(e) => return PublishOutcome::Rejected(PublishError::from(e).to_string()),
        };

        match self
            .connection
            .publish(&self.channel, bytes, DeliveryGuarantee::AtLeastOnce)
        {
            Ok(ack) => {
                debug!(channel = %self.channel, sequence = ack.sequence, "Telemetry queued");
                PublishOutcome::Delivered(ack)
            }
            Err(PublishError::NotReady) => PublishOutcome::Skipped(SkipReason::NotConnected),
            Err(e) => PublishOutcome::Rejected(e.to_string()),
        }
    }
}
