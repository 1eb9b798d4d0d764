//! Data model shared by sources, controller and publisher.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;

use crate::error::ConfigError;

/// Decimal places kept on the wire.
pub const WIRE_PRECISION: i32 = 2;

/// Round to [`WIRE_PRECISION`] decimal places.
pub fn round_wire(value: f64) -> f64 {
    let scale = 10f64.powi(WIRE_PRECISION);
    (value * scale).round() / scale
}

/// One sampled measurement. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    value: f64,
    secondary: Vec<f64>,
    captured_at: Instant,
}

impl Reading {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            secondary: Vec::new(),
            captured_at: Instant::now(),
        }
    }

    /// Attach an auxiliary value (e.g. humidity).
    pub fn with_secondary(mut self, value: f64) -> Self {
        self.secondary.push(value);
        self
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn secondary(&self) -> &[f64] {
        &self.secondary
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// Binary actuator mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActuatorState {
    On,
    #[default]
    Off,
}

impl ActuatorState {
    pub fn is_on(self) -> bool {
        matches!(self, ActuatorState::On)
    }
}

impl From<bool> for ActuatorState {
    fn from(on: bool) -> Self {
        if on {
            ActuatorState::On
        } else {
            ActuatorState::Off
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorState::On => f.write_str("ON"),
            ActuatorState::Off => f.write_str("OFF"),
        }
    }
}

/// Hysteresis dead band. Invariant: `on > off`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    on: f64,
    off: f64,
}

impl Thresholds {
    pub fn new(on: f64, off: f64) -> Result<Self, ConfigError> {
        // also rejects NaN
        if !(on > off) {
            return Err(ConfigError::InvalidThresholds { on, off });
        }
        Ok(Self { on, off })
    }

    pub fn on(&self) -> f64 {
        self.on
    }

    pub fn off(&self) -> f64 {
        self.off
    }
}

/// Value of one payload field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Number(f64),
    /// Encoded as `0` / `1`.
    Flag(bool),
}

/// Ordered mapping of named numeric fields, built fresh per publish attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryPayload {
    fields: Vec<(&'static str, FieldValue)>,
}

impl TelemetryPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a numeric field, rounded to wire precision.
    pub fn number(mut self, key: &'static str, value: f64) -> Self {
        self.fields.push((key, FieldValue::Number(round_wire(value))));
        self
    }

    pub fn flag(mut self, key: &'static str, value: bool) -> Self {
        self.fields.push((key, FieldValue::Flag(value)));
        self
    }

    pub fn fields(&self) -> &[(&'static str, FieldValue)] {
        &self.fields
    }

    /// UTF-8 JSON object, keys in insertion order.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a wire payload back into its ordered numeric fields.
    pub fn decode(bytes: &[u8]) -> Result<Vec<(String, f64)>, serde_json::Error> {
        let decoded: DecodedFields = serde_json::from_slice(bytes)?;
        Ok(decoded.0)
    }
}

impl Serialize for TelemetryPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            match value {
                FieldValue::Number(n) => map.serialize_entry(key, n)?,
                FieldValue::Flag(b) => map.serialize_entry(key, &u8::from(*b))?,
            }
        }
        map.end()
    }
}

struct DecodedFields(Vec<(String, f64)>);

impl<'de> Deserialize<'de> for DecodedFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = DecodedFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of numeric fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(2));
                while let Some((key, value)) = access.next_entry::<String, f64>()? {
                    fields.push((key, value));
                }
                Ok(DecodedFields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_require_positive_dead_band() {
        assert!(Thresholds::new(50.0, 45.0).is_ok());
        assert!(Thresholds::new(45.0, 45.0).is_err());
        assert!(Thresholds::new(40.0, 45.0).is_err());
        assert!(Thresholds::new(f64::NAN, 45.0).is_err());
    }

    #[test]
    fn test_payload_keeps_insertion_order() {
        let payload = TelemetryPayload::new()
            .number("temp", 51.456)
            .flag("fan", true);
        let json = String::from_utf8(payload.encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"temp":51.46,"fan":1}"#);
    }

    #[test]
    fn test_fields_are_rounded_on_insert() {
        let payload = TelemetryPayload::new()
            .number("temperature", 73.456)
            .flag("fan", false);
        assert_eq!(
            payload.fields(),
            &[
                ("temperature", FieldValue::Number(73.46)),
                ("fan", FieldValue::Flag(false)),
            ]
        );
    }

    #[test]
    fn test_decode_reads_flags_as_numbers() {
        let fields = TelemetryPayload::decode(br#"{"temp":47.0,"fan":0}"#).unwrap();
        assert_eq!(fields, vec![("temp".to_string(), 47.0), ("fan".to_string(), 0.0)]);
    }

    #[test]
    fn test_round_wire() {
        assert_eq!(round_wire(73.456), 73.46);
        assert_eq!(round_wire(-0.004), -0.0);
        assert_eq!(round_wire(212.0), 212.0);
    }

    #[test]
    fn test_actuator_state_default_is_off() {
        assert_eq!(ActuatorState::default(), ActuatorState::Off);
        assert_eq!(ActuatorState::from(true).to_string(), "ON");
    }
}
