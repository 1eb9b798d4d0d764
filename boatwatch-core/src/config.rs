//! Static agent configuration.
//!
//! Layers, later wins:
//! - compiled defaults for the agent kind
//! - optional TOML file (`BOATWATCH_CONFIG`, else `<config dir>/boatwatch/<agent>.toml`)
//! - environment variables (a `.env` file is loaded first if present)
//!
//! Settings are validated once at startup and never change afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::agent::LoopTiming;
use crate::error::ConfigError;
use crate::models::Thresholds;

/// Which agent the settings are for; selects defaults and file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Fan,
    Sht45,
}

impl AgentKind {
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::Fan => "boatwatch-fan",
            AgentKind::Sht45 => "boatwatch-sht45",
        }
    }
}

/// Broker credentials. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub kind: AgentKind,
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub on_threshold: f64,
    pub off_threshold: f64,
    pub period: Duration,
    pub retry_interval: Duration,
    pub read_timeout: Duration,
    /// BCM pin of the fan / relay output. `None` means no output.
    pub gpio: Option<u64>,
    pub thermal_path: PathBuf,
    pub serial_description: String,
    /// Explicit serial device; skips discovery.
    pub serial_port: Option<String>,
    pub baud_rate: u32,
}

impl AgentSettings {
    pub fn defaults(kind: AgentKind) -> Self {
        let mut settings = Self {
            kind,
            broker: "hx0.duckdns.org".to_string(),
            port: 1883,
            topic: "home/boat/cpu".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            on_threshold: 50.0,
            off_threshold: 45.0,
            period: Duration::from_secs(5),
            retry_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(3),
            gpio: Some(12),
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            serial_description: "SHT4x Trinkey M0".to_string(),
            serial_port: None,
            baud_rate: 9600,
        };

        if kind == AgentKind::Sht45 {
            settings.topic = "home/boat/usb_sht45".to_string();
            settings.period = Duration::from_secs(60);
            // a read waits for two line starts on a 1 s serial timeout
            settings.read_timeout = Duration::from_secs(25);
            // °F; only used when a relay is configured
            settings.on_threshold = 95.0;
            settings.off_threshold = 90.0;
            settings.gpio = None;
        }
        settings
    }

    /// Load and validate settings from file and process environment.
    pub fn load(kind: AgentKind) -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let mut settings = Self::defaults(kind);
        if let Some(path) = Self::config_file_path(kind) {
            if path.exists() {
                settings.apply_file(&path)?;
                info!("Loaded configuration from {}", path.display());
            }
        }
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// `BOATWATCH_CONFIG`, else the per-user config directory.
    pub fn config_file_path(kind: AgentKind) -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BOATWATCH_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let mut path = dirs::config_dir()?;
        path.push("boatwatch");
        path.push(format!("{}.toml", kind.name()));
        Some(path)
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let file: SettingsFile = toml::from_str(&content).map_err(|e| file_error(e.to_string()))?;
        file.apply(self);
        Ok(())
    }

    pub fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(broker) = var("BOATWATCH_BROKER") {
            self.broker = broker;
        }
        if let Some(port) = var("BOATWATCH_PORT") {
            self.port = parse_var("BOATWATCH_PORT", &port)?;
        }
        if let Some(topic) = var("BOATWATCH_TOPIC") {
            self.topic = topic;
        }
        if let Some(on) = var("BOATWATCH_ON_THRESHOLD") {
            self.on_threshold = parse_var("BOATWATCH_ON_THRESHOLD", &on)?;
        }
        if let Some(off) = var("BOATWATCH_OFF_THRESHOLD") {
            self.off_threshold = parse_var("BOATWATCH_OFF_THRESHOLD", &off)?;
        }
        if let Some(secs) = var("BOATWATCH_PERIOD_SECS") {
            self.period = Duration::from_secs(parse_var("BOATWATCH_PERIOD_SECS", &secs)?);
        }
        if let Some(secs) = var("BOATWATCH_RETRY_SECS") {
            self.retry_interval = Duration::from_secs(parse_var("BOATWATCH_RETRY_SECS", &secs)?);
        }
        if let Some(pin) = var("BOATWATCH_GPIO") {
            self.gpio = Some(parse_var("BOATWATCH_GPIO", &pin)?);
        }
        if let Some(port) = var("BOATWATCH_SERIAL_PORT") {
            self.serial_port = Some(port);
        }

        if let (Some(username), Some(password)) = (var("MQTT_USERNAME"), var("MQTT_PASSWORD")) {
            self.credentials = Some(Credentials { username, password });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.is_none() {
            return Err(ConfigError::MissingCredentials);
        }
        self.thresholds()?;
        for (key, value) in [
            ("period", self.period),
            ("retry_interval", self.retry_interval),
            ("read_timeout", self.read_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Thresholds::new(self.on_threshold, self.off_threshold)
    }

    pub fn timing(&self) -> LoopTiming {
        LoopTiming {
            period: self.period,
            read_timeout: self.read_timeout,
            retry_interval: self.retry_interval,
        }
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// On-disk TOML shape. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    broker: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    keep_alive_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    on_threshold: Option<f64>,
    off_threshold: Option<f64>,
    period_secs: Option<u64>,
    retry_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    gpio: Option<u64>,
    thermal_path: Option<PathBuf>,
    serial_description: Option<String>,
    serial_port: Option<String>,
    baud_rate: Option<u32>,
}

impl SettingsFile {
    fn apply(self, settings: &mut AgentSettings) {
        let secs = Duration::from_secs;
        if let Some(v) = self.broker {
            settings.broker = v;
        }
        if let Some(v) = self.port {
            settings.port = v;
        }
        if let Some(v) = self.topic {
            settings.topic = v;
        }
        if let Some(v) = self.keep_alive_secs {
            settings.keep_alive = secs(v);
        }
        if let Some(v) = self.connect_timeout_secs {
            settings.connect_timeout = secs(v);
        }
        if let Some(v) = self.on_threshold {
            settings.on_threshold = v;
        }
        if let Some(v) = self.off_threshold {
            settings.off_threshold = v;
        }
        if let Some(v) = self.period_secs {
            settings.period = secs(v);
        }
        if let Some(v) = self.retry_secs {
            settings.retry_interval = secs(v);
        }
        if let Some(v) = self.read_timeout_secs {
            settings.read_timeout = secs(v);
        }
        if let Some(v) = self.gpio {
            settings.gpio = Some(v);
        }
        if let Some(v) = self.thermal_path {
            settings.thermal_path = v;
        }
        if let Some(v) = self.serial_description {
            settings.serial_description = v;
        }
        if let Some(v) = self.serial_port {
            settings.serial_port = Some(v);
        }
        if let Some(v) = self.baud_rate {
            settings.baud_rate = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_per_agent() {
        let fan = AgentSettings::defaults(AgentKind::Fan);
        assert_eq!(fan.topic, "home/boat/cpu");
        assert_eq!(fan.period, Duration::from_secs(5));
        assert_eq!(fan.gpio, Some(12));

        let sht = AgentSettings::defaults(AgentKind::Sht45);
        assert_eq!(sht.topic, "home/boat/usb_sht45");
        assert_eq!(sht.period, Duration::from_secs(60));
        assert_eq!(sht.gpio, None);
        assert!(sht.read_timeout < sht.period);
        assert_eq!(sht.read_timeout, Duration::from_secs(25));
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        settings.apply_env(env(&[("MQTT_USERNAME", "boat")])).unwrap();
        assert!(matches!(settings.validate(), Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        settings
            .apply_env(env(&[
                ("MQTT_USERNAME", "boat"),
                ("MQTT_PASSWORD", "hunter2"),
                ("BOATWATCH_PORT", "8883"),
                ("BOATWATCH_ON_THRESHOLD", "60"),
                ("BOATWATCH_OFF_THRESHOLD", "55.5"),
            ]))
            .unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.port, 8883);
        let thresholds = settings.thresholds().unwrap();
        assert_eq!((thresholds.on(), thresholds.off()), (60.0, 55.5));
    }

    #[test]
    fn test_invalid_numeric_env() {
        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        let err = settings
            .apply_env(env(&[("BOATWATCH_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BOATWATCH_PORT"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        settings
            .apply_env(env(&[
                ("MQTT_USERNAME", "boat"),
                ("MQTT_PASSWORD", "hunter2"),
                ("BOATWATCH_ON_THRESHOLD", "40"),
            ]))
            .unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            username: "boat".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("boat"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boatwatch-fan.toml");
        std::fs::write(&path, "broker = \"localhost\"\nperiod_secs = 10\ngpio = 18\n").unwrap();

        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        settings.apply_file(&path).unwrap();
        assert_eq!(settings.broker, "localhost");
        assert_eq!(settings.period, Duration::from_secs(10));
        assert_eq!(settings.gpio, Some(18));
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "brokr = \"typo\"\n").unwrap();

        let mut settings = AgentSettings::defaults(AgentKind::Fan);
        assert!(matches!(
            settings.apply_file(&path),
            Err(ConfigError::File { .. })
        ));
    }
}
