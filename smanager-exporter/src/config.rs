//! Configuration for the energy exporter.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smanager_common::{LoggingConfig, MqttConfig, parse_bool};
use smanager_simulator::SimulatorConfig;
use thiserror::Error;

/// Toggles the built-in synthetic publisher.
pub const ENV_ENABLE_MOCK_PUBLISHER: &str = "ENABLE_MOCK_PUBLISHER";

/// Broker address override.
pub const ENV_MQTT_BROKER: &str = "MQTT_BROKER";

/// Exposition port override.
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// An environment override that was present but could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredOverride {
    pub variable: &'static str,
    pub value: String,
}

impl IgnoredOverride {
    fn new(variable: &'static str, value: String) -> Self {
        Self { variable, value }
    }
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// MQTT connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Built-in synthetic publisher.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Time given to MQTT sessions to flush on shutdown (default: 250).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Prefix of the exporter's own metrics (default: "home_smanager").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "home_smanager".to_string()
}

fn default_shutdown_grace() -> u64 {
    250
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            prometheus: PrometheusConfig::default(),
            simulator: SimulatorConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    ///
    /// Not validated: environment and CLI overrides may still correct it,
    /// so callers run [`validate`](Self::validate) once they are applied.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    ///
    /// Returns the overrides that could not be parsed; the caller logs them
    /// once tracing is up.
    pub fn apply_env(&mut self) -> Vec<IgnoredOverride> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// An unparsable `ENABLE_MOCK_PUBLISHER` or `METRICS_PORT` is ignored,
    /// the current value kept, and the variable reported back.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Vec<IgnoredOverride>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();

        if let Some(value) = lookup(ENV_ENABLE_MOCK_PUBLISHER) {
            match parse_bool(&value) {
                Some(enabled) => self.simulator.enabled = enabled,
                None => ignored.push(IgnoredOverride::new(ENV_ENABLE_MOCK_PUBLISHER, value)),
            }
        }

        if let Some(broker) = lookup(ENV_MQTT_BROKER)
            && !broker.trim().is_empty()
        {
            self.mqtt.broker = broker.trim().to_string();
        }

        if let Some(value) = lookup(ENV_METRICS_PORT) {
            match value.trim().parse::<u16>() {
                Ok(port) => self.set_listen_port(port),
                Err(_) => ignored.push(IgnoredOverride::new(ENV_METRICS_PORT, value)),
            }
        }

        ignored
    }

    /// Replace the port of the listen address, keeping its host.
    pub fn set_listen_port(&mut self, port: u16) {
        self.prometheus.listen = match self.prometheus.listen.parse::<SocketAddr>() {
            Ok(mut addr) => {
                addr.set_port(port);
                addr.to_string()
            }
            Err(_) => format!("0.0.0.0:{}", port),
        };
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.prometheus.listen.parse().map_err(|_| {
            ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            ))
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        // Validate listen address format
        self.listen_addr()?;

        // Validate path starts with /
        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.prometheus.path == "/health" || self.prometheus.path == "/ready" {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} collides with a built-in route",
                self.prometheus.path
            )));
        }

        if self.prometheus.prefix.is_empty()
            || !self
                .prometheus
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: '{}'",
                self.prometheus.prefix
            )));
        }

        if self.simulator.enabled {
            self.simulator
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }

        Ok(())
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
    fn test_parse_minimal_config() {
        let json = "{}";
        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.prometheus.listen, "0.0.0.0:8080");
        assert_eq!(config.prometheus.path, "/metrics");
        assert_eq!(config.prometheus.prefix, "home_smanager");
        assert_eq!(config.mqtt.broker, "localhost:1883");
        assert_eq!(config.mqtt.topic, "home-smanager/test");
        assert!(!config.simulator.enabled);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            mqtt: {
                broker: "tcp://broker.lan:1884",
                topic: "home/energy",
                qos: 2,
                reconnect: { max_attempts: 0 }
            },
            prometheus: {
                listen: "127.0.0.1:9091",
                path: "/prometheus/metrics",
                prefix: "myhome"
            },
            simulator: {
                enabled: true,
                cycle_interval_secs: 4
            },
            logging: {
                level: "debug",
                format: "json"
            },
            shutdown_grace_ms: 500
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.mqtt.broker, "tcp://broker.lan:1884");
        assert_eq!(config.mqtt.topic, "home/energy");
        assert_eq!(config.mqtt.qos, smanager_common::Qos::ExactlyOnce);
        assert_eq!(config.mqtt.reconnect.max_attempts, 0);
        assert_eq!(config.prometheus.listen, "127.0.0.1:9091");
        assert_eq!(config.prometheus.path, "/prometheus/metrics");
        assert_eq!(config.prometheus.prefix, "myhome");
        assert!(config.simulator.enabled);
        assert_eq!(config.simulator.cycle_interval_secs, 4);
        assert_eq!(config.simulator.devices.len(), 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, smanager_common::LogFormat::Json);
        assert_eq!(config.shutdown_grace_ms, 500);
    }

    #[test]
    fn test_validate_invalid_listen() {
        let json = r#"{
            prometheus: { listen: "not-an-address" }
        }"#;

        let result = ExporterConfig::parse(json).unwrap().validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Invalid listen address")
        );
    }

    #[test]
    fn test_validate_invalid_path() {
        let json = r#"{
            prometheus: { path: "no-leading-slash" }
        }"#;

        let result = ExporterConfig::parse(json).unwrap().validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("must start with /")
        );
    }

    #[test]
    fn test_validate_path_collision() {
        let config = ExporterConfig::parse(r#"{ prometheus: { path: "/health" } }"#).unwrap();
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_invalid_prefix() {
        let config = ExporterConfig::parse(r#"{ prometheus: { prefix: "my-home" } }"#).unwrap();
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_invalid_broker() {
        let config = ExporterConfig::parse(r#"{ mqtt: { broker: "host:notaport" } }"#).unwrap();
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_disabled_simulator_not_validated() {
        let json = r#"{ simulator: { enabled: false, cycle_interval_secs: 0 } }"#;
        assert!(ExporterConfig::parse(json).unwrap().validate().is_ok());

        let json = r#"{ simulator: { enabled: true, cycle_interval_secs: 0 } }"#;
        assert!(ExporterConfig::parse(json).unwrap().validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        let result = ExporterConfig::parse("{ mqtt: ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_enable_mock_publisher() {
        for value in ["1", "t", "T", "true", "TRUE", "True"] {
            let mut config = ExporterConfig::default();
            config.apply_env_with(env(&[(ENV_ENABLE_MOCK_PUBLISHER, value)]));
            assert!(config.simulator.enabled, "{} should enable", value);
        }

        for value in ["0", "f", "false", "FALSE"] {
            let mut config = ExporterConfig::default();
            config.simulator.enabled = true;
            config.apply_env_with(env(&[(ENV_ENABLE_MOCK_PUBLISHER, value)]));
            assert!(!config.simulator.enabled, "{} should disable", value);
        }
    }

    #[test]
    fn test_env_unparsable_bool_keeps_default() {
        let mut config = ExporterConfig::default();
        let ignored = config.apply_env_with(env(&[(ENV_ENABLE_MOCK_PUBLISHER, "yes please")]));
        assert!(!config.simulator.enabled);
        assert_eq!(
            ignored,
            vec![IgnoredOverride::new(
                ENV_ENABLE_MOCK_PUBLISHER,
                "yes please".to_string()
            )]
        );
    }

    #[test]
    fn test_env_broker_and_port() {
        let mut config = ExporterConfig::default();
        config.apply_env_with(env(&[
            (ENV_MQTT_BROKER, "tcp://mosquitto:1883"),
            (ENV_METRICS_PORT, "9100"),
        ]));

        assert_eq!(config.mqtt.broker, "tcp://mosquitto:1883");
        assert_eq!(config.prometheus.listen, "0.0.0.0:9100");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_port_keeps_host() {
        let mut config = ExporterConfig::default();
        config.prometheus.listen = "127.0.0.1:8080".to_string();
        config.apply_env_with(env(&[(ENV_METRICS_PORT, "9000")]));
        assert_eq!(config.prometheus.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_env_invalid_port_ignored() {
        let mut config = ExporterConfig::default();
        let ignored = config.apply_env_with(env(&[(ENV_METRICS_PORT, "99999")]));
        assert_eq!(config.prometheus.listen, "0.0.0.0:8080");
        assert_eq!(ignored.len(), 1);
        assert_eq!(ignored[0].variable, ENV_METRICS_PORT);
        assert_eq!(ignored[0].value, "99999");
    }

    #[test]
    fn test_env_valid_overrides_report_nothing() {
        let mut config = ExporterConfig::default();
        let ignored = config.apply_env_with(env(&[
            (ENV_ENABLE_MOCK_PUBLISHER, "true"),
            (ENV_METRICS_PORT, "9100"),
        ]));
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_file_value_corrected_by_env_override() {
        let mut config =
            ExporterConfig::parse(r#"{ mqtt: { broker: "host:notaport" } }"#).unwrap();
        assert!(config.validate().is_err());

        config.apply_env_with(env(&[(ENV_MQTT_BROKER, "mosquitto:1883")]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_absent_changes_nothing() {
        let mut config = ExporterConfig::default();
        config.apply_env_with(env(&[]));
        assert_eq!(config.mqtt.broker, "localhost:1883");
        assert_eq!(config.prometheus.listen, "0.0.0.0:8080");
        assert!(!config.simulator.enabled);
    }
}
