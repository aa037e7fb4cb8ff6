use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Topic shared by the ingestion pipeline and the simulator.
pub const DEFAULT_TOPIC: &str = "home-smanager/test";

/// MQTT quality-of-service level, serialized as `0`, `1` or `2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("Invalid QoS level: {}. Expected 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Reconnection policy applied after an established connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts before giving up. `0` disables reconnection.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts (milliseconds).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    2000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// MQTT connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address as `host:port`, optionally prefixed by `tcp://` or `mqtt://`.
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Prefix of the generated client identity.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Topic carrying energy readings.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// QoS used for subscriptions and publishes.
    #[serde(default)]
    pub qos: Qos,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval (seconds).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// How long to wait for the broker's CONNACK (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// How long to wait for a PUBACK/SUBACK (seconds).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,

    /// Capacity of the client request and incoming message channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_broker() -> String {
    "localhost:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "home_smanager_client".to_string()
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ack_timeout() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id_prefix: default_client_id_prefix(),
            topic: default_topic(),
            qos: Qos::default(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            channel_capacity: default_channel_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Split the broker address into host and port.
    ///
    /// A missing port defaults to 1883.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let address = self
            .broker
            .trim()
            .trim_start_matches("tcp://")
            .trim_start_matches("mqtt://");

        if address.is_empty() {
            return Err(Error::Config("Broker address is empty".to_string()));
        }

        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Config(format!("Invalid broker port in '{}'", self.broker))
                })?;
                if host.is_empty() {
                    return Err(Error::Config(format!(
                        "Missing broker host in '{}'",
                        self.broker
                    )));
                }
                Ok((host.to_string(), port))
            }
            None => Ok((address.to_string(), 1883)),
        }
    }

    /// Validate the MQTT settings.
    pub fn validate(&self) -> Result<()> {
        self.host_port()?;

        if self.topic.is_empty() {
            return Err(Error::Config("MQTT topic must not be empty".to_string()));
        }
        if self.topic.contains(['+', '#']) {
            return Err(Error::Config(format!(
                "MQTT topic must not contain wildcards: '{}'",
                self.topic
            )));
        }
        if self.client_id_prefix.is_empty() {
            return Err(Error::Config(
                "client_id_prefix must not be empty".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.ack_timeout_secs == 0 {
            return Err(Error::Config("MQTT timeouts must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Parse an environment-style boolean.
///
/// Accepts the usual spellings (`1`, `t`, `true`, `TRUE`, `True` and their
/// false counterparts). Anything else yields `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        mqtt: MqttConfig,
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_mqtt_config() {
        let json5 = r#"
        {
            mqtt: {
                broker: "tcp://broker.local:1884",
                topic: "home/energy",
                qos: 2,
                reconnect: { max_attempts: 0 },
            },
            logging: {
                level: "debug",
            },
        }
        "#;

        let config: TestConfig = parse_config(json5).unwrap();

        assert_eq!(
            config.mqtt.host_port().unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(config.mqtt.topic, "home/energy");
        assert_eq!(config.mqtt.qos, Qos::ExactlyOnce);
        assert_eq!(config.mqtt.reconnect.max_attempts, 0);
        assert_eq!(config.mqtt.reconnect.backoff_ms, 2000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_default_config() {
        let config: TestConfig = parse_config("{}").unwrap();

        assert_eq!(config.mqtt.broker, "localhost:1883");
        assert_eq!(config.mqtt.topic, DEFAULT_TOPIC);
        assert_eq!(config.mqtt.qos, Qos::AtLeastOnce);
        assert_eq!(config.mqtt.client_id_prefix, "home_smanager_client");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.mqtt.validate().is_ok());
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let result: Result<TestConfig> = parse_config("{ mqtt: { qos: 3 } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_host_port() {
        let mut config = MqttConfig::default();
        assert_eq!(config.host_port().unwrap(), ("localhost".to_string(), 1883));

        config.broker = "mqtt://10.0.0.5".to_string();
        assert_eq!(config.host_port().unwrap(), ("10.0.0.5".to_string(), 1883));

        config.broker = "localhost:notaport".to_string();
        assert!(config.host_port().is_err());

        config.broker = ":1883".to_string();
        assert!(config.host_port().is_err());

        config.broker = "".to_string();
        assert!(config.host_port().is_err());
    }

    #[test]
    fn test_validate_rejects_wildcard_topic() {
        let config = MqttConfig {
            topic: "home/#".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_json_logging_format() {
        let config: TestConfig =
            parse_config(r#"{ logging: { level: "debug", format: "json" } }"#).unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
