//! Simulator configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smanager_common::codec::DELIMITER;
use smanager_common::{LoggingConfig, MqttConfig};

use crate::devices::{DeviceEntry, DeviceTable};
use crate::error::{Result, SimulatorError};

/// Synthetic publisher settings.
///
/// Embedded as the `simulator` section of both the exporter and the
/// standalone simulator configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Run the synthetic publisher inside the exporter (default: false).
    /// The standalone binary ignores this flag.
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between publish cycles (default: 8).
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Delay between two publishes of the same cycle, in milliseconds (default: 1000).
    #[serde(default = "default_message_spacing")]
    pub message_spacing_ms: u64,

    /// Simulated devices, in publish order.
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceEntry>,
}

fn default_cycle_interval() -> u64 {
    8
}

fn default_message_spacing() -> u64 {
    1000
}

fn default_devices() -> Vec<DeviceEntry> {
    DeviceTable::default().devices().to_vec()
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cycle_interval_secs: default_cycle_interval(),
            message_spacing_ms: default_message_spacing(),
            devices: default_devices(),
        }
    }
}

impl SimulatorConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn message_spacing(&self) -> Duration {
        Duration::from_millis(self.message_spacing_ms)
    }

    /// Build the device table.
    pub fn device_table(&self) -> DeviceTable {
        DeviceTable::new(self.devices.clone())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cycle_interval_secs == 0 {
            return Err(SimulatorError::validation("cycle_interval_secs must be > 0"));
        }

        if self.devices.is_empty() {
            return Err(SimulatorError::validation(
                "At least one simulated device required",
            ));
        }

        for device in &self.devices {
            let fields = [&device.device_id, &device.room, &device.device_type];
            if fields.iter().any(|f| f.contains(DELIMITER)) {
                return Err(SimulatorError::validation(format!(
                    "Device fields must not contain '{}': {}/{}/{}",
                    DELIMITER,
                    device.room,
                    device.device_id,
                    device.device_type
                )));
            }
        }

        Ok(())
    }
}

/// Configuration of the standalone simulator binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorAppConfig {
    /// MQTT connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Synthetic publisher settings.
    #[serde(default)]
    pub simulator: SimulatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SimulatorAppConfig {
    /// Load configuration from a JSON5 file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(SimulatorError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    ///
    /// Not validated: CLI overrides may still correct it, so callers run
    /// [`validate`](Self::validate) once they are applied.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(json5::from_str(content)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.simulator.validate()
    }
}
