//! home-smanager device simulator
//!
//! Mimics a fleet of smart-home devices publishing energy readings over MQTT,
//! so the exporter pipeline can be exercised without real hardware.
//!
//! - [`DeviceTable`] - the ordered set of simulated devices
//! - [`SyntheticPublisher`] - one reading per device per cycle, spaced out
//! - [`PublishSink`] - where readings go (an MQTT [`Connection`](smanager_common::Connection) in production)
//! - [`SimulatorConfig`] - cadence and device table, embeddable in other configs
//!
//! # Example
//!
//! ```ignore
//! use smanager_simulator::{DeviceTable, SyntheticPublisher};
//!
//! let connection = smanager_common::connect(&mqtt).await?;
//! let publisher = SyntheticPublisher::new(connection, DeviceTable::default(), topic, qos);
//! publisher.run(Duration::from_secs(8), shutdown_rx).await;
//! ```

mod args;
mod config;
mod devices;
mod error;
mod publisher;

pub use args::SimulatorArgs;
pub use config::{SimulatorAppConfig, SimulatorConfig};
pub use devices::{DEFAULT_DEVICE_TYPE, DeviceEntry, DeviceTable};
pub use error::{Result, SimulatorError};
pub use publisher::{MAX_CONSUMPTION, PublishSink, PublishStats, SyntheticPublisher};
