//! Prometheus exporter for smart-home energy readings.
//!
//! This crate subscribes to device readings published over MQTT, aggregates
//! them per `(device, room, type)` and exposes the result via an HTTP
//! `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT Broker   │────>│    Pipeline     │────>│    Registry     │────>│   HTTP Server   │
//! │ (readings topic)│     │ (decode, apply) │     │ (total/current) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! With `ENABLE_MOCK_PUBLISHER=true` the exporter also runs the synthetic
//! device publisher from `smanager-simulator` on a second connection.
//!
//! # Usage
//!
//! ```bash
//! smanager-exporter --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod registry;
pub mod subscriber;

pub use config::{ConfigError, ExporterConfig, IgnoredOverride};
pub use http::HttpServer;
pub use registry::{ApplyError, MetricsRegistry, SeriesSnapshot, SharedRegistry};
pub use subscriber::{IngestError, IngestionPipeline, PipelineState, PipelineStats};
