//! CLI arguments for the standalone simulator.

use std::path::PathBuf;

use clap::Parser;

/// Publish synthetic smart-home energy readings to an MQTT broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "smanager-simulator")]
#[command(version)]
pub struct SimulatorArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Broker address (overrides config).
    #[arg(long)]
    pub broker: Option<String>,

    /// Seconds between publish cycles (overrides config).
    #[arg(long)]
    pub interval: Option<u64>,

    /// Publish a single cycle and exit.
    #[arg(long)]
    pub once: bool,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}
