//! Standalone smart-home device simulator.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use smanager_common::{LoggingConfig, connect, init_tracing};
use smanager_simulator::{SimulatorAppConfig, SimulatorArgs, SyntheticPublisher};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Time given to in-flight acknowledgements when disconnecting.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SimulatorArgs::parse();

    let mut config = match &args.config {
        Some(path) => SimulatorAppConfig::load(path)?,
        None => SimulatorAppConfig::default(),
    };

    if let Some(broker) = args.broker {
        config.mqtt.broker = broker;
    }
    if let Some(interval) = args.interval {
        config.simulator.cycle_interval_secs = interval;
    }
    config.validate()?;

    let log_config = match args.log_level {
        Some(level) => LoggingConfig {
            level,
            ..config.logging.clone()
        },
        None => config.logging.clone(),
    };
    init_tracing(&log_config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.mqtt.broker,
        topic = %config.mqtt.topic,
        devices = config.simulator.devices.len(),
        "Starting home-smanager simulator"
    );

    let connection = match connect(&config.mqtt).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            error!(error = %e, "Failed to connect to MQTT broker");
            return Err(e.into());
        }
    };
    info!(client_id = %connection.client_id(), "Connected to MQTT broker");

    let publisher = SyntheticPublisher::new(
        connection.clone(),
        config.simulator.device_table(),
        config.mqtt.topic.clone(),
        config.mqtt.qos,
    )
    .with_message_spacing(config.simulator.message_spacing());

    if args.once {
        let stats = publisher.run_cycle().await;
        info!(
            success = stats.success,
            failed = stats.failed,
            "Single cycle completed"
        );
        connection.disconnect(SHUTDOWN_GRACE).await;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.simulator.cycle_interval();
    let mut publisher_task = tokio::spawn(async move {
        publisher.run(interval, shutdown_rx).await;
    });

    let publisher_finished = tokio::select! {
        _ = shutdown_signal() => false,
        _ = &mut publisher_task => {
            warn!("Publisher stopped unexpectedly");
            true
        }
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    if !publisher_finished
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut publisher_task)
            .await
            .is_err()
    {
        publisher_task.abort();
    }

    connection.disconnect(SHUTDOWN_GRACE).await;

    info!("Simulator stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
