//! Prometheus exporter for smart-home energy readings.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use smanager_common::{Connection, ConnectionEvent, LogFormat, connect};
use smanager_simulator::SyntheticPublisher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use smanager_exporter::{ExporterConfig, HttpServer, IngestionPipeline, MetricsRegistry};

/// Prometheus exporter for smart-home energy readings.
#[derive(Parser, Debug)]
#[command(name = "smanager-exporter")]
#[command(about = "Export smart-home energy readings as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config and METRICS_PORT).
    #[arg(long)]
    listen: Option<String>,

    /// MQTT broker address (overrides config and MQTT_BROKER).
    #[arg(long)]
    broker: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    let ignored_env = config.apply_env();

    // CLI overrides
    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }
    if let Some(broker) = args.broker {
        config.mqtt.broker = broker;
    }
    config.validate()?;

    // Initialize logging
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("smanager_exporter={}", log_level).parse()?)
        .add_directive(format!("smanager_common={}", log_level).parse()?)
        .add_directive(format!("smanager_simulator={}", log_level).parse()?)
        .add_directive(format!("rumqttc={}", Level::WARN).parse()?);

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    for ignored in &ignored_env {
        warn!(
            variable = ignored.variable,
            value = %ignored.value,
            "Ignoring unparsable environment override"
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mock_publisher = config.simulator.enabled,
        "Starting home-smanager exporter"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(MetricsRegistry::new(config.prometheus.prefix.clone()));

    // Bind first: a port conflict aborts startup
    let http_server = match HttpServer::bind(
        registry.clone(),
        config.listen_addr()?,
        config.prometheus.path.clone(),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start HTTP server");
            return Err(e);
        }
    };

    let connection = Arc::new(connect_or_log(&config, "subscriber").await?);

    let mut event_tasks = vec![tokio::spawn(log_connection_events(
        "subscriber",
        connection.events(),
        shutdown_rx.clone(),
    ))];

    // Start ingestion
    let pipeline = Arc::new(IngestionPipeline::new(
        registry.clone(),
        config.mqtt.topic.clone(),
        config.mqtt.qos,
    ));
    let mut pipeline_task = {
        let pipeline = pipeline.clone();
        let connection = connection.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { pipeline.run(&connection, shutdown).await })
    };

    // Start the synthetic publisher on its own connection
    let mut publisher: Option<(Arc<Connection>, JoinHandle<()>)> = None;
    if config.simulator.enabled {
        let publisher_connection = Arc::new(connect_or_log(&config, "publisher").await?);
        event_tasks.push(tokio::spawn(log_connection_events(
            "publisher",
            publisher_connection.events(),
            shutdown_rx.clone(),
        )));

        let synthetic = SyntheticPublisher::new(
            publisher_connection.clone(),
            config.simulator.device_table(),
            config.mqtt.topic.clone(),
            config.mqtt.qos,
        )
        .with_message_spacing(config.simulator.message_spacing());

        let interval = config.simulator.cycle_interval();
        let shutdown = shutdown_rx.clone();
        let task = tokio::spawn(async move { synthetic.run(interval, shutdown).await });
        publisher = Some((publisher_connection, task));
    }

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for a shutdown signal, or for the pipeline to fail
    let mut failure = None;
    let pipeline_finished = tokio::select! {
        _ = shutdown_signal() => false,
        result = &mut pipeline_task => {
            match result {
                Ok(Ok(())) => warn!("Pipeline stopped, shutting down..."),
                Ok(Err(e)) => {
                    error!(error = %e, topic = %config.mqtt.topic, "Failed to subscribe");
                    failure = Some(anyhow::Error::from(e));
                }
                Err(e) => {
                    error!(error = %e, "Pipeline task failed");
                    failure = Some(anyhow::anyhow!("Pipeline task failed: {}", e));
                }
            }
            true
        }
    };

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if !pipeline_finished {
            let _ = pipeline_task.await;
        }
        if let Some((_, task)) = publisher.as_mut() {
            let _ = task.await;
        }
        let _ = http_task.await;
        for task in event_tasks {
            let _ = task.await;
        }
    })
    .await;

    let grace = config.shutdown_grace();
    connection.disconnect(grace).await;
    if let Some((publisher_connection, _)) = &publisher {
        publisher_connection.disconnect(grace).await;
    }

    // Print final stats
    let stats = pipeline.stats();
    info!(
        messages_received = stats.messages_received,
        readings_accepted = stats.readings_accepted,
        decode_failures = stats.decode_failures,
        apply_rejections = stats.apply_rejections,
        renewal_failures = stats.renewal_failures,
        series_count = registry.series_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Open an MQTT session, logging the failure before returning it.
async fn connect_or_log(config: &ExporterConfig, role: &str) -> anyhow::Result<Connection> {
    match connect(&config.mqtt).await {
        Ok(connection) => {
            info!(
                role,
                client_id = %connection.client_id(),
                broker = %connection.broker(),
                "Connected to MQTT broker"
            );
            Ok(connection)
        }
        Err(e) => {
            error!(role, error = %e, "Failed to connect to MQTT broker");
            Err(e.into())
        }
    }
}

/// Log connection lifecycle events until shutdown.
async fn log_connection_events(
    role: &'static str,
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let event = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(ConnectionEvent::Connected { session_present }) => {
                info!(role, session_present, "Connected to MQTT broker");
            }
            Ok(ConnectionEvent::ConnectionLost { reason }) => {
                warn!(role, reason = %reason, "Connection lost");
            }
            Ok(ConnectionEvent::Reconnecting {
                attempt,
                max_attempts,
            }) => {
                info!(role, attempt, max_attempts, "Reconnecting to MQTT broker");
            }
            Ok(ConnectionEvent::GaveUp { attempts }) => {
                error!(role, attempts, "Giving up on MQTT broker");
            }
            Ok(ConnectionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
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
