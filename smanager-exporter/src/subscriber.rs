//! MQTT ingestion pipeline feeding energy readings into the registry.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use parking_lot::RwLock;
use smanager_common::{
    Connection, ConnectionEvent, DecodeError, IncomingMessage, Qos, Reading, SubscribeError,
    decode,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::registry::{ApplyError, SharedRegistry};

/// Lifecycle of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, not yet subscribed.
    Idle,
    /// Waiting for the broker's SUBACK.
    Subscribing,
    /// Waiting for messages.
    Subscribed,
    /// Parsing a payload.
    Decoding,
    /// Folding a reading into the registry.
    Applying,
    /// Stopped; no more messages are processed.
    Unsubscribed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Subscribing => "subscribing",
            PipelineState::Subscribed => "subscribed",
            PipelineState::Decoding => "decoding",
            PipelineState::Applying => "applying",
            PipelineState::Unsubscribed => "unsubscribed",
        };
        f.write_str(s)
    }
}

/// Delay before the first retry of a failed subscription renewal.
const RENEWAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound of the renewal backoff.
const RENEWAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A subscription renewal in progress.
type Renewal<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Why a single message was discarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Pipeline statistics.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Messages handed to the pipeline.
    pub messages_received: u64,
    /// Readings folded into the registry.
    pub readings_accepted: u64,
    /// Payloads that failed to decode.
    pub decode_failures: u64,
    /// Decoded readings refused by the registry.
    pub apply_rejections: u64,
    /// Failed attempts to renew the subscription after a reconnect.
    pub renewal_failures: u64,
}

/// Subscribes to the readings topic and applies every valid reading to the registry.
pub struct IngestionPipeline {
    registry: SharedRegistry,
    topic: String,
    qos: Qos,
    state: RwLock<PipelineState>,
    stats: RwLock<PipelineStats>,
}

impl IngestionPipeline {
    /// Create a new pipeline.
    pub fn new(registry: SharedRegistry, topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            registry,
            topic: topic.into(),
            qos,
            state: RwLock::new(PipelineState::Idle),
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// Get pipeline statistics.
    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    /// Decode one payload and apply it to the registry.
    ///
    /// Failures are logged and counted; the caller only needs the result
    /// for inspection.
    pub fn handle_payload(&self, payload: &[u8]) -> Result<Reading, IngestError> {
        let resume = self.state();
        self.stats.write().messages_received += 1;

        self.set_state(PipelineState::Decoding);
        let reading = match decode(payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.write().decode_failures += 1;
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Discarding malformed payload"
                );
                self.set_state(resume);
                return Err(e.into());
            }
        };

        self.set_state(PipelineState::Applying);
        if let Err(e) = self.registry.apply(&reading) {
            self.stats.write().apply_rejections += 1;
            warn!(error = %e, "Discarding rejected reading");
            self.set_state(resume);
            return Err(e.into());
        }

        self.stats.write().readings_accepted += 1;
        info!(
            device = %reading.device_id,
            room = %reading.room,
            device_type = %reading.device_type,
            energy = reading.energy_consumption,
            "Reading received"
        );

        self.set_state(resume);
        Ok(reading)
    }

    /// Process messages from `messages` until shutdown or the end of the stream.
    pub async fn consume(
        &self,
        messages: mpsc::Receiver<IncomingMessage>,
        shutdown: watch::Receiver<bool>,
    ) {
        if self.state() == PipelineState::Idle {
            self.set_state(PipelineState::Subscribed);
        }
        self.drive(messages, None, shutdown).await;
    }

    /// Subscribe on `connection` and process its messages until shutdown.
    ///
    /// The subscription is renewed whenever the connection reports a
    /// (re)connect, retrying with backoff until the broker grants it. Once
    /// the connection is gone for good the pipeline stays `Unsubscribed`
    /// and waits for shutdown, leaving the registry as it was. Only the
    /// initial subscription failure is returned.
    pub async fn run(
        &self,
        connection: &Connection,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), SubscribeError> {
        let messages = connection.take_messages().ok_or(SubscribeError::Closed)?;
        // Listen before subscribing so no reconnect is missed
        let events = connection.events();

        if let Err(e) = self.subscribe(connection).await {
            self.set_state(PipelineState::Unsubscribed);
            return Err(e);
        }

        self.drive(messages, Some((connection, events)), shutdown).await;
        Ok(())
    }

    async fn subscribe(&self, connection: &Connection) -> Result<(), SubscribeError> {
        self.set_state(PipelineState::Subscribing);
        connection.subscribe(&self.topic, self.qos).await?;
        self.set_state(PipelineState::Subscribed);

        info!(topic = %self.topic, qos = u8::from(self.qos), "Subscribed to readings topic");
        Ok(())
    }

    /// Renew the subscription after a reconnect.
    ///
    /// Retries with exponential backoff until the broker grants it or the
    /// connection is closed.
    async fn renew_subscription(&self, connection: &Connection) {
        let mut delay = RENEWAL_BACKOFF;

        loop {
            match self.subscribe(connection).await {
                Ok(()) => return,
                Err(SubscribeError::Closed) => {
                    debug!(topic = %self.topic, "Connection closed, abandoning subscription renewal");
                    return;
                }
                Err(e) => {
                    self.stats.write().renewal_failures += 1;
                    error!(
                        error = %e,
                        topic = %self.topic,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to renew subscription"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RENEWAL_BACKOFF_MAX);
                }
            }
        }
    }

    async fn drive(
        &self,
        mut messages: mpsc::Receiver<IncomingMessage>,
        mut connection: Option<(&Connection, broadcast::Receiver<ConnectionEvent>)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Pipeline started, waiting for readings...");

        let linked = connection.is_some();
        // Polled alongside the message stream so the driver never stalls
        // on a full channel while the SUBACK is pending
        let mut renewal: Option<Renewal<'_>> = None;

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping pipeline");
                        break;
                    }
                }

                () = poll_renewal(&mut renewal) => {
                    renewal = None;
                }

                event = recv_event(&mut connection) => {
                    match event {
                        Ok(ConnectionEvent::Connected { session_present }) => {
                            if let Some((conn, _)) = &connection {
                                debug!(
                                    session_present,
                                    "Connection re-established, renewing subscription"
                                );
                                renewal = Some(Box::pin(self.renew_subscription(*conn)));
                            }
                        }
                        Ok(ConnectionEvent::GaveUp { attempts }) => {
                            warn!(
                                attempts,
                                "Connection lost for good, no more readings will arrive"
                            );
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Missed connection events");
                        }
                        Err(RecvError::Closed) => {
                            connection = None;
                        }
                    }
                }

                message = messages.recv() => {
                    match message {
                        Some(message) => {
                            trace!(
                                topic = %message.topic,
                                len = message.payload.len(),
                                "Message received"
                            );
                            let _ = self.handle_payload(&message.payload);
                        }
                        None if linked => {
                            // The connection driver stopped; keep the last
                            // aggregates available until shutdown
                            drop(renewal.take());
                            self.set_state(PipelineState::Unsubscribed);
                            warn!("Message stream ended, serving last known values until shutdown");
                            wait_for_shutdown(&mut shutdown).await;
                            break;
                        }
                        None => {
                            info!("Message stream ended, stopping pipeline");
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(PipelineState::Unsubscribed);
        info!("Pipeline stopped");
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write() = state;
    }
}

/// Completion of the pending renewal, or never when there is none.
async fn poll_renewal(renewal: &mut Option<Renewal<'_>>) {
    match renewal {
        Some(renewal) => renewal.await,
        None => std::future::pending().await,
    }
}

/// Resolve once shutdown is signalled or its sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Next connection event, or never when there is no connection to watch.
async fn recv_event(
    connection: &mut Option<(&Connection, broadcast::Receiver<ConnectionEvent>)>,
) -> Result<ConnectionEvent, RecvError> {
    match connection {
        Some((_, events)) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricsRegistry;
    use smanager_common::LabelKey;
    use std::sync::Arc;
    use std::time::Duration;

    fn make_pipeline() -> (IngestionPipeline, SharedRegistry) {
        let registry = Arc::new(MetricsRegistry::new("home_smanager"));
        let pipeline =
            IngestionPipeline::new(registry.clone(), "home-smanager/test", Qos::AtLeastOnce);
        (pipeline, registry)
    }

    fn message(payload: &str) -> IncomingMessage {
        IncomingMessage {
            topic: "home-smanager/test".to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_handle_valid_payload() {
        let (pipeline, registry) = make_pipeline();

        let reading = pipeline
            .handle_payload(b"device1:living_room:sensor:12.50")
            .unwrap();
        assert_eq!(reading.energy_consumption, 12.5);

        let series = registry
            .get(&LabelKey::new("device1", "living_room", "sensor"))
            .unwrap();
        assert_eq!(series.total, 12.5);
        assert_eq!(pipeline.stats().readings_accepted, 1);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_handle_malformed_payload() {
        let (pipeline, registry) = make_pipeline();

        let result = pipeline.handle_payload(b"device1:living_room:sensor");
        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::MalformedPayload { fields: 3 }))
        ));

        let result = pipeline.handle_payload(b"device1:living_room:sensor:lots");
        assert!(matches!(
            result,
            Err(IngestError::Decode(DecodeError::InvalidNumber(_)))
        ));

        assert_eq!(registry.series_count(), 0);
        let stats = pipeline.stats();
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.decode_failures, 2);
    }

    #[test]
    fn test_handle_negative_payload() {
        let (pipeline, registry) = make_pipeline();

        let result = pipeline.handle_payload(b"device1:kitchen:sensor:-3");
        assert!(matches!(
            result,
            Err(IngestError::Apply(ApplyError::NegativeConsumption { .. }))
        ));
        assert_eq!(pipeline.stats().apply_rejections, 1);
        assert_eq!(registry.series_count(), 0);
    }

    #[tokio::test]
    async fn test_consume_until_stream_ends() {
        let (pipeline, registry) = make_pipeline();
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(message("device1:living_room:sensor:12.50")).await.unwrap();
        tx.send(message("garbage")).await.unwrap();
        tx.send(message("device1:living_room:sensor:7.25")).await.unwrap();
        drop(tx);

        pipeline.consume(rx, shutdown_rx).await;

        let series = registry
            .get(&LabelKey::new("device1", "living_room", "sensor"))
            .unwrap();
        assert_eq!(series.current, 7.25);
        assert_eq!(series.total, 19.75);

        let stats = pipeline.stats();
        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.readings_accepted, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(pipeline.state(), PipelineState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_consume_stops_on_shutdown() {
        let (pipeline, _registry) = make_pipeline();
        let (_tx, rx) = mpsc::channel::<IncomingMessage>(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consume = pipeline.consume(rx, shutdown_rx);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown_tx.send(true).unwrap();
        };

        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(consume, trigger) })
            .await
            .unwrap();

        assert_eq!(pipeline.state(), PipelineState::Unsubscribed);
    }

    #[test]
    fn test_pipeline_state_display() {
        assert_eq!(PipelineState::Subscribed.to_string(), "subscribed");
        assert_eq!(PipelineState::Unsubscribed.to_string(), "unsubscribed");
    }
}
