//! Synthetic energy-reading publisher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use smanager_common::{Connection, PublishError, Qos, Reading, encode};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::devices::DeviceTable;

/// Upper bound (exclusive) of generated energy values.
pub const MAX_CONSUMPTION: f64 = 50.0;

/// Destination for encoded readings.
pub trait PublishSink: Send + Sync {
    /// Publish `payload` to `topic`, resolving once the broker acknowledged it.
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

impl PublishSink for Connection {
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        Connection::publish(self, topic, qos, payload)
    }
}

impl<T: PublishSink> PublishSink for Arc<T> {
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        PublishSink::publish(&**self, topic, qos, payload)
    }
}

/// Publishes one random reading per simulated device on every cycle.
///
/// Readings are sent one at a time; each publish waits for its
/// acknowledgement and consecutive publishes are spaced out so a cycle
/// never bursts the broker.
pub struct SyntheticPublisher<S> {
    sink: S,
    devices: DeviceTable,
    topic: String,
    qos: Qos,
    message_spacing: Duration,
}

impl<S: PublishSink> SyntheticPublisher<S> {
    /// Create a new publisher with a one second message spacing.
    pub fn new(sink: S, devices: DeviceTable, topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            sink,
            devices,
            topic: topic.into(),
            qos,
            message_spacing: Duration::from_secs(1),
        }
    }

    /// Set the delay between two publishes of one cycle.
    pub fn with_message_spacing(mut self, spacing: Duration) -> Self {
        self.message_spacing = spacing;
        self
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one reading for every device, in table order.
    ///
    /// A failed publish is logged and counted; the remaining devices are
    /// still attempted.
    pub async fn run_cycle(&self) -> PublishStats {
        let mut stats = PublishStats::default();

        for (index, device) in self.devices.devices().iter().enumerate() {
            if index > 0 && !self.message_spacing.is_zero() {
                tokio::time::sleep(self.message_spacing).await;
            }

            let reading = Reading::new(
                device.device_id.as_str(),
                device.room.as_str(),
                device.device_type.as_str(),
                sample_consumption(),
            );
            let payload = encode(&reading);

            match self
                .sink
                .publish(&self.topic, self.qos, payload.into_bytes())
                .await
            {
                Ok(()) => {
                    stats.success += 1;
                    tracing::debug!(
                        device = %reading.device_id,
                        room = %reading.room,
                        energy = reading.energy_consumption,
                        "Published synthetic reading"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(
                        device = %reading.device_id,
                        room = %reading.room,
                        error = %e,
                        "Failed to publish synthetic reading"
                    );
                }
            }
        }

        stats
    }

    /// Run a cycle every `interval` until shutdown is signalled.
    ///
    /// The first cycle starts one full interval after the call.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            devices = self.devices.len(),
            topic = %self.topic,
            interval_secs = interval.as_secs_f64(),
            "Synthetic publisher started"
        );

        let mut cycles: u64 = 0;
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let stats = tokio::select! {
                        stats = self.run_cycle() => stats,
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                            continue;
                        }
                    };
                    cycles += 1;

                    if stats.failed > 0 {
                        tracing::warn!(
                            cycle = cycles,
                            success = stats.success,
                            failed = stats.failed,
                            "Publish cycle completed with failures"
                        );
                    } else {
                        tracing::debug!(
                            cycle = cycles,
                            published = stats.success,
                            "Publish cycle completed"
                        );
                    }
                }
            }
        }

        tracing::info!(cycles, "Synthetic publisher stopped");
    }
}

/// Draw a value in `[0, MAX_CONSUMPTION)` truncated to two decimals.
fn sample_consumption() -> f64 {
    let raw: f64 = rand::rng().random_range(0.0..MAX_CONSUMPTION);
    (raw * 100.0).floor() / 100.0
}

/// Statistics from one publish cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Number of successfully published readings.
    pub success: usize,
    /// Number of failed publishes.
    pub failed: usize,
}

impl PublishStats {
    /// Total number of attempted publishes.
    pub fn total(&self) -> usize {
        self.success + self.failed
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            100.0
        } else {
            (self.success as f64 / self.total() as f64) * 100.0
        }
    }
}
