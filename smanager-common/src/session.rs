//! MQTT session management.
//!
//! [`connect`] opens one broker session and spawns a driver task that polls
//! the rumqttc event loop. The driver forwards incoming publishes to a
//! channel, reports acknowledgements back to the [`Connection`], and
//! broadcasts [`ConnectionEvent`]s on state transitions so callers decide how
//! to react (the ingestion pipeline re-subscribes after a reconnect).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{MqttConfig, Qos, ReconnectConfig};
use crate::error::{ConnectError, PublishError, SubscribeError};

/// Last nanosecond stamp handed out by [`next_client_id`].
static LAST_CLIENT_STAMP: AtomicU64 = AtomicU64::new(0);

/// Build a client identity from the current high-resolution clock.
///
/// Stamps are strictly increasing within the process, so two connections
/// built in the same clock tick never share an identity.
pub fn next_client_id(prefix: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mut last = LAST_CLIENT_STAMP.load(Ordering::Relaxed);
    loop {
        let stamp = now.max(last + 1);
        match LAST_CLIENT_STAMP.compare_exchange_weak(
            last,
            stamp,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return format!("{}_{}", prefix, stamp),
            Err(actual) => last = actual,
        }
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Notification broadcast by the connection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// CONNACK received (initial connect or reconnect).
    Connected { session_present: bool },
    /// An established link dropped.
    ConnectionLost { reason: String },
    /// A reconnection attempt is about to be made.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// Reconnection attempts are exhausted; the driver stopped.
    GaveUp { attempts: u32 },
    /// The connection was closed by its owner.
    Closed,
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Kind of request awaiting an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Publish,
    Subscribe,
}

/// Acknowledgement bookkeeping forwarded by the driver.
#[derive(Debug, Clone, Copy)]
enum Ack {
    /// A request was written to the network with this packet id.
    Sent { request: Request, pkid: u16 },
    /// PUBACK / PUBCOMP.
    Acked(u16),
    SubAcked { pkid: u16, granted: bool },
}

/// Why a request was left without acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckFailure {
    Timeout,
    Closed,
}

/// Matches driver acknowledgements to the single request in flight.
///
/// The client writes requests in submission order. A request that timed
/// out before it was written is still queued, so the next `Sent` belongs to
/// it and not to the caller. A request that timed out after it was written
/// keeps its packet id until the broker acknowledges it, and may be
/// retransmitted under that id after a reconnect.
#[derive(Debug)]
struct AckQueue {
    rx: mpsc::UnboundedReceiver<Ack>,
    /// Timed-out requests whose `Sent` has not arrived yet.
    unsent: usize,
    /// Packet ids of timed-out requests still waiting for their ack.
    abandoned: HashSet<u16>,
}

impl AckQueue {
    fn new(rx: mpsc::UnboundedReceiver<Ack>) -> Self {
        Self {
            rx,
            unsent: 0,
            abandoned: HashSet::new(),
        }
    }

    /// Wait for the acknowledgement of the request just enqueued.
    ///
    /// Resolves to whether the broker granted it. Without `wait_for_ack`
    /// (QoS 0) the request counts as granted once written.
    async fn wait(
        &mut self,
        request: Request,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> Result<bool, AckFailure> {
        let mut sent = None;

        let outcome = tokio::time::timeout(timeout, async {
            while let Some(ack) = self.rx.recv().await {
                match ack {
                    Ack::Sent { pkid, .. } if pkid != 0 && self.abandoned.contains(&pkid) => {}
                    Ack::Sent { pkid, .. } if self.unsent > 0 => {
                        self.unsent -= 1;
                        if pkid != 0 {
                            self.abandoned.insert(pkid);
                        }
                    }
                    Ack::Sent { request: kind, pkid } if sent.is_none() && kind == request => {
                        if !wait_for_ack {
                            return Ok(true);
                        }
                        sent = Some(pkid);
                    }
                    Ack::Sent { .. } => {}
                    Ack::Acked(pkid) => {
                        if sent == Some(pkid) {
                            return Ok(true);
                        }
                        self.abandoned.remove(&pkid);
                    }
                    Ack::SubAcked { pkid, granted } => {
                        if sent == Some(pkid) {
                            return Ok(granted);
                        }
                        self.abandoned.remove(&pkid);
                    }
                }
            }
            Err(AckFailure::Closed)
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                match sent {
                    None => self.unsent += 1,
                    Some(pkid) if wait_for_ack && pkid != 0 => {
                        self.abandoned.insert(pkid);
                    }
                    Some(_) => {}
                }
                Err(AckFailure::Timeout)
            }
        }
    }
}

/// An open MQTT session.
pub struct Connection {
    client_id: String,
    broker: String,
    client: AsyncClient,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    messages: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    /// Held for the whole publish/subscribe round trip so acks match requests.
    acks: tokio::sync::Mutex<AckQueue>,
    ack_timeout: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("broker", &self.broker)
            .field("state", &self.state())
            .finish()
    }
}

/// Connect to the MQTT broker described by `config`.
///
/// Resolves once the broker acknowledges the session. Any failure before
/// that point is returned as a [`ConnectError`].
pub async fn connect(config: &MqttConfig) -> Result<Connection, ConnectError> {
    let (host, port) = config
        .host_port()
        .map_err(|e| ConnectError::InvalidAddress(e.to_string()))?;
    let broker = format!("{}:{}", host, port);
    let client_id = next_client_id(&config.client_id_prefix);

    let mut options = MqttOptions::new(client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

    let state = Arc::new(watch::channel(ConnectionState::Connecting).0);
    let (events, _) = broadcast::channel(16);
    let (message_tx, message_rx) = mpsc::channel(config.channel_capacity);
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    tracing::debug!(client_id = %client_id, broker = %broker, "Connecting to MQTT broker");

    let driver = Driver {
        client_id: client_id.clone(),
        eventloop,
        state: state.clone(),
        events: events.clone(),
        messages: message_tx,
        acks: ack_tx,
        reconnect: config.reconnect.clone(),
    };
    let handle = tokio::spawn(driver.run(broker.clone(), ready_tx));

    let timeout = Duration::from_secs(config.connect_timeout_secs);
    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(e),
        Ok(Err(_)) => {
            return Err(ConnectError::Unreachable {
                broker,
                reason: "connection driver stopped".to_string(),
            });
        }
        Err(_) => {
            handle.abort();
            return Err(ConnectError::Timeout { broker, timeout });
        }
    }

    tracing::debug!(client_id = %client_id, broker = %broker, "CONNACK received");

    Ok(Connection {
        client_id,
        broker,
        client,
        state,
        events,
        messages: Mutex::new(Some(message_rx)),
        acks: tokio::sync::Mutex::new(AckQueue::new(ack_rx)),
        ack_timeout: Duration::from_secs(config.ack_timeout_secs),
        driver: Mutex::new(Some(handle)),
        closed: AtomicBool::new(false),
    })
}

impl Connection {
    /// The client identity presented to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The broker address as `host:port`.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Take the receiver of incoming messages. Returns `None` after the first call.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.messages.lock().take()
    }

    /// Subscribe to `topic` and wait for the broker's SUBACK.
    pub async fn subscribe(&self, topic: &str, qos: Qos) -> Result<(), SubscribeError> {
        if self.is_closed() {
            return Err(SubscribeError::Closed);
        }

        let mut acks = self.acks.lock().await;

        self.client.subscribe(topic, qos.into()).await?;

        match acks.wait(Request::Subscribe, true, self.ack_timeout).await {
            Ok(true) => {
                tracing::debug!(topic = %topic, qos = u8::from(qos), "Subscription acknowledged");
                Ok(())
            }
            Ok(false) => Err(SubscribeError::Rejected {
                topic: topic.to_string(),
            }),
            Err(AckFailure::Closed) => Err(SubscribeError::Closed),
            Err(AckFailure::Timeout) => Err(SubscribeError::AckTimeout(self.ack_timeout)),
        }
    }

    /// Publish `payload` to `topic` and wait for the broker to acknowledge it.
    ///
    /// With QoS 0 there is no acknowledgement; the call resolves once the
    /// packet has been written to the network.
    pub async fn publish(
        &self,
        topic: &str,
        qos: Qos,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }

        let mut acks = self.acks.lock().await;

        self.client
            .publish(topic, qos.into(), false, payload)
            .await?;

        match acks
            .wait(Request::Publish, qos != Qos::AtMostOnce, self.ack_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(AckFailure::Closed) => Err(PublishError::Closed),
            Err(AckFailure::Timeout) => Err(PublishError::AckTimeout(self.ack_timeout)),
        }
    }

    /// Close the session, giving in-flight acknowledgements at most `grace`
    /// to flush. Best-effort and idempotent.
    pub async fn disconnect(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(client_id = %self.client_id, "Disconnecting from MQTT broker");

        let deadline = tokio::time::Instant::now() + grace;
        match tokio::time::timeout_at(deadline, self.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Disconnect request not delivered"),
            Err(_) => tracing::debug!("Disconnect request timed out"),
        }

        let handle = self.driver.lock().take();
        if let Some(mut handle) = handle
            && tokio::time::timeout_at(deadline, &mut handle).await.is_err()
        {
            tracing::debug!(client_id = %self.client_id, "Grace period elapsed, aborting driver");
            handle.abort();
        }

        self.state.send_replace(ConnectionState::Closed);
        let _ = self.events.send(ConnectionEvent::Closed);

        tracing::info!(client_id = %self.client_id, "Disconnected from MQTT broker");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Owns the rumqttc event loop for one connection.
struct Driver {
    client_id: String,
    eventloop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
    messages: mpsc::Sender<IncomingMessage>,
    acks: mpsc::UnboundedSender<Ack>,
    reconnect: ReconnectConfig,
}

impl Driver {
    async fn run(mut self, broker: String, ready: oneshot::Sender<Result<(), ConnectError>>) {
        let mut ready = Some(ready);
        let mut attempts: u32 = 0;

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if attempts > 0 {
                        tracing::debug!(client_id = %self.client_id, attempts, "Reconnected");
                    }
                    attempts = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    let _ = self.events.send(ConnectionEvent::Connected {
                        session_present: ack.session_present,
                    });
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = IncomingMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if self.messages.send(message).await.is_err() {
                        tracing::trace!(client_id = %self.client_id, "No consumer for incoming message");
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.ack(Ack::Acked(ack.pkid)),
                Ok(Event::Incoming(Packet::PubComp(comp))) => self.ack(Ack::Acked(comp.pkid)),
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                    self.ack(Ack::SubAcked {
                        pkid: ack.pkid,
                        granted,
                    });
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.ack(Ack::Sent {
                    request: Request::Publish,
                    pkid,
                }),
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => self.ack(Ack::Sent {
                    request: Request::Subscribe,
                    pkid,
                }),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!(client_id = %self.client_id, "DISCONNECT sent");
                    break;
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => {
                    tracing::debug!(client_id = %self.client_id, "Client dropped, stopping driver");
                    break;
                }
                Err(e) => {
                    if let Some(tx) = ready.take() {
                        let err = match e {
                            ConnectionError::ConnectionRefused(code) => ConnectError::Rejected {
                                broker: broker.clone(),
                                reason: format!("{:?}", code),
                            },
                            other => ConnectError::Unreachable {
                                broker: broker.clone(),
                                reason: other.to_string(),
                            },
                        };
                        let _ = tx.send(Err(err));
                        break;
                    }

                    if *self.state.borrow() == ConnectionState::Connected {
                        tracing::debug!(client_id = %self.client_id, error = %e, "Connection lost");
                        self.state.send_replace(ConnectionState::Disconnected);
                        let _ = self.events.send(ConnectionEvent::ConnectionLost {
                            reason: e.to_string(),
                        });
                    }

                    attempts += 1;
                    if attempts > self.reconnect.max_attempts {
                        tracing::debug!(
                            client_id = %self.client_id,
                            attempts = self.reconnect.max_attempts,
                            "Reconnect attempts exhausted, stopping driver"
                        );
                        let _ = self.events.send(ConnectionEvent::GaveUp {
                            attempts: self.reconnect.max_attempts,
                        });
                        break;
                    }

                    tracing::debug!(
                        client_id = %self.client_id,
                        attempt = attempts,
                        "Reconnecting"
                    );
                    let _ = self.events.send(ConnectionEvent::Reconnecting {
                        attempt: attempts,
                        max_attempts: self.reconnect.max_attempts,
                    });
                    tokio::time::sleep(Duration::from_millis(self.reconnect.backoff_ms)).await;
                }
            }
        }

        if *self.state.borrow() != ConnectionState::Closed {
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    fn ack(&self, ack: Ack) {
        let _ = self.acks.send(ack);
    }
}
