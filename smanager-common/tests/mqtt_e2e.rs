//! End-to-end tests against a live MQTT broker.
//!
//! These tests need a broker on `localhost:1883` (e.g. `mosquitto`) and are
//! ignored by default. Run them with `cargo test -- --ignored`.
//!
//! Each test uses a unique topic to avoid interference.

use std::time::Duration;

use smanager_common::{
    ConnectionEvent, ConnectionState, MqttConfig, Qos, Reading, connect, decode, encode,
};

/// Generate a unique topic per test.
fn unique_topic() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("home-smanager/test_{}", nanos)
}

fn broker_config(topic: &str) -> MqttConfig {
    MqttConfig {
        topic: topic.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_mqtt_pubsub_reading() {
    let topic = unique_topic();
    let config = broker_config(&topic);

    let subscriber = connect(&config).await.expect("subscriber connect failed");
    let publisher = connect(&config).await.expect("publisher connect failed");
    assert_ne!(subscriber.client_id(), publisher.client_id());
    assert_eq!(subscriber.state(), ConnectionState::Connected);

    let mut messages = subscriber.take_messages().expect("messages already taken");
    subscriber
        .subscribe(&topic, Qos::AtLeastOnce)
        .await
        .expect("subscribe failed");

    let reading = Reading::new("device1", "living_room", "sensor", 12.5);
    publisher
        .publish(&topic, Qos::AtLeastOnce, encode(&reading))
        .await
        .expect("publish failed");

    let received = tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .expect("Timeout waiting for message")
        .expect("Message channel closed");

    assert_eq!(received.topic, topic);
    assert_eq!(decode(&received.payload).unwrap(), reading);

    publisher.disconnect(Duration::from_millis(250)).await;
    subscriber.disconnect(Duration::from_millis(250)).await;
    assert_eq!(subscriber.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires an MQTT broker on localhost:1883"]
async fn test_disconnect_is_idempotent() {
    let topic = unique_topic();
    let connection = connect(&broker_config(&topic)).await.unwrap();
    let mut events = connection.events();

    connection.disconnect(Duration::from_millis(250)).await;
    connection.disconnect(Duration::from_millis(250)).await;

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
    assert!(events.try_recv().is_err());
    assert!(
        connection
            .publish(&topic, Qos::AtLeastOnce, "late:late:late:1")
            .await
            .is_err()
    );
}
