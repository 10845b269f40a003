//! Broker channel behavior against the in-process broker
//!
//! Covers lazy connection, send retry with reconnect, listener fan-out,
//! consumer restoration after a rebuild and the health probe.


use async_trait::async_trait;
use resource_discovery::testing::{MemoryBroker, ReversingCipher};
use resource_discovery::transport::codec::Payload;
use resource_discovery::transport::{
    AesGcmCipher, BrokerChannel, BrokerError, ChannelSettings, MessageCipher, MessageListener,
    ENCRYPTED_MESSAGE_KEY,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{object, test_config, wait_until};

#[derive(Default)]
struct RecordingListener {
    name: String,
    received: Mutex<Vec<(String, Payload)>>,
}

impl RecordingListener {
    fn named(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn payloads(&self) -> Vec<Payload> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_message(&self, topic: &str, payload: &Payload) {
        self.received
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
    }
}

fn channel(broker: &Arc<MemoryBroker>) -> Arc<BrokerChannel> {
    BrokerChannel::new(
        ChannelSettings::from_config(&test_config().broker),
        broker.clone(),
    )
}

#[tokio::test]
async fn test_send_opens_connection_lazily() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    assert_eq!(broker.open_count(), 0);
    assert!(!channel.is_connected().await);

    channel
        .send("ems.requests", &object(json!({"requestId": "r-1"})))
        .await
        .unwrap();

    assert_eq!(broker.open_count(), 1);
    assert!(channel.is_connected().await);
    assert_eq!(
        broker.published("ems.requests"),
        vec![object(json!({"requestId": "r-1"}))]
    );
}

#[tokio::test]
async fn test_send_retries_until_accepted() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    broker.fail_next_sends(2);

    channel
        .send("ems.requests", &object(json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(broker.published("ems.requests").len(), 1);
    assert!(broker.open_count() >= 2, "failed sends must reset the connection");
}

#[tokio::test]
async fn test_send_gives_up_after_attempt_cap() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    broker.fail_next_sends(10);

    let err = channel
        .send("ems.requests", &object(json!({"n": 1})))
        .await
        .unwrap_err();

    match err {
        BrokerError::SendExhausted { topic, attempts } => {
            assert_eq!(topic, "ems.requests");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(broker.published("ems.requests").is_empty());
}

#[tokio::test]
async fn test_send_after_shutdown_fails() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    channel.shutdown().await;

    let err = channel
        .send("ems.requests", &object(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ShutDown));
    assert_eq!(broker.open_count(), 0);
}

#[tokio::test]
async fn test_listener_receives_inbound_messages() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let _dispatcher = channel.start_dispatcher().unwrap();
    assert!(channel.start_dispatcher().is_none());

    let listener = RecordingListener::named("recorder");
    channel.subscribe("ems.reports", listener.clone()).await.unwrap();
    assert_eq!(channel.subscribed_topics().await, vec!["ems.reports".to_string()]);

    assert!(broker.inject("ems.reports", &object(json!({"status": "SUCCESS"}))));
    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
    assert_eq!(
        listener.payloads(),
        vec![object(json!({"status": "SUCCESS"}))]
    );
}

#[tokio::test]
async fn test_same_listener_name_is_registered_once() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let _dispatcher = channel.start_dispatcher().unwrap();

    let listener = RecordingListener::named("recorder");
    channel.subscribe("ems.reports", listener.clone()).await.unwrap();
    channel.subscribe("ems.reports", listener.clone()).await.unwrap();

    broker.inject("ems.reports", &object(json!({"n": 1})));
    broker.inject("ems.reports", &object(json!({"n": 2})));
    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 2 }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.count(), 2);
}

#[tokio::test]
async fn test_every_listener_of_a_topic_is_invoked() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let _dispatcher = channel.start_dispatcher().unwrap();

    let first = RecordingListener::named("first");
    let second = RecordingListener::named("second");
    channel.subscribe("ems.reports", first.clone()).await.unwrap();
    channel.subscribe("ems.reports", second.clone()).await.unwrap();

    broker.inject("ems.reports", &object(json!({"n": 1})));
    assert!(
        wait_until(Duration::from_secs(2), || async {
            first.count() == 1 && second.count() == 1
        })
        .await
    );
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let _dispatcher = channel.start_dispatcher().unwrap();
    let listener = RecordingListener::named("recorder");
    channel.subscribe("ems.reports", listener.clone()).await.unwrap();

    broker.inject_raw("ems.reports", b"not json".to_vec());
    broker.inject_raw("ems.reports", b"[1, 2, 3]".to_vec());
    broker.inject("ems.reports", &object(json!({"ok": true})));

    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
    assert_eq!(listener.payloads(), vec![object(json!({"ok": true}))]);
}

#[tokio::test]
async fn test_rebuild_restores_consumers() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let _dispatcher = channel.start_dispatcher().unwrap();
    let listener = RecordingListener::named("recorder");
    channel.subscribe("ems.reports", listener.clone()).await.unwrap();

    channel.rebuild().await.unwrap();

    assert_eq!(broker.open_count(), 2);
    assert_eq!(broker.subscriptions(), vec!["ems.reports".to_string()]);
    broker.inject("ems.reports", &object(json!({"after": "rebuild"})));
    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
}

#[tokio::test]
async fn test_subscription_failure_is_reported() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    broker.fail_next_subscriptions(1);

    let listener = RecordingListener::named("recorder");
    let result = channel.subscribe("ems.reports", listener.clone()).await;
    assert!(matches!(result, Err(BrokerError::SubscriptionFailed { .. })));
    assert!(channel.subscribed_topics().await.is_empty());

    channel.subscribe("ems.reports", listener).await.unwrap();
    assert_eq!(channel.subscribed_topics().await, vec!["ems.reports".to_string()]);
}

#[tokio::test]
async fn test_health_check_publishes_probe() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);

    assert!(channel.health_check().await);
    let probes = broker.published("_HEALTH_CHECK");
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].get("ping"), Some(&Value::String("pong".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_failed_health_check_schedules_reconnect() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    channel.open().await.unwrap();

    broker.drop_connection();
    broker.fail_next_opens(1);
    assert!(!channel.health_check().await);
    assert!(!channel.is_connected().await);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(channel.is_connected().await);
    assert_eq!(broker.open_count(), 2);
}

#[tokio::test]
async fn test_encrypted_messages_are_wrapped_and_unwrapped() {
    let broker = MemoryBroker::new();
    let channel = BrokerChannel::with_cipher(
        ChannelSettings::from_config(&test_config().broker),
        broker.clone(),
        Some(Arc::new(ReversingCipher)),
    );
    let _dispatcher = channel.start_dispatcher().unwrap();

    channel
        .send_encrypted("secure.out", &object(json!({"secret": "value"})))
        .await
        .unwrap();
    let sent = broker.published("secure.out");
    assert_eq!(sent.len(), 1);
    let Some(Value::String(cipher_text)) = sent[0].get(ENCRYPTED_MESSAGE_KEY) else {
        panic!("expected an encrypted wrapper, got {:?}", sent[0]);
    };
    assert!(!cipher_text.contains("\"secret\""));

    let listener = RecordingListener::named("recorder");
    channel.subscribe("secure.in", listener.clone()).await.unwrap();
    let reversed: String = r#"{"hello":"world"}"#.chars().rev().collect();
    let mut wrapper = Payload::new();
    wrapper.insert(ENCRYPTED_MESSAGE_KEY.to_string(), Value::String(reversed));
    broker.inject("secure.in", &wrapper);

    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
    assert_eq!(listener.payloads(), vec![object(json!({"hello": "world"}))]);
}

#[tokio::test(start_paused = true)]
async fn test_health_reconnect_waits_for_configured_delay() {
    let broker = MemoryBroker::new();
    let mut config = test_config();
    config.broker.health_reconnect_delay_secs = 30;
    let settings = ChannelSettings::from_config(&config.broker);
    assert_eq!(settings.health_reconnect_delay, Duration::from_secs(30));
    let channel = BrokerChannel::new(settings, broker.clone());
    channel.open().await.unwrap();

    broker.drop_connection();
    broker.fail_next_opens(1);
    assert!(!channel.health_check().await);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!channel.is_connected().await);
    assert_eq!(broker.open_count(), 1);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(channel.is_connected().await);
    assert_eq!(broker.open_count(), 2);
}

#[tokio::test]
async fn test_aes_sealed_message_round_trips_through_the_channel() {
    let broker = MemoryBroker::new();
    let channel = BrokerChannel::with_cipher(
        ChannelSettings::from_config(&test_config().broker),
        broker.clone(),
        Some(Arc::new(AesGcmCipher::from_password("shared", "salt", 1_000))),
    );
    let _dispatcher = channel.start_dispatcher().unwrap();
    let listener = RecordingListener::named("recorder");
    channel.subscribe("secure.ops", listener.clone()).await.unwrap();

    let message = object(json!({"requestType": "INSTALL", "password": "hunter2"}));
    channel.send_encrypted("secure.ops", &message).await.unwrap();

    let sent = broker.published("secure.ops");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 1);
    let Some(Value::String(cipher_text)) = sent[0].get(ENCRYPTED_MESSAGE_KEY) else {
        panic!("expected an encrypted wrapper, got {:?}", sent[0]);
    };
    assert!(!cipher_text.contains("hunter2"));

    let (topic, wire_text) = broker.all_published().remove(0);
    assert!(broker.inject_raw(&topic, wire_text.into_bytes()));

    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
    assert_eq!(listener.payloads(), vec![message]);
}

#[tokio::test]
async fn test_message_sealed_with_another_key_is_dropped() {
    let broker = MemoryBroker::new();
    let channel = BrokerChannel::with_cipher(
        ChannelSettings::from_config(&test_config().broker),
        broker.clone(),
        Some(Arc::new(AesGcmCipher::from_password("ours", "salt", 1_000))),
    );
    let _dispatcher = channel.start_dispatcher().unwrap();
    let listener = RecordingListener::named("recorder");
    channel.subscribe("secure.in", listener.clone()).await.unwrap();

    let foreign = AesGcmCipher::from_password("theirs", "salt", 1_000)
        .encrypt(r#"{"hello":"world"}"#)
        .unwrap();
    let mut wrapper = Payload::new();
    wrapper.insert(ENCRYPTED_MESSAGE_KEY.to_string(), Value::String(foreign));
    broker.inject("secure.in", &wrapper);
    broker.inject("secure.in", &object(json!({"plain": true})));

    assert!(wait_until(Duration::from_secs(2), || async { listener.count() == 1 }).await);
    assert_eq!(listener.payloads(), vec![object(json!({"plain": true}))]);
}

#[tokio::test]
async fn test_send_encrypted_without_cipher_fails() {
    let broker = MemoryBroker::new();
    let channel = channel(&broker);
    let err = channel
        .send_encrypted("secure.out", &object(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CipherMissing));
}
