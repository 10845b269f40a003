//! Broker channel: connection lifecycle, per-topic caches and listener fan-out
//!
//! The channel owns exactly one broker connection at a time together with the
//! producers and consumers created on it. Those three are only ever replaced
//! as a unit while the connection slot lock is held, so a rebuild can never
//! interleave with a `send` or `subscribe` that is picking a producer or
//! consumer. Listener registrations outlive a rebuild: every reopened
//! connection gets a fresh consumer for each topic that has listeners.

use super::codec::{self, Payload};
use super::{
    BrokerConnection, BrokerConnector, BrokerError, InboundMessage, MessageCipher,
    MessageListener, TopicProducer,
};
use crate::broker_span;
use crate::config::BrokerSection;
use crate::observability::metrics::metrics;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Retry and health check tuning for a [`BrokerChannel`]
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    pub health_check_topic: String,
    /// Pause between two attempts of the same `send`
    pub send_retry_interval: Duration,
    /// `None` keeps retrying until the message is accepted
    pub max_send_attempts: Option<u32>,
    /// Delay before a failed reconnect is attempted again
    pub reconnect_delay: Duration,
    /// Delay before reconnecting after a failed health check
    pub health_reconnect_delay: Duration,
}

impl ChannelSettings {
    pub fn from_config(broker: &BrokerSection) -> Self {
        Self {
            health_check_topic: broker.health_check_topic.clone(),
            send_retry_interval: broker.send_retry_interval(),
            max_send_attempts: broker.send_attempt_limit(),
            reconnect_delay: broker.subscription_retry_delay(),
            health_reconnect_delay: broker.health_reconnect_delay(),
        }
    }
}

#[derive(Default)]
struct ConnectionSlot {
    connection: Option<Arc<dyn BrokerConnection>>,
    producers: HashMap<String, Arc<dyn TopicProducer>>,
    consumers: HashSet<String>,
}

/// Shared broker channel handed to every component that talks to the broker
pub struct BrokerChannel {
    settings: ChannelSettings,
    connector: Arc<dyn BrokerConnector>,
    cipher: Option<Arc<dyn MessageCipher>>,
    slot: Mutex<ConnectionSlot>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn MessageListener>>>>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    reconnect_pending: AtomicBool,
    shut_down: AtomicBool,
    self_ref: Weak<BrokerChannel>,
}

impl BrokerChannel {
    pub fn new(settings: ChannelSettings, connector: Arc<dyn BrokerConnector>) -> Arc<Self> {
        Self::with_cipher(settings, connector, None)
    }

    /// Create a channel that unwraps and produces `encrypted-message` payloads
    pub fn with_cipher(
        settings: ChannelSettings,
        connector: Arc<dyn BrokerConnector>,
        cipher: Option<Arc<dyn MessageCipher>>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_ref| Self {
            settings,
            connector,
            cipher,
            slot: Mutex::new(ConnectionSlot::default()),
            listeners: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
            reconnect_pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// True when `encrypted-message` payloads can be sealed and opened
    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Open the connection if it is not open already
    pub async fn open(&self) -> Result<(), BrokerError> {
        let mut slot = self.slot.lock().await;
        self.ensure_open(&mut slot).await.map(|_| ())
    }

    /// Drop the connection together with its producer and consumer caches
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        Self::teardown(&mut slot).await;
    }

    /// Close and immediately reopen the connection
    pub async fn rebuild(&self) -> Result<(), BrokerError> {
        let mut slot = self.slot.lock().await;
        Self::teardown(&mut slot).await;
        self.ensure_open(&mut slot).await.map(|_| ())
    }

    /// Close the connection for good; pending reconnects become no-ops
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.close().await;
        info!("Broker channel shut down");
    }

    pub async fn is_connected(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.connection
            .as_ref()
            .map(|connection| connection.is_open())
            .unwrap_or(false)
    }

    /// Topics that currently have at least one listener
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let listeners = self.listeners.read().await;
        let mut topics: Vec<String> = listeners.keys().cloned().collect();
        topics.sort();
        topics
    }

    async fn ensure_open(
        &self,
        slot: &mut ConnectionSlot,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BrokerError::ShutDown);
        }
        if let Some(connection) = &slot.connection {
            if connection.is_open() {
                return Ok(connection.clone());
            }
            warn!("Broker connection is no longer open, rebuilding");
        }
        Self::teardown(slot).await;

        metrics().broker_connection_attempt();
        let connection = match self.connector.open(self.inbound_tx.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                metrics().broker_connection_failed();
                return Err(e);
            }
        };

        let topics: Vec<String> = self.listeners.read().await.keys().cloned().collect();
        for topic in topics {
            if let Err(e) = connection.create_consumer(&topic).await {
                error!(topic = %topic, error = %e, "Failed to restore consumer on new connection");
                connection.close().await;
                metrics().broker_connection_failed();
                return Err(e);
            }
            slot.consumers.insert(topic);
        }

        metrics().broker_connection_established();
        info!(
            consumers = slot.consumers.len(),
            "Broker connection established"
        );
        slot.connection = Some(connection.clone());
        Ok(connection)
    }

    async fn teardown(slot: &mut ConnectionSlot) {
        slot.producers.clear();
        slot.consumers.clear();
        if let Some(connection) = slot.connection.take() {
            connection.close().await;
            metrics().broker_connection_closed();
            debug!("Broker connection closed");
        }
    }

    /// Reopen the connection after `delay`, retrying on failure
    ///
    /// At most one reconnect is pending at any time; further requests while
    /// one is scheduled are ignored.
    pub fn schedule_reconnect(&self, delay: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::AcqRel) {
            debug!("Reconnect already scheduled");
            return;
        }
        let Some(channel) = self.self_ref.upgrade() else {
            self.reconnect_pending.store(false, Ordering::Release);
            return;
        };

        metrics().reconnect_scheduled();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling broker reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            channel.reconnect_pending.store(false, Ordering::Release);
            if channel.shut_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = channel.open().await {
                warn!(
                    error = %e,
                    retry_in_secs = channel.settings.reconnect_delay.as_secs(),
                    "Broker reconnect failed"
                );
                channel.schedule_reconnect(channel.settings.reconnect_delay);
            }
        });
    }

    /// Serialize `payload` and publish it on `topic`
    ///
    /// A failed attempt tears the connection down, schedules a reconnect and
    /// retries after `send_retry_interval`. When the attempt cap is reached
    /// the caller gets [`BrokerError::SendExhausted`] and decides what to do.
    pub async fn send(&self, topic: &str, payload: &Payload) -> Result<(), BrokerError> {
        let text = codec::encode_payload(payload)?;
        self.send_text(topic, &text)
            .instrument(broker_span!(operation = "send", topic = %topic))
            .await
    }

    /// Like [`send`](Self::send) but wraps the body as an `encrypted-message`
    pub async fn send_encrypted(&self, topic: &str, payload: &Payload) -> Result<(), BrokerError> {
        let cipher = self.cipher.as_ref().ok_or(BrokerError::CipherMissing)?;
        let text = codec::wrap_encrypted(cipher.as_ref(), payload)?;
        self.send_text(topic, &text).await
    }

    async fn send_text(&self, topic: &str, text: &str) -> Result<(), BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_send_text(topic, text).await {
                Ok(()) => {
                    metrics().message_published();
                    debug!(topic = %topic, attempt, "Message sent");
                    return Ok(());
                }
                Err(BrokerError::ShutDown) => return Err(BrokerError::ShutDown),
                Err(e) => {
                    metrics().publish_failed();
                    warn!(
                        topic = %topic,
                        attempt,
                        error = %e,
                        "Send failed, resetting broker connection"
                    );
                    self.close().await;

                    if let Some(max_attempts) = self.settings.max_send_attempts {
                        if attempt >= max_attempts {
                            metrics().send_exhausted();
                            error!(topic = %topic, attempts = attempt, "Giving up on message");
                            return Err(BrokerError::SendExhausted {
                                topic: topic.to_string(),
                                attempts: attempt,
                            });
                        }
                    }

                    self.schedule_reconnect(Duration::ZERO);
                    tokio::time::sleep(self.settings.send_retry_interval).await;
                }
            }
        }
    }

    async fn try_send_text(&self, topic: &str, text: &str) -> Result<(), BrokerError> {
        let producer = {
            let mut slot = self.slot.lock().await;
            let connection = self.ensure_open(&mut slot).await?;
            match slot.producers.get(topic) {
                Some(producer) => producer.clone(),
                None => {
                    let producer = connection.create_producer(topic).await?;
                    slot.producers.insert(topic.to_string(), producer.clone());
                    producer
                }
            }
        };
        producer.send(text).await
    }

    /// Register `listener` for `topic`, creating the topic's consumer if needed
    pub async fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), BrokerError> {
        let mut slot = self.slot.lock().await;

        let already_registered = self
            .listeners
            .read()
            .await
            .get(topic)
            .map(|set| set.iter().any(|l| l.name() == listener.name()))
            .unwrap_or(false);
        if already_registered {
            debug!(topic = %topic, listener = listener.name(), "Listener already registered");
            return Ok(());
        }

        let connection = self.ensure_open(&mut slot).await?;
        if !slot.consumers.contains(topic) {
            connection.create_consumer(topic).await?;
            slot.consumers.insert(topic.to_string());
        }

        info!(topic = %topic, listener = listener.name(), "Listener subscribed");
        self.listeners
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(listener);
        Ok(())
    }

    /// Publish the health probe once; a failure schedules a reconnect
    pub async fn health_check(&self) -> bool {
        let mut probe = Payload::new();
        probe.insert("ping".to_string(), Value::String("pong".to_string()));
        let text = Value::Object(probe).to_string();

        let topic = self.settings.health_check_topic.clone();
        match self.try_send_text(&topic, &text).await {
            Ok(()) => {
                metrics().health_check(true);
                debug!(topic = %topic, "Broker health check passed");
                true
            }
            Err(e) => {
                metrics().health_check(false);
                warn!(topic = %topic, error = %e, "Broker health check failed, reconnecting");
                self.close().await;
                self.schedule_reconnect(self.settings.health_reconnect_delay);
                false
            }
        }
    }

    /// Decode one inbound message and hand it to every listener of its topic
    pub async fn dispatch(&self, message: InboundMessage) {
        metrics().message_received();

        let payload = match codec::decode_payload(&message.topic, &message.payload).and_then(
            |payload| codec::unwrap_encrypted(self.cipher.as_deref(), &message.topic, payload),
        ) {
            Ok(payload) => payload,
            Err(e) => {
                metrics().message_dropped();
                warn!(topic = %message.topic, error = %e, "Dropping inbound message");
                return;
            }
        };

        let listeners = self
            .listeners
            .read()
            .await
            .get(&message.topic)
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            debug!(topic = %message.topic, "No listener for inbound message");
            return;
        }

        for listener in listeners {
            listener.on_message(&message.topic, &payload).await;
        }
    }

    /// Start the task that drains inbound messages into [`dispatch`](Self::dispatch)
    ///
    /// Returns `None` if the dispatcher was already started.
    pub fn start_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let channel = self.self_ref.clone();

        Some(tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                channel.dispatch(message).await;
            }
            debug!("Inbound dispatcher stopped");
        }))
    }
}
