//! Mock implementations for testing
//!
//! [`MemoryBroker`] stands in for a real broker behind [`BrokerChannel`]: it
//! records every published message, lets tests push inbound messages to
//! subscribed topics, and can be told to fail opens, sends or subscriptions.
//!
//! [`BrokerChannel`]: crate::transport::BrokerChannel

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::fleet::FleetRegistry;
use crate::model::Device;
use crate::transport::codec::{self, Payload};
use crate::transport::{
    BrokerConnection, BrokerConnector, BrokerError, InboundMessage, MessageCipher, TopicProducer,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

pub type PublishedMessage = (String, String);

#[derive(Default)]
struct BrokerState {
    published: Vec<PublishedMessage>,
    subscriptions: BTreeSet<String>,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
    current: Option<Arc<AtomicBool>>,
    opens: u32,
    failing_opens: u32,
    failing_sends: u32,
    failing_subscriptions: u32,
    send_delay: Duration,
}

/// In-process broker with failure injection
#[derive(Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.state).failing_opens = count;
    }

    /// Reject the next `count` sends
    pub fn fail_next_sends(&self, count: u32) {
        lock(&self.state).failing_sends = count;
    }

    /// Reject the next `count` consumer creations
    pub fn fail_next_subscriptions(&self, count: u32) {
        lock(&self.state).failing_subscriptions = count;
    }

    /// Delay every send, giving concurrent callers a chance to interleave
    pub fn set_send_delay(&self, delay: Duration) {
        lock(&self.state).send_delay = delay;
    }

    /// Mark the current connection as dropped by the broker
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        if let Some(open) = state.current.take() {
            open.store(false, Ordering::SeqCst);
        }
        state.subscriptions.clear();
    }

    pub fn open_count(&self) -> u32 {
        lock(&self.state).opens
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state)
            .current
            .as_ref()
            .map(|open| open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Topics with a consumer on the current connection
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.state).subscriptions.iter().cloned().collect()
    }

    pub fn all_published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Decoded payloads published on `topic`, oldest first
    pub fn published(&self, topic: &str) -> Vec<Payload> {
        lock(&self.state)
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(t, text)| codec::decode_payload(t, text.as_bytes()).ok())
            .collect()
    }

    pub fn clear_published(&self) {
        lock(&self.state).published.clear();
    }

    /// Deliver `payload` to `topic`; returns false when nobody is subscribed
    pub fn inject(&self, topic: &str, payload: &Payload) -> bool {
        match codec::encode_payload(payload) {
            Ok(text) => self.inject_raw(topic, text.into_bytes()),
            Err(_) => false,
        }
    }

    /// Deliver raw bytes to `topic`; returns false when nobody is subscribed
    pub fn inject_raw(&self, topic: &str, bytes: Vec<u8>) -> bool {
        let state = lock(&self.state);
        if !state.subscriptions.contains(topic) {
            return false;
        }
        match &state.inbound {
            Some(inbound) => inbound.send(InboundMessage::new(topic, bytes)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn open(
        &self,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = lock(&self.state);
        if take_failure(&mut state.failing_opens) {
            return Err(BrokerError::ConnectionFailedStr(
                "broker unavailable".to_string(),
            ));
        }
        state.opens += 1;
        state.inbound = Some(inbound);
        state.subscriptions.clear();
        let open = Arc::new(AtomicBool::new(true));
        state.current = Some(open.clone());
        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            open,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::NotConnected);
        }
        Ok(Arc::new(MemoryProducer {
            topic: topic.to_string(),
            state: self.state.clone(),
            open: self.open.clone(),
        }))
    }

    async fn create_consumer(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::NotConnected);
        }
        let mut state = lock(&self.state);
        if take_failure(&mut state.failing_subscriptions) {
            return Err(BrokerError::SubscriptionFailed {
                topic: topic.to_string(),
                source: "subscription refused".into(),
            });
        }
        state.subscriptions.insert(topic.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut state = lock(&self.state);
        let is_current = state
            .current
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &self.open))
            .unwrap_or(false);
        if is_current {
            state.current = None;
            state.subscriptions.clear();
        }
    }
}

struct MemoryProducer {
    topic: String,
    state: Arc<Mutex<BrokerState>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl TopicProducer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, text: &str) -> Result<(), BrokerError> {
        let delay = lock(&self.state).send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let mut state = lock(&self.state);
        if take_failure(&mut state.failing_sends) {
            return Err(BrokerError::PublishFailed {
                topic: self.topic.clone(),
                source: "send refused".into(),
            });
        }
        state.published.push((self.topic.clone(), text.to_string()));
        Ok(())
    }
}

/// Fleet registry that records device ids and can be switched to failing
#[derive(Default)]
pub struct RecordingFleetRegistry {
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingFleetRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, into: &Mutex<Vec<String>>, device: &Device) -> DiscoveryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::fleet(format!(
                "fleet unavailable for {}",
                device.id
            )));
        }
        into.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(device.id.clone());
        Ok(())
    }
}

#[async_trait]
impl FleetRegistry for RecordingFleetRegistry {
    async fn register(&self, device: &Device) -> DiscoveryResult<()> {
        self.record(&self.registered, device)
    }

    async fn deregister(&self, device: &Device) -> DiscoveryResult<()> {
        self.record(&self.deregistered, device)
    }
}

/// Cipher that reverses the text; only useful to observe the wrapper
#[derive(Debug, Default)]
pub struct ReversingCipher;

impl MessageCipher for ReversingCipher {
    fn encrypt(&self, plain_text: &str) -> Result<String, BrokerError> {
        Ok(plain_text.chars().rev().collect())
    }

    fn decrypt(&self, cipher_text: &str) -> Result<String, BrokerError> {
        Ok(cipher_text.chars().rev().collect())
    }
}
