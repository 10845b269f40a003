//! Broker transport layer
//!
//! The traits here separate the lifecycle-owning [`BrokerChannel`] from the
//! wire client underneath it. [`mqtt::MqttConnector`] is the production
//! connector; tests use the in-process broker from `testing::mocks`.

pub mod channel;
pub mod cipher;
pub mod codec;
pub mod mqtt;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use channel::{BrokerChannel, ChannelSettings};
pub use cipher::AesGcmCipher;
pub use codec::{Payload, ENCRYPTED_MESSAGE_KEY};

/// Broker transport errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Publishing to {topic} failed")]
    PublishFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Serialization error")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Channel has been shut down")]
    ShutDown,
    #[error("Undecodable message on {topic}: {reason}")]
    Decode { topic: String, reason: String },
    #[error("Failed to encrypt message: {0}")]
    Encrypt(String),
    #[error("Failed to decrypt message: {0}")]
    Decrypt(String),
    #[error("No cipher configured for encrypted messages")]
    CipherMissing,
    #[error("Gave up sending to {topic} after {attempts} attempts")]
    SendExhausted { topic: String, attempts: u32 },
}

/// A raw message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Opens connections to a broker
///
/// Messages arriving on any consumer of the returned connection are pushed
/// into `inbound`.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(
        &self,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BrokerError>;

    async fn create_consumer(&self, topic: &str) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Publishes text messages to a single topic
#[async_trait]
pub trait TopicProducer: Send + Sync {
    fn topic(&self) -> &str;

    /// Hand a message to the connection; success means accepted, not delivered
    async fn send(&self, text: &str) -> Result<(), BrokerError>;
}

/// Receives decoded messages for the topics it was subscribed to
///
/// Listeners are identified by name: registering a second listener with the
/// same name on the same topic is a no-op.
#[async_trait]
pub trait MessageListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_message(&self, topic: &str, payload: &Payload);
}

/// Whole-message encryption for the `encrypted-message` wrapper
pub trait MessageCipher: Send + Sync {
    fn encrypt(&self, plain_text: &str) -> Result<String, BrokerError>;

    fn decrypt(&self, cipher_text: &str) -> Result<String, BrokerError>;
}
