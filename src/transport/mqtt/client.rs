//! Impure I/O operations for the MQTT connector
//!
//! Each [`MqttConnector::open`] call builds a fresh rumqttc client and event
//! loop, waits for the broker's ConnAck and hands back a connection object.
//! The event loop task forwards every publish into the channel's inbound
//! queue and stops at the first error; reopening is the channel's job.

use super::connection::{configure_mqtt_options, ConnectionState};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::BrokerSection;
use crate::transport::{
    BrokerConnection, BrokerConnector, BrokerError, InboundMessage, TopicProducer,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Opens MQTT v5 connections for a [`BrokerChannel`](crate::transport::BrokerChannel)
pub struct MqttConnector {
    config: BrokerSection,
}

impl MqttConnector {
    pub fn new(config: BrokerSection) -> Self {
        Self { config }
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(BrokerError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(BrokerError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Connecting => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(BrokerError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Poll the event loop until it fails or the broker disconnects
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        open: Arc<AtomicBool>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        open.store(true, Ordering::SeqCst);
                        let _ = state_tx.send(ConnectionState::Connected);
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        if inbound.send(InboundMessage { topic, payload }).is_err() {
                            debug!("Inbound queue closed, stopping MQTT event loop");
                            break;
                        }
                    }
                    EventRoute::Disconnected => {
                        open.store(false, Ordering::SeqCst);
                        let _ = state_tx.send(ConnectionState::Disconnected(
                            "Broker closed the session".to_string(),
                        ));
                        break;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id } => {
                        debug!(packet_id, "Subscription confirmed");
                    }
                    EventRoute::InfrastructureEvent(_) | EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    open.store(false, Ordering::SeqCst);
                    error!(error = %e, "MQTT event loop error");
                    let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));
                    break;
                }
            }
        }
        debug!("MQTT event loop stopped");
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn open(
        &self,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mqtt_options = configure_mqtt_options(&self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let open = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            state_tx,
            open.clone(),
            inbound,
        ));

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx, self.config.connect_timeout()).await
        {
            handle.abort();
            return Err(e);
        }

        info!(broker = %self.config.broker_url, "Connected to MQTT broker");
        Ok(Arc::new(MqttConnection {
            client,
            open,
            event_loop_handle: std::sync::Mutex::new(Some(handle)),
        }))
    }
}

/// One MQTT session
pub struct MqttConnection {
    client: AsyncClient,
    open: Arc<AtomicBool>,
    event_loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn TopicProducer>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::NotConnected);
        }
        Ok(Arc::new(MqttProducer {
            client: self.client.clone(),
            topic: topic.to_string(),
            open: self.open.clone(),
        }))
    }

    async fn create_consumer(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::NotConnected);
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::SubscriptionFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
        }

        let handle = self
            .event_loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Leave the event loop a moment to flush the disconnect packet
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                handle.abort();
            });
        }
    }
}

/// Publishes to one topic over a shared MQTT client
pub struct MqttProducer {
    client: AsyncClient,
    topic: String,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl TopicProducer for MqttProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, text: &str) -> Result<(), BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        self.client
            .publish(
                self.topic.clone(),
                QoS::AtLeastOnce,
                false,
                Bytes::from(text.to_owned()),
            )
            .await
            .map_err(|e| BrokerError::PublishFailed {
                topic: self.topic.clone(),
                source: Box::new(e),
            })
    }
}
