//! Topic monitors
//!
//! A monitor is a [`TopicHandler`]: it names the topics it wants and handles
//! one decoded payload at a time. [`MonitorDispatcher`] turns a handler into a
//! broker listener and owns the subscription bootstrap, which waits for a
//! startup delay and keeps retrying the topics that failed to subscribe.
//! Handler errors are logged and the message is dropped.

pub mod device_metrics;
pub mod lifecycle_response;
pub mod status;

pub use device_metrics::DeviceMetricsMonitor;
pub use lifecycle_response::LifecycleResponseMonitor;
pub use status::DeviceStatusMonitor;

use crate::error::DiscoveryResult;
use crate::monitor_span;
use crate::observability::metrics::metrics;
use crate::transport::channel::BrokerChannel;
use crate::transport::codec::Payload;
use crate::transport::MessageListener;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Handles decoded payloads for a fixed set of topics
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn name(&self) -> &str;

    fn topics(&self) -> Vec<String>;

    async fn handle(&self, topic: &str, payload: &Payload) -> DiscoveryResult<()>;
}

/// Broker listener wrapping one [`TopicHandler`]
pub struct MonitorDispatcher {
    handler: Arc<dyn TopicHandler>,
}

impl MonitorDispatcher {
    pub fn new(handler: Arc<dyn TopicHandler>) -> Arc<Self> {
        Arc::new(Self { handler })
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    /// Subscribe to every topic not in `done`; returns the topics still missing
    pub async fn subscribe_pending(
        self: &Arc<Self>,
        channel: &BrokerChannel,
        done: &mut BTreeSet<String>,
    ) -> Vec<String> {
        let mut missing = Vec::new();
        for topic in self.handler.topics() {
            if done.contains(&topic) {
                continue;
            }
            let listener: Arc<dyn MessageListener> = self.clone();
            match channel.subscribe(&topic, listener).await {
                Ok(()) => {
                    done.insert(topic);
                }
                Err(e) => {
                    warn!(
                        monitor = self.handler.name(),
                        topic = %topic,
                        error = %e,
                        "Subscription failed"
                    );
                    missing.push(topic);
                }
            }
        }
        missing
    }

    /// Subscribe to all topics, retrying after `retry_delay` until none is missing
    pub async fn bootstrap(self: Arc<Self>, channel: Arc<BrokerChannel>, retry_delay: Duration) {
        let mut done = BTreeSet::new();
        loop {
            let missing = self.subscribe_pending(&channel, &mut done).await;
            if missing.is_empty() {
                info!(monitor = self.handler.name(), topics = ?done, "Monitor subscribed");
                return;
            }
            debug!(
                monitor = self.handler.name(),
                missing = ?missing,
                retry_in_secs = retry_delay.as_secs(),
                "Retrying subscriptions"
            );
            tokio::time::sleep(retry_delay).await;
        }
    }
}

#[async_trait]
impl MessageListener for MonitorDispatcher {
    fn name(&self) -> &str {
        self.handler.name()
    }

    async fn on_message(&self, topic: &str, payload: &Payload) {
        let span = monitor_span!(monitor = self.handler.name(), topic = %topic);
        if let Err(e) = self.handler.handle(topic, payload).instrument(span).await {
            metrics().message_dropped();
            warn!(monitor = self.handler.name(), topic = %topic, error = %e, "Dropping message");
        }
    }
}
