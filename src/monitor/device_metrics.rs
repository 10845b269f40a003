//! Device metric reports

use super::TopicHandler;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::model::DeviceMetrics;
use crate::protocol::envelope;
use crate::service::DeviceService;
use crate::transport::codec::Payload;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

const CLIENT_ID: &str = "clientId";
const RECEIVED_AT_SERVER: &str = "receivedAtServer";
const LATEST_EVENTS: &str = "latest-events";
/// Bookkeeping keys that are not metrics
const RESERVED_KEYS: [&str; 4] = [
    CLIENT_ID,
    envelope::IP_ADDRESS,
    RECEIVED_AT_SERVER,
    "_received_at_server_timestamp",
];

/// Stores the latest metrics snapshot of each registered device
pub struct DeviceMetricsMonitor {
    devices: DeviceService,
    topic: String,
}

impl DeviceMetricsMonitor {
    pub fn new(devices: DeviceService, topic: impl Into<String>) -> Self {
        Self {
            devices,
            topic: topic.into(),
        }
    }

    /// Split a metrics report into identity, timestamp, metrics and events
    pub fn parse_metrics(body: &Payload) -> DiscoveryResult<DeviceMetrics> {
        let (Some(client_id), Some(ip_address), Some(received)) = (
            envelope::text_field(body, CLIENT_ID),
            envelope::text_field(body, envelope::IP_ADDRESS),
            envelope::text_field(body, RECEIVED_AT_SERVER),
        ) else {
            return Err(DiscoveryError::validation(
                "Device metrics without clientId, ipAddress or receivedAtServer",
            ));
        };
        let timestamp = chrono::DateTime::parse_from_rfc3339(&received)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| {
                DiscoveryError::validation(format!("Invalid receivedAtServer {received}: {e}"))
            })?;

        let latest_events = match body.get(LATEST_EVENTS) {
            Some(Value::Array(events)) => events.clone(),
            _ => Vec::new(),
        };
        let metrics = body
            .iter()
            .filter(|(key, value)| {
                !RESERVED_KEYS.contains(&key.as_str())
                    && key.as_str() != LATEST_EVENTS
                    && !value.is_null()
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(DeviceMetrics {
            ip_address,
            client_id,
            timestamp,
            metrics,
            latest_events,
        })
    }
}

#[async_trait]
impl TopicHandler for DeviceMetricsMonitor {
    fn name(&self) -> &str {
        "device_metrics_monitor"
    }

    fn topics(&self) -> Vec<String> {
        vec![self.topic.clone()]
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> DiscoveryResult<()> {
        let Some(Value::Object(body)) = payload.get(envelope::MESSAGE) else {
            debug!("Metrics message without a message body");
            return Ok(());
        };
        if body.is_empty() {
            return Ok(());
        }
        let snapshot = Self::parse_metrics(body)?;

        let Some(device) = self.devices.get_by_ip_address(&snapshot.ip_address).await? else {
            warn!(ip = %snapshot.ip_address, "Metrics for an unknown IP address");
            return Ok(());
        };

        let saved = self
            .devices
            .modify(&device.id, |device| {
                if let Some(current) = &device.metrics {
                    if current.timestamp > snapshot.timestamp {
                        return Ok(());
                    }
                }
                device.metrics = Some(snapshot.clone());
                Ok(())
            })
            .await?;
        debug!(device_id = %saved.id, metrics = snapshot.metrics.len(), "Device metrics updated");
        Ok(())
    }
}
