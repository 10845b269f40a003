//! Device status reports

use super::TopicHandler;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::model::{DeviceStatus, DeviceStatusUpdate};
use crate::protocol::envelope;
use crate::service::DeviceService;
use crate::transport::codec::Payload;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// Stores the latest state report of each registered device
pub struct DeviceStatusMonitor {
    devices: DeviceService,
    topic: String,
}

impl DeviceStatusMonitor {
    pub fn new(devices: DeviceService, topic: impl Into<String>) -> Self {
        Self {
            devices,
            topic: topic.into(),
        }
    }

    /// Read a status report body; `stateLastUpdate` may be RFC 3339 or epoch millis
    pub fn parse_update(body: &Payload) -> DiscoveryResult<DeviceStatusUpdate> {
        let ip_address = envelope::text_field(body, envelope::IP_ADDRESS)
            .ok_or_else(|| DiscoveryError::validation("Status report without ipAddress"))?;
        let state_last_update = envelope::rfc3339_field(body, "stateLastUpdate")
            .or_else(|| envelope::epoch_millis_field(body, "stateLastUpdate"))
            .ok_or_else(|| DiscoveryError::validation("Status report without stateLastUpdate"))?;
        let errors = match body.get("errors") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(DeviceStatusUpdate {
            ip_address,
            client_id: envelope::text_field(body, "clientId").unwrap_or_default(),
            state: envelope::text_field(body, "state").unwrap_or_default(),
            state_last_update,
            reference: envelope::text_field(body, envelope::REFERENCE).unwrap_or_default(),
            errors,
        })
    }
}

#[async_trait]
impl TopicHandler for DeviceStatusMonitor {
    fn name(&self) -> &str {
        "device_status_monitor"
    }

    fn topics(&self) -> Vec<String> {
        vec![self.topic.clone()]
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> DiscoveryResult<()> {
        let Some(Value::Object(body)) = payload.get(envelope::MESSAGE) else {
            debug!("Status message without a message body");
            return Ok(());
        };
        if body.is_empty() {
            return Ok(());
        }
        let update = Self::parse_update(body)?;

        let Some(device) = self.devices.get_by_ip_address(&update.ip_address).await? else {
            warn!(ip = %update.ip_address, "Status report for an unknown IP address");
            return Ok(());
        };
        let reference = device.node_reference_str();
        if reference.is_empty() || reference != update.reference {
            warn!(
                device_id = %device.id,
                update_reference = %update.reference,
                device_reference = %device.node_reference_str(),
                "Status report reference does not match the device"
            );
            return Ok(());
        }
        if update.state.is_empty() {
            warn!(device_id = %device.id, "Status report without state");
            return Ok(());
        }

        let saved = self
            .devices
            .modify(&device.id, |device| {
                if let Some(current) = &device.status_update {
                    if current.state_last_update > update.state_last_update {
                        return Ok(());
                    }
                }
                device.status_update = Some(update.clone());
                if device.status == DeviceStatus::Suspect {
                    device.mark_healthy();
                }
                Ok(())
            })
            .await?;
        debug!(
            device_id = %saved.id,
            state = %update.state,
            status = %saved.status,
            "Device status updated"
        );
        Ok(())
    }
}
