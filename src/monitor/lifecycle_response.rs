//! Outcomes of re-install and uninstall requests

use super::TopicHandler;
use crate::error::DiscoveryResult;
use crate::model::DeviceStatus;
use crate::protocol::envelope::{self, RequestType};
use crate::service::DeviceService;
use crate::transport::codec::Payload;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Confirms or fails the status set when a lifecycle request was sent
pub struct LifecycleResponseMonitor {
    devices: DeviceService,
    topic: String,
    archive_offboarded: bool,
}

/// Status a device takes for a lifecycle response
pub fn status_for_response(request_type: RequestType, success: bool) -> Option<DeviceStatus> {
    match (request_type, success) {
        (RequestType::Reinstall, true) => Some(DeviceStatus::Onboarded),
        (RequestType::Reinstall, false) => Some(DeviceStatus::OnboardError),
        (RequestType::Uninstall, true) => Some(DeviceStatus::Offboarded),
        (RequestType::Uninstall, false) => Some(DeviceStatus::OffboardError),
        (
            RequestType::Info
            | RequestType::Install
            | RequestType::Diagnostics
            | RequestType::NodeDetails,
            _,
        ) => None,
    }
}

impl LifecycleResponseMonitor {
    pub fn new(devices: DeviceService, topic: impl Into<String>, archive_offboarded: bool) -> Self {
        Self {
            devices,
            topic: topic.into(),
            archive_offboarded,
        }
    }
}

#[async_trait]
impl TopicHandler for LifecycleResponseMonitor {
    fn name(&self) -> &str {
        "lifecycle_response_monitor"
    }

    fn topics(&self) -> Vec<String> {
        vec![self.topic.clone()]
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> DiscoveryResult<()> {
        let Some(request_type) = envelope::request_type_field(payload) else {
            debug!("Lifecycle response without a known requestType");
            return Ok(());
        };
        let (Some(ip_address), Some(reference), Some(status)) = (
            envelope::text_field(payload, envelope::DEVICE_IP_ADDRESS),
            envelope::text_field(payload, envelope::REFERENCE),
            envelope::text_field(payload, envelope::STATUS),
        ) else {
            if matches!(request_type, RequestType::Reinstall | RequestType::Uninstall) {
                warn!(
                    request_type = %request_type,
                    "Lifecycle response without ipAddress, reference or status"
                );
            }
            return Ok(());
        };
        let Some(next_status) =
            status_for_response(request_type, envelope::is_success_status(&status))
        else {
            return Ok(());
        };

        let Some(device) = self.devices.get_by_ip_address(&ip_address).await? else {
            warn!(
                ip = %ip_address,
                request_type = %request_type,
                "Lifecycle response for an unknown IP address"
            );
            return Ok(());
        };
        if device.node_reference_str().is_empty() || device.node_reference_str() != reference {
            warn!(
                device_id = %device.id,
                reference = %reference,
                device_reference = %device.node_reference_str(),
                "Lifecycle response reference mismatch"
            );
            return Ok(());
        }

        let saved = self
            .devices
            .modify(&device.id, |device| {
                device.status = next_status;
                Ok(())
            })
            .await?;
        info!(
            device_id = %saved.id,
            request_type = %request_type,
            status = %saved.status,
            "Device lifecycle status updated"
        );

        if saved.status == DeviceStatus::Offboarded && self.archive_offboarded {
            self.devices.archive(&saved.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_for_response() {
        assert_eq!(
            status_for_response(RequestType::Reinstall, true),
            Some(DeviceStatus::Onboarded)
        );
        assert_eq!(
            status_for_response(RequestType::Uninstall, false),
            Some(DeviceStatus::OffboardError)
        );
        assert_eq!(status_for_response(RequestType::Install, true), None);
    }
}
