//! Outbound lifecycle requests for monitored devices

use crate::error::DiscoveryResult;
use crate::model::{Device, DeviceStatus};
use crate::protocol::envelope::{self, RequestType};
use crate::service::DeviceService;
use crate::transport::channel::BrokerChannel;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Issues re-install, uninstall and info refresh requests
///
/// The device status is moved optimistically once the request is accepted by
/// the broker; the lifecycle response monitor confirms or fails it later.
/// Publish failures are recorded on the device and never retried here.
pub struct LifecycleRequestCoordinator {
    devices: DeviceService,
    channel: Arc<BrokerChannel>,
    topic: String,
}

impl LifecycleRequestCoordinator {
    pub fn new(
        devices: DeviceService,
        channel: Arc<BrokerChannel>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            devices,
            channel,
            topic: topic.into(),
        }
    }

    /// Ask the device's agent to (re)install; ONBOARDING on success
    pub async fn request_reinstall(&self, device_id: &str) -> DiscoveryResult<Device> {
        self.request_lifecycle(
            device_id,
            RequestType::Reinstall,
            DeviceStatus::Onboarding,
            DeviceStatus::OnboardError,
        )
        .await
    }

    /// Ask the device's agent to uninstall; OFFBOARDING on success
    pub async fn request_uninstall(&self, device_id: &str) -> DiscoveryResult<Device> {
        self.request_lifecycle(
            device_id,
            RequestType::Uninstall,
            DeviceStatus::Offboarding,
            DeviceStatus::OffboardError,
        )
        .await
    }

    /// Broadcast an INFO request so every agent refreshes its reports
    pub async fn request_info_update(&self) {
        let payload = envelope::info_update_envelope();
        match self.channel.send(&self.topic, &payload).await {
            Ok(()) => debug!(topic = %self.topic, "Info update requested"),
            Err(e) => warn!(topic = %self.topic, error = %e, "Failed to request info update"),
        }
    }

    async fn request_lifecycle(
        &self,
        device_id: &str,
        request_type: RequestType,
        in_flight: DeviceStatus,
        failed: DeviceStatus,
    ) -> DiscoveryResult<Device> {
        let device = self.devices.get_required(device_id).await?;
        let payload = envelope::lifecycle_envelope(request_type, &device);

        let failure = self
            .channel
            .send(&self.topic, &payload)
            .await
            .err()
            .map(|e| e.to_string());

        let updated = self
            .devices
            .modify(device_id, |device| {
                match &failure {
                    None => device.status = in_flight,
                    Some(message) => {
                        device.status = failed;
                        device.push_message(format!("EXCEPTION {message}"));
                    }
                }
                Ok(())
            })
            .await?;

        match &failure {
            None => info!(
                device_id,
                request_type = %request_type,
                status = %updated.status,
                "Lifecycle request sent"
            ),
            Some(message) => warn!(
                device_id,
                request_type = %request_type,
                error = %message,
                "Lifecycle request failed"
            ),
        }
        Ok(updated)
    }
}
