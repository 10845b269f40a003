//! Device health and retention sweep

use super::{SweepFlag, SweepOutcome};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryResult;
use crate::model::{Device, DeviceStatus};
use crate::observability::metrics::metrics;
use crate::service::DeviceService;
use crate::sweep_span;
use crate::transport::channel::BrokerChannel;
use crate::transport::codec::Payload;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    pub automatic_failed_detection: bool,
    pub suspect_threshold: chrono::Duration,
    pub failed_threshold: chrono::Duration,
    pub automatic_archiving_enabled: bool,
    pub archiving_threshold: chrono::Duration,
    pub device_lost_topic: String,
}

impl SweeperSettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            automatic_failed_detection: config.health.automatic_failed_detection,
            suspect_threshold: config.health.suspect_threshold(),
            failed_threshold: config.health.failed_threshold(),
            automatic_archiving_enabled: config.archiving.automatic_archiving_enabled,
            archiving_threshold: config.archiving.threshold(),
            device_lost_topic: config.topics.device_lost.clone(),
        }
    }
}

/// True when every report of `device` predates `threshold`
///
/// Missing reports count as stale; the creation date is always considered.
pub fn is_silent_since(device: &Device, threshold: DateTime<Utc>) -> bool {
    let status_stale = device
        .status_update
        .as_ref()
        .map_or(true, |u| u.state_last_update < threshold);
    let metrics_stale = device
        .metrics
        .as_ref()
        .map_or(true, |m| m.timestamp < threshold);
    let created_before = device.creation_date.map_or(true, |c| c < threshold);
    status_stale && metrics_stale && created_before
}

/// Marks silent devices SUSPECT, then FAILED, and archives finished devices
pub struct HealthSweeper {
    devices: DeviceService,
    channel: Arc<BrokerChannel>,
    settings: SweeperSettings,
    running: SweepFlag,
}

impl HealthSweeper {
    pub fn new(
        devices: DeviceService,
        channel: Arc<BrokerChannel>,
        settings: SweeperSettings,
    ) -> Self {
        Self {
            devices,
            channel,
            settings,
            running: SweepFlag::new(),
        }
    }

    /// One sweep over the live devices
    pub async fn process_devices(&self) -> SweepOutcome {
        let Some(_guard) = self.running.try_acquire() else {
            metrics().sweep_skipped();
            warn!("Device processing already running");
            return SweepOutcome::AlreadyRunning;
        };

        async {
            if self.settings.automatic_failed_detection {
                if let Err(e) = self.detect_failed_devices().await {
                    error!(error = %e, "Failed to check device health");
                }
            }
            if self.settings.automatic_archiving_enabled {
                if let Err(e) = self.archive_devices().await {
                    error!(error = %e, "Failed to archive devices");
                }
            }
        }
        .instrument(sweep_span!(job = "devices"))
        .await;

        metrics().sweep_completed();
        SweepOutcome::Done
    }

    async fn detect_failed_devices(&self) -> DiscoveryResult<()> {
        let now = Utc::now();
        let suspect_threshold = now - self.settings.suspect_threshold;
        let failed_threshold = now - self.settings.failed_threshold;

        let suspects: Vec<Device> = self
            .devices
            .get_all()
            .await?
            .into_iter()
            .filter(|d| !d.status.skips_health_check())
            .filter(|d| is_silent_since(d, suspect_threshold))
            .collect();
        debug!(count = suspects.len(), "Suspect devices");

        for suspect in suspects {
            let mut failed = false;
            let result = self
                .devices
                .modify(&suspect.id, |device| {
                    failed = false;
                    if device.status.skips_health_check()
                        || !is_silent_since(device, suspect_threshold)
                    {
                        return Ok(());
                    }
                    device.status = DeviceStatus::Suspect;
                    if device.suspect_timestamp.is_none() {
                        device.suspect_timestamp = Some(now);
                        device.retries = 0;
                    } else {
                        device.retries += 1;
                    }
                    if is_silent_since(device, failed_threshold) {
                        device.status = DeviceStatus::Failed;
                        failed = true;
                    }
                    Ok(())
                })
                .await;

            let device = match result {
                Ok(device) => device,
                Err(e) => {
                    warn!(device_id = %suspect.id, error = %e, "Failed to update suspect device");
                    continue;
                }
            };

            if failed {
                metrics().device_failed();
                warn!(device_id = %device.id, name = %device.name, "Device marked FAILED");
                self.publish_device_lost(&device).await;
            } else if device.status == DeviceStatus::Suspect {
                metrics().device_suspect();
                info!(device_id = %device.id, retries = device.retries, "Device marked SUSPECT");
            }
        }
        Ok(())
    }

    async fn publish_device_lost(&self, device: &Device) {
        let notification = match json!({
            "device_name": device.name,
            "timestamp": Utc::now().timestamp(),
        }) {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        if let Err(e) = self
            .channel
            .send(&self.settings.device_lost_topic, &notification)
            .await
        {
            error!(
                device_id = %device.id,
                error = %e,
                "Failed to publish device lost notification"
            );
        }
    }

    async fn archive_devices(&self) -> DiscoveryResult<()> {
        let threshold = Utc::now() - self.settings.archiving_threshold;
        let expired: Vec<Device> = self
            .devices
            .get_all()
            .await?
            .into_iter()
            .filter(|d| d.status.is_archivable())
            .filter(|d| d.last_update_date.or(d.creation_date).map_or(true, |t| t < threshold))
            .collect();

        for device in expired {
            match self.devices.archive(&device.id).await {
                Ok(_) => info!(device_id = %device.id, status = %device.status, "Archived device"),
                Err(e) => warn!(device_id = %device.id, error = %e, "Failed to archive device"),
            }
        }
        Ok(())
    }
}
