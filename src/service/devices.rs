//! Device management: creation, updates, archiving and lookups

use super::{modify_record, move_record, write_error};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::fleet::FleetNotifier;
use crate::model::{Credentials, Device, DeviceStatus};
use crate::observability::metrics::metrics;
use crate::store::DeviceStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Device operations over the live and archive stores
#[derive(Clone)]
pub struct DeviceService {
    devices: Arc<DeviceStore>,
    archive: Arc<DeviceStore>,
    fleet: FleetNotifier,
}

impl DeviceService {
    /// `devices` must keep IP addresses unique; `archive` must not
    pub fn new(
        devices: Arc<DeviceStore>,
        archive: Arc<DeviceStore>,
        fleet: FleetNotifier,
    ) -> Self {
        Self {
            devices,
            archive,
            fleet,
        }
    }

    pub fn fleet(&self) -> &FleetNotifier {
        &self.fleet
    }

    pub async fn get(&self, id: &str) -> DiscoveryResult<Option<Device>> {
        Ok(self.devices.find_by_id(id).await?)
    }

    pub async fn get_required(&self, id: &str) -> DiscoveryResult<Device> {
        self.get(id)
            .await?
            .ok_or_else(|| DiscoveryError::not_found("Device", id))
    }

    pub async fn get_all(&self) -> DiscoveryResult<Vec<Device>> {
        Ok(self.devices.find_all().await?)
    }

    pub async fn get_by_owner(&self, owner: &str) -> DiscoveryResult<Vec<Device>> {
        Ok(self.devices.find_by_owner(owner).await?)
    }

    /// The live device holding `ip_address`, if any
    pub async fn get_by_ip_address(&self, ip_address: &str) -> DiscoveryResult<Option<Device>> {
        Ok(self
            .devices
            .find_by_ip_address(ip_address)
            .await?
            .into_iter()
            .next())
    }

    pub async fn get_archived(&self, id: &str) -> DiscoveryResult<Option<Device>> {
        Ok(self.archive.find_by_id(id).await?)
    }

    pub async fn get_all_archived(&self) -> DiscoveryResult<Vec<Device>> {
        Ok(self.archive.find_all().await?)
    }

    /// True when a live device other than `exclude_id` uses `ip_address`
    pub async fn is_ip_address_in_use(
        &self,
        ip_address: &str,
        exclude_id: Option<&str>,
    ) -> DiscoveryResult<bool> {
        Ok(self
            .devices
            .find_by_ip_address(ip_address)
            .await?
            .iter()
            .any(|d| Some(d.id.as_str()) != exclude_id))
    }

    /// Validate a device, collecting every problem into one error
    pub fn check_device(device: &Device, dry_run: bool) -> DiscoveryResult<()> {
        let messages = device.validation_errors(dry_run);
        if messages.is_empty() {
            Ok(())
        } else {
            Err(DiscoveryError::Validation { messages })
        }
    }

    /// Early, friendlier rejection; the live store enforces the same rule on write
    async fn ensure_ip_available(
        &self,
        ip_address: &str,
        exclude_id: Option<&str>,
    ) -> DiscoveryResult<()> {
        if self.is_ip_address_in_use(ip_address, exclude_id).await? {
            return Err(DiscoveryError::conflict(format!(
                "IP address {ip_address} is already used by another device"
            )));
        }
        Ok(())
    }

    /// Persist a new device: fresh id, NEW_DEVICE, creation date set now
    pub async fn create(&self, mut device: Device) -> DiscoveryResult<Device> {
        if !device.id.trim().is_empty() {
            return Err(DiscoveryError::validation(format!(
                "New device must not have an id: {}",
                device.id
            )));
        }
        if device.status != DeviceStatus::NewDevice {
            return Err(DiscoveryError::invalid_state(format!(
                "New device must have status NEW_DEVICE, found {}",
                device.status
            )));
        }
        Self::check_device(&device, true)?;
        self.ensure_ip_available(&device.ip_address, None).await?;

        device.id = Uuid::new_v4().to_string();
        device.creation_date = Some(Utc::now());
        device.last_update_date = None;
        device.archive_date = None;
        device.version = 0;

        let stored = self.devices.insert(device).await.map_err(write_error)?;
        info!(device_id = %stored.id, ip = %stored.ip_address, "Device created");
        Ok(stored)
    }

    /// Replace a device with an edited snapshot
    ///
    /// Fails with a store conflict when the snapshot is stale.
    pub async fn update(&self, mut device: Device) -> DiscoveryResult<Device> {
        self.get_required(&device.id).await?;
        Self::check_device(&device, true)?;
        self.ensure_ip_available(&device.ip_address, Some(&device.id))
            .await?;
        device.last_update_date = Some(Utc::now());
        self.devices.save(device).await.map_err(write_error)
    }

    /// Apply `mutate` to the current snapshot with compare-and-swap retries
    pub async fn modify<F>(&self, id: &str, mutate: F) -> DiscoveryResult<Device>
    where
        F: FnMut(&mut Device) -> DiscoveryResult<()> + Send,
    {
        modify_record(self.devices.as_ref(), id, mutate).await
    }

    pub async fn set_compromised(&self, id: &str) -> DiscoveryResult<Device> {
        self.modify(id, |device| {
            device.status = DeviceStatus::Compromised;
            Ok(())
        })
        .await
    }

    /// Remove a device from the live store without archiving it
    pub async fn delete(&self, id: &str) -> DiscoveryResult<Device> {
        let device = self.get_required(id).await?;
        self.fleet.deregister(&device).await;
        self.devices.delete(id).await?;
        info!(device_id = %id, "Device deleted");
        Ok(device)
    }

    /// Move a device to the archive store
    pub async fn archive(&self, id: &str) -> DiscoveryResult<Device> {
        let device = self.get_required(id).await?;
        self.fleet.deregister(&device).await;

        let mut archived = device;
        archived.archive_date = Some(Utc::now());
        let archived =
            move_record(self.devices.as_ref(), self.archive.as_ref(), archived).await?;

        metrics().record_archived();
        info!(device_id = %id, status = %archived.status, "Device archived");
        Ok(archived)
    }

    /// Restore an archived device under its original id with new credentials
    pub async fn unarchive(&self, id: &str, credentials: Credentials) -> DiscoveryResult<Device> {
        let problems = credentials.validation_errors();
        if !problems.is_empty() {
            return Err(DiscoveryError::Validation { messages: problems });
        }

        let archived = self
            .archive
            .find_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::not_found("Archived device", id))?;
        self.ensure_ip_available(&archived.ip_address, None).await?;

        let mut restored = archived;
        restored.archive_date = None;
        restored.credentials = credentials;
        restored.status = DeviceStatus::NewDevice;
        restored.suspect_timestamp = None;
        restored.retries = 0;
        restored.status_update = None;
        restored.metrics = None;
        restored.last_update_date = Some(Utc::now());
        restored.push_message("Device restored from archive");

        let restored = self.devices.insert(restored).await.map_err(write_error)?;
        self.archive.delete(id).await?;
        self.fleet.register(&restored).await;

        info!(device_id = %id, "Device unarchived");
        Ok(restored)
    }
}
