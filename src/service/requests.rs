//! Registration request management for the administrative boundary

use super::{modify_record, move_record, write_error};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::model::{Credentials, DevicePayload, RegistrationRequest, RegistrationStatus};
use crate::observability::metrics::metrics;
use crate::store::{DeviceStore, RequestStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct RegistrationRequestService {
    requests: Arc<RequestStore>,
    archive: Arc<RequestStore>,
    devices: Arc<DeviceStore>,
}

impl RegistrationRequestService {
    pub fn new(
        requests: Arc<RequestStore>,
        archive: Arc<RequestStore>,
        devices: Arc<DeviceStore>,
    ) -> Self {
        Self {
            requests,
            archive,
            devices,
        }
    }

    pub async fn get(&self, id: &str) -> DiscoveryResult<Option<RegistrationRequest>> {
        Ok(self.requests.find_by_id(id).await?)
    }

    pub async fn get_required(&self, id: &str) -> DiscoveryResult<RegistrationRequest> {
        self.get(id)
            .await?
            .ok_or_else(|| DiscoveryError::not_found("RegistrationRequest", id))
    }

    pub async fn get_all(&self) -> DiscoveryResult<Vec<RegistrationRequest>> {
        Ok(self.requests.find_all().await?)
    }

    pub async fn get_by_requester(
        &self,
        requester: &str,
    ) -> DiscoveryResult<Vec<RegistrationRequest>> {
        Ok(self.requests.find_by_owner(requester).await?)
    }

    pub async fn get_by_device_ip_address(
        &self,
        ip_address: &str,
    ) -> DiscoveryResult<Vec<RegistrationRequest>> {
        Ok(self.requests.find_by_ip_address(ip_address).await?)
    }

    /// Requests currently in `status`
    pub async fn get_by_status(
        &self,
        status: RegistrationStatus,
    ) -> DiscoveryResult<Vec<RegistrationRequest>> {
        Ok(self
            .requests
            .find_all()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    pub async fn get_archived(&self, id: &str) -> DiscoveryResult<Option<RegistrationRequest>> {
        Ok(self.archive.find_by_id(id).await?)
    }

    pub async fn get_all_archived(&self) -> DiscoveryResult<Vec<RegistrationRequest>> {
        Ok(self.archive.find_all().await?)
    }

    fn check_payload(payload: &DevicePayload) -> DiscoveryResult<()> {
        let messages = payload.validation_errors();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(DiscoveryError::Validation { messages })
        }
    }

    /// Reject an IP already claimed by another live request or a live device
    async fn ensure_ip_available(
        &self,
        ip_address: &str,
        exclude_id: Option<&str>,
    ) -> DiscoveryResult<()> {
        let claimed_by_request = self
            .requests
            .find_by_ip_address(ip_address)
            .await?
            .iter()
            .any(|r| Some(r.id.as_str()) != exclude_id);
        if claimed_by_request {
            return Err(DiscoveryError::conflict(format!(
                "IP address {ip_address} is already used by another registration request"
            )));
        }
        if !self.devices.find_by_ip_address(ip_address).await?.is_empty() {
            return Err(DiscoveryError::conflict(format!(
                "IP address {ip_address} is already used by a registered device"
            )));
        }
        Ok(())
    }

    /// Accept a user submission as a NEW_REQUEST
    pub async fn submit(
        &self,
        device: DevicePayload,
        requester: &str,
    ) -> DiscoveryResult<RegistrationRequest> {
        if requester.trim().is_empty() {
            return Err(DiscoveryError::validation("Blank Requester"));
        }
        Self::check_payload(&device)?;
        self.ensure_ip_available(&device.ip_address, None).await?;

        let request = RegistrationRequest {
            id: Uuid::new_v4().to_string(),
            device,
            requester: requester.to_string(),
            request_date: Utc::now(),
            status: RegistrationStatus::NewRequest,
            ..Default::default()
        };
        let stored = self.requests.insert(request).await.map_err(write_error)?;
        info!(
            request_id = %stored.id,
            requester,
            ip = %stored.device.ip_address,
            "Registration request submitted"
        );
        Ok(stored)
    }

    /// Replace a request with an edited snapshot
    pub async fn update(
        &self,
        mut request: RegistrationRequest,
    ) -> DiscoveryResult<RegistrationRequest> {
        let current = self.get_required(&request.id).await?;
        if current.status.is_locked() {
            return Err(DiscoveryError::invalid_state(format!(
                "Registration request {} cannot be updated in status {}",
                current.id, current.status
            )));
        }
        Self::check_payload(&request.device)?;
        self.ensure_ip_available(&request.device.ip_address, Some(&request.id))
            .await?;
        request.last_update_date = Some(Utc::now());
        self.requests.save(request).await.map_err(write_error)
    }

    /// Apply `mutate` to the current snapshot with compare-and-swap retries
    pub async fn modify<F>(&self, id: &str, mutate: F) -> DiscoveryResult<RegistrationRequest>
    where
        F: FnMut(&mut RegistrationRequest) -> DiscoveryResult<()> + Send,
    {
        modify_record(self.requests.as_ref(), id, mutate).await
    }

    /// Persist a snapshot computed from an earlier read; stale snapshots fail
    pub async fn save_snapshot(
        &self,
        mut request: RegistrationRequest,
    ) -> DiscoveryResult<RegistrationRequest> {
        request.last_update_date = Some(Utc::now());
        Ok(self.requests.save(request).await?)
    }

    pub async fn delete(&self, id: &str) -> DiscoveryResult<RegistrationRequest> {
        let current = self.get_required(id).await?;
        if current.status.is_locked() {
            return Err(DiscoveryError::invalid_state(format!(
                "Registration request {} cannot be deleted in status {}",
                current.id, current.status
            )));
        }
        self.requests.delete(id).await?;
        info!(request_id = %id, "Registration request deleted");
        Ok(current)
    }

    /// Admin decision on a request waiting for authorization
    pub async fn authorize(
        &self,
        id: &str,
        authorized: bool,
    ) -> DiscoveryResult<RegistrationRequest> {
        let request = self
            .modify(id, |request| {
                if request.status != RegistrationStatus::PendingAuthorization {
                    return Err(DiscoveryError::invalid_state(format!(
                        "Registration request {} is not pending authorization: {}",
                        request.id, request.status
                    )));
                }
                request.status = if authorized {
                    RegistrationStatus::PendingOnboarding
                } else {
                    RegistrationStatus::AuthorizationReject
                };
                Ok(())
            })
            .await?;
        info!(
            request_id = %id,
            status = %request.status,
            "Registration request authorization decided"
        );
        Ok(request)
    }

    pub async fn archive(&self, id: &str) -> DiscoveryResult<RegistrationRequest> {
        let mut request = self.get_required(id).await?;
        request.archive_date = Some(Utc::now());
        let archived = move_record(self.requests.as_ref(), self.archive.as_ref(), request).await?;
        metrics().record_archived();
        info!(request_id = %id, status = %archived.status, "Registration request archived");
        Ok(archived)
    }

    /// Restore an archived request with fresh device credentials
    pub async fn unarchive(
        &self,
        id: &str,
        credentials: Credentials,
    ) -> DiscoveryResult<RegistrationRequest> {
        let problems = credentials.validation_errors();
        if !problems.is_empty() {
            return Err(DiscoveryError::Validation { messages: problems });
        }
        let mut restored = self
            .archive
            .find_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::not_found("Archived registration request", id))?;
        self.ensure_ip_available(&restored.device.ip_address, None)
            .await?;

        restored.archive_date = None;
        restored.device.credentials = credentials;
        restored.last_update_date = Some(Utc::now());
        restored.push_message("Registration request restored from archive");

        let restored = self.requests.insert(restored).await.map_err(write_error)?;
        self.archive.delete(id).await?;
        info!(request_id = %id, "Registration request unarchived");
        Ok(restored)
    }
}
