//! Registration request state machine
//!
//! The periodic sweep pushes NEW_REQUEST and PENDING_ONBOARDING requests to
//! the device agents and archives finished requests. Responses arrive later
//! on the data-collection response topic and are matched by `requestId`.
//!
//! Response handling evaluates each response against an immutable snapshot
//! of the request and persists the result with compare-and-swap, so a
//! concurrent admin edit or a duplicate response can never be overwritten
//! silently. A request that reached SUCCESS ignores any further response.

use super::{SweepFlag, SweepOutcome};
use crate::config::{AuthorizationPolicy, DiscoveryConfig};
use crate::error::DiscoveryResult;
use crate::model::{Device, RegistrationRequest, RegistrationStatus};
use crate::monitor::TopicHandler;
use crate::observability::metrics::metrics;
use crate::protocol::envelope::{self, RequestType};
use crate::service::{DeviceService, RegistrationRequestService, MAX_CONFLICT_RETRIES};
use crate::sweep_span;
use crate::transport::channel::BrokerChannel;
use crate::transport::codec::Payload;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Tuning for the [`ResponseCorrelator`]
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub request_topic: String,
    pub response_topic: String,
    pub allowed_device_info_keys: Vec<String>,
    pub authorization: AuthorizationPolicy,
    pub immediately_archive_success_requests: bool,
    pub automatic_archiving_enabled: bool,
    pub archiving_threshold: chrono::Duration,
}

impl CorrelatorSettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            request_topic: config.topics.data_collection_request.clone(),
            response_topic: config.topics.data_collection_response.clone(),
            allowed_device_info_keys: config.processing.allowed_device_info_keys.clone(),
            authorization: config.processing.authorization,
            immediately_archive_success_requests: config
                .processing
                .immediately_archive_success_requests,
            automatic_archiving_enabled: config.archiving.automatic_archiving_enabled,
            archiving_threshold: config.archiving.threshold(),
        }
    }
}

/// Status a request moves to once its data collection succeeded
pub fn status_after_data_collection(policy: AuthorizationPolicy) -> RegistrationStatus {
    match policy {
        AuthorizationPolicy::Manual => RegistrationStatus::PendingAuthorization,
        AuthorizationPolicy::AlwaysAuthorize => RegistrationStatus::PendingOnboarding,
        AuthorizationPolicy::AlwaysReject => RegistrationStatus::AuthorizationReject,
    }
}

pub struct ResponseCorrelator {
    requests: RegistrationRequestService,
    devices: DeviceService,
    channel: Arc<BrokerChannel>,
    settings: CorrelatorSettings,
    running: SweepFlag,
}

impl ResponseCorrelator {
    pub fn new(
        requests: RegistrationRequestService,
        devices: DeviceService,
        channel: Arc<BrokerChannel>,
        settings: CorrelatorSettings,
    ) -> Self {
        Self {
            requests,
            devices,
            channel,
            settings,
            running: SweepFlag::new(),
        }
    }

    /// One sweep over the registration requests
    ///
    /// A call made while another sweep is in flight returns
    /// [`SweepOutcome::AlreadyRunning`] without touching any request.
    pub async fn process_requests(&self) -> SweepOutcome {
        let Some(_guard) = self.running.try_acquire() else {
            metrics().sweep_skipped();
            warn!("Registration request processing already running");
            return SweepOutcome::AlreadyRunning;
        };

        async {
            if let Err(e) = self.advance_new_requests().await {
                error!(error = %e, "Failed to process new registration requests");
            }
            if let Err(e) = self.advance_onboarding_requests().await {
                error!(error = %e, "Failed to process onboarding registration requests");
            }
            if self.settings.automatic_archiving_enabled {
                if let Err(e) = self.archive_requests().await {
                    error!(error = %e, "Failed to archive registration requests");
                }
            }
        }
        .instrument(sweep_span!(job = "registration_requests"))
        .await;

        metrics().sweep_completed();
        SweepOutcome::Done
    }

    async fn advance_new_requests(&self) -> DiscoveryResult<()> {
        let pending = self
            .requests
            .get_by_status(RegistrationStatus::NewRequest)
            .await?;
        debug!(count = pending.len(), "New registration requests");

        for request in pending {
            let payload = envelope::registration_envelope(RequestType::Diagnostics, &request);
            let failure = self
                .channel
                .send(&self.settings.request_topic, &payload)
                .await
                .err()
                .map(|e| e.to_string());

            let result = self
                .requests
                .modify(&request.id, |r| {
                    if r.status != RegistrationStatus::NewRequest {
                        return Ok(());
                    }
                    match &failure {
                        None => r.status = RegistrationStatus::DataCollectionRequested,
                        Some(message) => {
                            r.status = RegistrationStatus::DataCollectionError;
                            r.push_message(format!("EXCEPTION {message}"));
                        }
                    }
                    Ok(())
                })
                .await;

            match (result, &failure) {
                (Ok(saved), None) => {
                    debug!(
                        request_id = %saved.id,
                        status = %saved.status,
                        "Data collection requested"
                    )
                }
                (Ok(_), Some(message)) => {
                    warn!(
                        request_id = %request.id,
                        error = %message,
                        "Data collection request failed"
                    )
                }
                (Err(e), _) => warn!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to save request"
                ),
            }
        }
        Ok(())
    }

    async fn advance_onboarding_requests(&self) -> DiscoveryResult<()> {
        let pending = self
            .requests
            .get_by_status(RegistrationStatus::PendingOnboarding)
            .await?;
        debug!(count = pending.len(), "Registration requests pending onboarding");

        for request in pending {
            let candidate = request.device.to_monitored_device(&request);
            let failure = match DeviceService::check_device(&candidate, true) {
                Err(e) => Some(e.to_string()),
                Ok(()) => {
                    let payload = envelope::registration_envelope(RequestType::Install, &request);
                    self.channel
                        .send(&self.settings.request_topic, &payload)
                        .await
                        .err()
                        .map(|e| e.to_string())
                }
            };

            let result = self
                .requests
                .modify(&request.id, |r| {
                    if r.status != RegistrationStatus::PendingOnboarding {
                        return Ok(());
                    }
                    match &failure {
                        None => r.status = RegistrationStatus::OnboardingRequested,
                        Some(message) => {
                            r.status = RegistrationStatus::OnboardingError;
                            r.push_message(format!("EXCEPTION {message}"));
                        }
                    }
                    Ok(())
                })
                .await;

            match (result, &failure) {
                (Ok(saved), None) => {
                    debug!(request_id = %saved.id, status = %saved.status, "Onboarding requested")
                }
                (Ok(_), Some(message)) => {
                    warn!(request_id = %request.id, error = %message, "Onboarding request failed")
                }
                (Err(e), _) => warn!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to save request"
                ),
            }
        }
        Ok(())
    }

    async fn archive_requests(&self) -> DiscoveryResult<()> {
        let threshold = Utc::now() - self.settings.archiving_threshold;
        let expired: Vec<RegistrationRequest> = self
            .requests
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.status.is_terminal() && r.last_activity() < threshold)
            .collect();

        for request in expired {
            match self.requests.archive(&request.id).await {
                Ok(_) => info!(
                    request_id = %request.id,
                    status = %request.status,
                    "Archived registration request"
                ),
                Err(e) => warn!(
                    request_id = %request.id,
                    error = %e,
                    "Failed to archive registration request"
                ),
            }
        }
        Ok(())
    }

    /// Compute the request that results from applying `response` to `snapshot`
    ///
    /// The in-flight status is first downgraded to its error counterpart and
    /// only moved forward when every check passes.
    pub fn evaluate_response(
        &self,
        snapshot: &RegistrationRequest,
        response: &Payload,
    ) -> RegistrationRequest {
        let current = snapshot.status;
        let mut next = snapshot.clone();
        next.status = current.error_counterpart();

        let request_id = snapshot.id.as_str();
        let timestamp = envelope::epoch_millis_field(response, envelope::TIMESTAMP);
        let timestamp_millis = timestamp.map(|t| t.timestamp_millis()).unwrap_or(-1);
        let mut problems = Vec::new();

        if let Some(ip) = envelope::response_ip_address(response) {
            let expected = snapshot.device.ip_address.trim();
            if ip != expected {
                problems.push(format!(
                    "Device IP address in RESPONSE does not match with that in the request: \
                     id={request_id}, ip-address-response={ip} != ip-address-in-request={expected}"
                ));
            }
        }
        if timestamp_millis < snapshot.request_date.timestamp_millis() {
            problems.push(format!(
                "Response timestamp is older than Request's date: id={request_id}, \
                 timestamp={timestamp_millis} < {}",
                snapshot.request_date.to_rfc3339()
            ));
        }
        let status = envelope::text_field(response, envelope::STATUS).unwrap_or_default();
        if status != envelope::SUCCESS_STATUS {
            problems.push(format!(
                "RESPONSE status is not SUCCESS: id={request_id}, \
                 timestamp={timestamp_millis}, status={status}"
            ));
        }

        if !problems.is_empty() {
            for problem in problems {
                warn!(request_id, problem = %problem, "Response rejected");
                next.push_message(problem);
            }
            return next;
        }

        let mut node_info = envelope::node_info_field(response);
        if node_info.is_empty() {
            debug!(request_id, "No node info in response, keeping the submitted device info");
            node_info = snapshot.device.device_info.clone();
        }
        let accepted =
            envelope::filter_device_info(&node_info, &self.settings.allowed_device_info_keys);
        next.device.device_info.extend(accepted);

        next.status = match current {
            RegistrationStatus::DataCollectionRequested => {
                status_after_data_collection(self.settings.authorization)
            }
            RegistrationStatus::OnboardingRequested => {
                if let Some(reference) = envelope::text_field(response, envelope::REFERENCE) {
                    next.node_reference = Some(reference);
                }
                RegistrationStatus::Success
            }
            RegistrationStatus::NewRequest
            | RegistrationStatus::DataCollectionError
            | RegistrationStatus::PendingAuthorization
            | RegistrationStatus::AuthorizationReject
            | RegistrationStatus::PendingOnboarding
            | RegistrationStatus::OnboardingError
            | RegistrationStatus::Success => current,
        };
        next
    }

    /// Apply one data-collection or onboarding response
    pub async fn handle_response(&self, response: &Payload) -> DiscoveryResult<()> {
        if let Some(request_type) = envelope::request_type_field(response) {
            if !matches!(request_type, RequestType::Diagnostics | RequestType::Install) {
                debug!(request_type = %request_type, "Not a registration response");
                return Ok(());
            }
        }
        let Some(request_id) = envelope::text_field(response, envelope::REQUEST_ID) else {
            debug!("Response without requestId");
            return Ok(());
        };

        let mut attempt = 0;
        let saved = loop {
            attempt += 1;
            let Some(snapshot) = self.requests.get(&request_id).await? else {
                debug!(request_id = %request_id, "Response for unknown or archived request");
                return Ok(());
            };
            if snapshot.status == RegistrationStatus::Success {
                warn!(
                    request_id = %request_id,
                    "Ignoring response for a request already in SUCCESS"
                );
                return Ok(());
            }

            let next = self.evaluate_response(&snapshot, response);
            if next == snapshot {
                return Ok(());
            }
            match self.requests.save_snapshot(next).await {
                Ok(saved) => break saved,
                Err(e) if e.is_version_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(
                        request_id = %request_id,
                        attempt,
                        "Request changed while handling response, re-evaluating"
                    );
                }
                Err(e) => return Err(e),
            }
        };
        info!(
            request_id = %saved.id,
            status = %saved.status,
            "Registration request updated from response"
        );

        if saved.status != RegistrationStatus::Success {
            return Ok(());
        }

        if let Err(e) = self.materialize_device(&saved).await {
            error!(request_id = %saved.id, error = %e, "Failed to copy device to monitoring");
            let message = format!("Exception while copying device to monitoring subsystem: {e}");
            self.requests
                .modify(&saved.id, |r| {
                    if r.status == RegistrationStatus::Success {
                        r.status = RegistrationStatus::OnboardingError;
                        r.push_message(message.clone());
                    }
                    Ok(())
                })
                .await?;
            return Ok(());
        }

        if self.settings.immediately_archive_success_requests {
            self.requests.archive(&saved.id).await?;
        }
        Ok(())
    }

    async fn materialize_device(&self, request: &RegistrationRequest) -> DiscoveryResult<Device> {
        let candidate = request.device.to_monitored_device(request);
        let device = self.devices.create(candidate).await?;
        self.devices.fleet().register(&device).await;
        metrics().device_discovered();
        info!(
            device_id = %device.id,
            request_id = %request.id,
            ip = %device.ip_address,
            "Onboarded device added to monitoring"
        );
        Ok(device)
    }
}

#[async_trait]
impl TopicHandler for ResponseCorrelator {
    fn name(&self) -> &str {
        "response_correlator"
    }

    fn topics(&self) -> Vec<String> {
        vec![self.settings.response_topic.clone()]
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> DiscoveryResult<()> {
        self.handle_response(payload).await
    }
}
