//! Discovery of devices that report in without having been registered
//!
//! Status, metric and lifecycle messages are reduced to an IP/reference pair
//! and buffered; NODE_DETAILS replies are buffered whole. Each reconciliation
//! pass drains both buffers: the lock is held only to take their contents,
//! so message handling never waits on a pass.

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::model::{Credentials, Device, DeviceStatus, SYSTEM_OWNER};
use crate::monitor::TopicHandler;
use crate::observability::metrics::metrics;
use crate::protocol::envelope::{self, RequestType};
use crate::service::{DeviceService, RegistrationRequestService};
use crate::sweep_span;
use crate::transport::channel::BrokerChannel;
use crate::transport::codec::Payload;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace, warn, Instrument};

/// Request types whose responses count as a sign of life
const SIGNAL_REQUEST_TYPES: [RequestType; 3] =
    [RequestType::Info, RequestType::Install, RequestType::Reinstall];

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub device_info_request_topic: String,
    pub topics: Vec<String>,
}

impl ReconcilerSettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let topics = &config.topics;
        let mut monitored = vec![
            topics.device_info_response.clone(),
            topics.lifecycle_response.clone(),
            topics.device_status.clone(),
            topics.device_metrics.clone(),
        ];
        monitored.sort();
        monitored.dedup();
        Self {
            device_info_request_topic: topics.device_info_request.clone(),
            topics: monitored,
        }
    }
}

#[derive(Default)]
struct Buffers {
    /// IP address to reference, last write wins
    detected: BTreeMap<String, String>,
    details: VecDeque<Payload>,
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub details_requested: usize,
    pub devices_created: usize,
}

pub struct UnknownDeviceReconciler {
    requests: RegistrationRequestService,
    devices: DeviceService,
    channel: Arc<BrokerChannel>,
    settings: ReconcilerSettings,
    buffers: Mutex<Buffers>,
}

impl UnknownDeviceReconciler {
    pub fn new(
        requests: RegistrationRequestService,
        devices: DeviceService,
        channel: Arc<BrokerChannel>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            requests,
            devices,
            channel,
            settings,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Buffer a signal or a NODE_DETAILS reply; anything else is ignored
    pub fn record(&self, payload: &Payload) {
        let (body, nested) = match payload.get(envelope::MESSAGE) {
            Some(Value::Object(inner)) => (inner.clone(), true),
            _ => (payload.clone(), false),
        };

        let (Some(ip_address), Some(reference)) = (
            envelope::response_ip_address(&body),
            envelope::text_field(&body, envelope::REFERENCE),
        ) else {
            trace!("Signal without IP address or reference");
            return;
        };
        let request_type = envelope::request_type_field(&body);

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        match request_type {
            Some(RequestType::NodeDetails) => {
                buffers.details.push_back(body);
                trace!(ip = %ip_address, "Buffered node details reply");
            }
            Some(t) if SIGNAL_REQUEST_TYPES.contains(&t) => {
                buffers.detected.insert(ip_address, reference);
            }
            _ if nested => {
                buffers.detected.insert(ip_address, reference);
            }
            _ => trace!(ip = %ip_address, "Ignoring signal with request type {:?}", request_type),
        }
    }

    fn drain(&self) -> (BTreeMap<String, String>, VecDeque<Payload>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        (
            mem::take(&mut buffers.detected),
            mem::take(&mut buffers.details),
        )
    }

    /// Number of buffered signals and details replies
    pub fn pending(&self) -> (usize, usize) {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        (buffers.detected.len(), buffers.details.len())
    }

    /// Drain the buffers once
    pub async fn reconcile(&self) -> ReconcileReport {
        let (detected, details) = self.drain();
        async {
            let mut report = ReconcileReport::default();
            for (ip_address, reference) in detected {
                match self.request_details_if_unknown(&ip_address, &reference).await {
                    Ok(true) => report.details_requested += 1,
                    Ok(false) => {}
                    Err(e) => warn!(ip = %ip_address, error = %e, "Failed to reconcile device"),
                }
            }
            for reply in details {
                match self.register_from_details(&reply).await {
                    Ok(device) => {
                        report.devices_created += 1;
                        info!(
                            device_id = %device.id,
                            ip = %device.ip_address,
                            "Registered unknown device"
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to register device from node details"),
                }
            }
            if report != ReconcileReport::default() {
                debug!(?report, "Reconciliation pass finished");
            }
            report
        }
        .instrument(sweep_span!(job = "unknown_devices"))
        .await
    }

    /// Publish a NODE_DETAILS request unless a request or a device with the
    /// same reference already claims the IP address
    async fn request_details_if_unknown(
        &self,
        ip_address: &str,
        reference: &str,
    ) -> DiscoveryResult<bool> {
        let requests = self.requests.get_by_device_ip_address(ip_address).await?;
        if !requests.is_empty() {
            trace!(ip = %ip_address, "IP address belongs to a registration request");
            return Ok(false);
        }
        if let Some(device) = self.devices.get_by_ip_address(ip_address).await? {
            if device.reference_matches(reference) {
                trace!(ip = %ip_address, device_id = %device.id, "Device already registered");
                return Ok(false);
            }
        }

        info!(ip = %ip_address, reference, "Unknown device, requesting node details");
        let payload = envelope::node_details_envelope(ip_address, reference);
        self.channel
            .send(&self.settings.device_info_request_topic, &payload)
            .await?;
        Ok(true)
    }

    async fn register_from_details(&self, reply: &Payload) -> DiscoveryResult<Device> {
        let text = |key: &str| envelope::text_field(reply, key);
        let ip_address = envelope::response_ip_address(reply)
            .ok_or_else(|| DiscoveryError::validation("Blank IP Address"))?;

        let credentials = Credentials {
            username: text("username").unwrap_or_default(),
            password: text("password"),
            public_key: text("key"),
        };
        let device = Device {
            os: text("os").unwrap_or_default(),
            name: text("name").unwrap_or_default(),
            owner: SYSTEM_OWNER.to_string(),
            ip_address,
            provider: text("provider"),
            price: reply.get("price").and_then(Value::as_f64),
            credentials,
            node_reference: text(envelope::REFERENCE),
            request_id: text(envelope::REQUEST_ID),
            status: DeviceStatus::NewDevice,
            device_info: envelope::node_info_field(reply),
            ..Default::default()
        };

        let device = self.devices.create(device).await?;
        self.devices.fleet().register(&device).await;
        metrics().device_discovered();
        Ok(device)
    }
}

#[async_trait]
impl TopicHandler for UnknownDeviceReconciler {
    fn name(&self) -> &str {
        "unknown_device_reconciler"
    }

    fn topics(&self) -> Vec<String> {
        self.settings.topics.clone()
    }

    async fn handle(&self, _topic: &str, payload: &Payload) -> DiscoveryResult<()> {
        self.record(payload);
        Ok(())
    }
}
