//! Monitored devices and the reports they send in

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Owner recorded on devices that were discovered rather than registered
pub const SYSTEM_OWNER: &str = "--EMS--";

/// Device lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    #[default]
    NewDevice,
    OnHold,
    Onboarding,
    Onboarded,
    OnboardError,
    Healthy,
    Suspect,
    Failed,
    Busy,
    Idle,
    Offboarding,
    Offboarded,
    OffboardError,
    Compromised,
}

impl DeviceStatus {
    /// Terminal statuses are never left by automatic processing
    pub fn is_terminal(self) -> bool {
        match self {
            DeviceStatus::OnboardError
            | DeviceStatus::Failed
            | DeviceStatus::Offboarded
            | DeviceStatus::OffboardError
            | DeviceStatus::Compromised => true,
            DeviceStatus::NewDevice
            | DeviceStatus::OnHold
            | DeviceStatus::Onboarding
            | DeviceStatus::Onboarded
            | DeviceStatus::Healthy
            | DeviceStatus::Suspect
            | DeviceStatus::Busy
            | DeviceStatus::Idle
            | DeviceStatus::Offboarding => false,
        }
    }

    /// Statuses skipped by the staleness check
    pub fn skips_health_check(self) -> bool {
        match self {
            DeviceStatus::OnHold
            | DeviceStatus::Onboarding
            | DeviceStatus::Failed
            | DeviceStatus::Offboarding
            | DeviceStatus::Offboarded
            | DeviceStatus::OffboardError => true,
            DeviceStatus::NewDevice
            | DeviceStatus::Onboarded
            | DeviceStatus::OnboardError
            | DeviceStatus::Healthy
            | DeviceStatus::Suspect
            | DeviceStatus::Busy
            | DeviceStatus::Idle
            | DeviceStatus::Compromised => false,
        }
    }

    /// Statuses eligible for automatic archiving once past retention
    pub fn is_archivable(self) -> bool {
        matches!(
            self,
            DeviceStatus::Failed | DeviceStatus::Offboarded | DeviceStatus::OffboardError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::NewDevice => "NEW_DEVICE",
            DeviceStatus::OnHold => "ON_HOLD",
            DeviceStatus::Onboarding => "ONBOARDING",
            DeviceStatus::Onboarded => "ONBOARDED",
            DeviceStatus::OnboardError => "ONBOARD_ERROR",
            DeviceStatus::Healthy => "HEALTHY",
            DeviceStatus::Suspect => "SUSPECT",
            DeviceStatus::Failed => "FAILED",
            DeviceStatus::Busy => "BUSY",
            DeviceStatus::Idle => "IDLE",
            DeviceStatus::Offboarding => "OFFBOARDING",
            DeviceStatus::Offboarded => "OFFBOARDED",
            DeviceStatus::OffboardError => "OFFBOARD_ERROR",
            DeviceStatus::Compromised => "COMPROMISED",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login credentials for a device; at least one secret must be present
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Credentials {
    pub fn with_password<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            public_key: None,
        }
    }

    pub fn with_public_key<U: Into<String>, K: Into<String>>(username: U, key: K) -> Self {
        Self {
            username: username.into(),
            password: None,
            public_key: Some(key.into()),
        }
    }

    /// True when a non-blank password or public key is present
    pub fn has_secret(&self) -> bool {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false)
        };
        present(&self.password) || present(&self.public_key)
    }

    pub(crate) fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.username.trim().is_empty() {
            errors.push("Blank Username".to_string());
        }
        if !self.has_secret() {
            errors.push("Blank Password and Public Key".to_string());
        }
        errors
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("public_key", &self.public_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Latest state report received from a device's monitoring agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusUpdate {
    pub ip_address: String,
    pub client_id: String,
    pub state: String,
    pub state_last_update: DateTime<Utc>,
    pub reference: String,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Latest metrics snapshot received from a device's monitoring agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub ip_address: String,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Value>,
    #[serde(default)]
    pub latest_events: Vec<Value>,
}

/// A device under monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub os: String,
    pub name: String,
    pub owner: String,
    pub ip_address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    pub credentials: Credentials,
    /// Opaque token assigned by the remote agent
    #[serde(default)]
    pub node_reference: Option<String>,
    /// Registration request this device was onboarded through
    #[serde(default)]
    pub request_id: Option<String>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub status_update: Option<DeviceStatusUpdate>,
    #[serde(default)]
    pub metrics: Option<DeviceMetrics>,
    #[serde(default)]
    pub suspect_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub device_info: BTreeMap<String, String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archive_date: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl Device {
    /// Validate required fields; `dry_run` skips the ones assigned on persist
    pub fn validation_errors(&self, dry_run: bool) -> Vec<String> {
        let mut errors = Vec::new();
        if self.os.trim().is_empty() {
            errors.push("Blank OS".to_string());
        }
        if self.owner.trim().is_empty() {
            errors.push("Blank Owner".to_string());
        }
        if self.ip_address.trim().is_empty() {
            errors.push("Blank IP Address".to_string());
        }
        errors.extend(self.credentials.validation_errors());

        if !dry_run {
            if self.id.trim().is_empty() {
                errors.push("Blank Id".to_string());
            }
            if self.node_reference_str().is_empty() {
                errors.push("Blank Node Reference".to_string());
            }
            if self.creation_date.is_none() {
                errors.push("Null Creation Date".to_string());
            }
        }
        errors
    }

    pub fn node_reference_str(&self) -> &str {
        self.node_reference.as_deref().map(str::trim).unwrap_or("")
    }

    /// True when `reference` matches the stored node reference, ignoring case
    pub fn reference_matches(&self, reference: &str) -> bool {
        let stored = self.node_reference_str();
        !stored.is_empty() && stored.eq_ignore_ascii_case(reference.trim())
    }

    /// Clear staleness bookkeeping and report the device as healthy
    pub fn mark_healthy(&mut self) {
        self.status = DeviceStatus::Healthy;
        self.suspect_timestamp = None;
        self.retries = 0;
    }

    pub fn push_message<S: Into<String>>(&mut self, message: S) {
        self.messages.push(message.into());
    }

    /// Most recent point in time the device is known to have been alive
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        [
            self.status_update.as_ref().map(|u| u.state_last_update),
            self.metrics.as_ref().map(|m| m.timestamp),
            self.creation_date,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}
