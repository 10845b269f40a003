//! Registration requests: the admission pipeline for candidate devices

use super::device::{Credentials, Device, DeviceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Registration pipeline status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    #[default]
    NewRequest,
    DataCollectionRequested,
    DataCollectionError,
    PendingAuthorization,
    AuthorizationReject,
    PendingOnboarding,
    OnboardingRequested,
    OnboardingError,
    Success,
}

impl RegistrationStatus {
    pub fn is_terminal(self) -> bool {
        match self {
            RegistrationStatus::DataCollectionError
            | RegistrationStatus::AuthorizationReject
            | RegistrationStatus::OnboardingError
            | RegistrationStatus::Success => true,
            RegistrationStatus::NewRequest
            | RegistrationStatus::DataCollectionRequested
            | RegistrationStatus::PendingAuthorization
            | RegistrationStatus::PendingOnboarding
            | RegistrationStatus::OnboardingRequested => false,
        }
    }

    /// Pessimistic status assumed while a response for an in-flight step is checked
    pub fn error_counterpart(self) -> Self {
        match self {
            RegistrationStatus::DataCollectionRequested => RegistrationStatus::DataCollectionError,
            RegistrationStatus::OnboardingRequested => RegistrationStatus::OnboardingError,
            RegistrationStatus::NewRequest
            | RegistrationStatus::DataCollectionError
            | RegistrationStatus::PendingAuthorization
            | RegistrationStatus::AuthorizationReject
            | RegistrationStatus::PendingOnboarding
            | RegistrationStatus::OnboardingError
            | RegistrationStatus::Success => self,
        }
    }

    /// Requests in these statuses cannot be edited or deleted by users
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            RegistrationStatus::OnboardingRequested | RegistrationStatus::Success
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::NewRequest => "NEW_REQUEST",
            RegistrationStatus::DataCollectionRequested => "DATA_COLLECTION_REQUESTED",
            RegistrationStatus::DataCollectionError => "DATA_COLLECTION_ERROR",
            RegistrationStatus::PendingAuthorization => "PENDING_AUTHORIZATION",
            RegistrationStatus::AuthorizationReject => "AUTHORIZATION_REJECT",
            RegistrationStatus::PendingOnboarding => "PENDING_ONBOARDING",
            RegistrationStatus::OnboardingRequested => "ONBOARDING_REQUESTED",
            RegistrationStatus::OnboardingError => "ONBOARDING_ERROR",
            RegistrationStatus::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate device carried inside a registration request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevicePayload {
    pub os: String,
    pub name: String,
    pub owner: String,
    pub ip_address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub credentials: Credentials,
    #[serde(default)]
    pub device_info: BTreeMap<String, String>,
}

impl DevicePayload {
    pub fn validation_errors(&self) -> Vec<String> {
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
        errors
    }

    /// Build the monitored device for an onboarded request
    ///
    /// The result has no id yet and starts as NEW_DEVICE with an empty message
    /// log; credentials are moved across explicitly.
    pub fn to_monitored_device(&self, request: &RegistrationRequest) -> Device {
        Device {
            id: String::new(),
            os: self.os.clone(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            ip_address: self.ip_address.clone(),
            port: self.port,
            credentials: Credentials {
                username: self.credentials.username.clone(),
                password: self.credentials.password.clone(),
                public_key: self.credentials.public_key.clone(),
            },
            node_reference: request.node_reference.clone(),
            request_id: Some(request.id.clone()),
            status: DeviceStatus::NewDevice,
            device_info: self.device_info.clone(),
            ..Default::default()
        }
    }
}

/// Pending admission of a candidate device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub id: String,
    pub device: DevicePayload,
    pub requester: String,
    pub request_date: DateTime<Utc>,
    #[serde(default)]
    pub last_update_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archive_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_reference: Option<String>,
    pub status: RegistrationStatus,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub version: u64,
}

impl RegistrationRequest {
    pub fn push_message<S: Into<String>>(&mut self, message: S) {
        self.messages.push(message.into());
    }

    /// Last time the request changed, falling back to its submission date
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_update_date.unwrap_or(self.request_date)
    }
}
