//! Error types for the resource discovery engine
//!
//! Domain errors raised to the administrative boundary are converted into a
//! structured `{kind, message}` payload. Background jobs never surface these;
//! they log them and record them on the affected entity instead.

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::transport::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for discovery operations
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Validation failed: {}", messages.join("; "))]
    Validation { messages: Vec<String> },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Fleet registration error: {message}")]
    Fleet { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Machine-readable error category exposed to callers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Conflict,
    InvalidState,
    StoreError,
    BrokerError,
    FleetError,
    ConfigError,
    InternalError,
}

/// Structured error payload returned by administrative entry points
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl DiscoveryError {
    /// Convert into the structured payload handed to the administrative layer
    pub fn to_error_payload(&self) -> ErrorPayload {
        let kind = match self {
            DiscoveryError::Validation { .. } => ErrorKind::ValidationError,
            DiscoveryError::NotFound { .. } => ErrorKind::NotFound,
            DiscoveryError::Conflict { .. } => ErrorKind::Conflict,
            DiscoveryError::InvalidState { .. } => ErrorKind::InvalidState,
            DiscoveryError::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            DiscoveryError::Store(
                StoreError::Duplicate { .. } | StoreError::IpAddressTaken { .. },
            ) => ErrorKind::Conflict,
            DiscoveryError::Store(_) => ErrorKind::StoreError,
            DiscoveryError::Broker(_) => ErrorKind::BrokerError,
            DiscoveryError::Fleet { .. } => ErrorKind::FleetError,
            DiscoveryError::Config(_) => ErrorKind::ConfigError,
            DiscoveryError::Internal { .. } => ErrorKind::InternalError,
        };

        ErrorPayload {
            kind,
            message: sanitize_error_message(&self.to_string()),
        }
    }

    /// Create validation error from a single message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            messages: vec![message.into()],
        }
    }

    /// Create not-found error
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create conflict error
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create fleet registration error
    pub fn fleet<S: Into<String>>(message: S) -> Self {
        Self::Fleet {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for optimistic-concurrency conflicts that are worth retrying
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, DiscoveryError::Store(StoreError::VersionConflict { .. }))
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

/// Redact credentials and bound the length of error text leaving the process
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = match SECRET_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(message, "${1}=***").to_string(),
        None => message.to_string(),
    };

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_payload() {
        let error = DiscoveryError::Validation {
            messages: vec!["Blank OS".to_string(), "Blank Owner".to_string()],
        };

        let payload = error.to_error_payload();
        assert_eq!(payload.kind, ErrorKind::ValidationError);
        assert_eq!(payload.message, "Validation failed: Blank OS; Blank Owner");
    }

    #[test]
    fn test_not_found_payload() {
        let payload = DiscoveryError::not_found("Device", "abc").to_error_payload();
        assert_eq!(payload.kind, ErrorKind::NotFound);
        assert_eq!(payload.message, "Device not found: abc");
    }

    #[test]
    fn test_store_errors_map_to_kinds() {
        let duplicate = DiscoveryError::from(StoreError::Duplicate {
            id: "d1".to_string(),
        });
        assert_eq!(duplicate.to_error_payload().kind, ErrorKind::Conflict);

        let conflict = DiscoveryError::from(StoreError::VersionConflict {
            id: "d1".to_string(),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_version_conflict());
        assert_eq!(conflict.to_error_payload().kind, ErrorKind::StoreError);
    }

    #[test]
    fn test_payload_serializes_kind_in_screaming_case() {
        let payload = DiscoveryError::invalid_state("locked").to_error_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "INVALID_STATE");
        assert_eq!(json["message"], "Invalid state: locked");
    }

    #[test]
    fn test_error_message_sanitization() {
        let error = DiscoveryError::internal_error(
            "ssh login failed: password=secret123 key: abc456",
        );

        let payload = error.to_error_payload();
        assert!(!payload.message.contains("secret123"));
        assert!(!payload.message.contains("abc456"));
        assert!(payload.message.contains("password=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "é".repeat(400);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
