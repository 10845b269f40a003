//! Correlated message envelope
//!
//! Requests and their later responses are flat JSON objects tied together
//! only by business keys (`requestId`, the device IP and the agent-assigned
//! `reference`). Outbound values are always strings; inbound values may be
//! strings or numbers and are normalized by the field helpers here.

use crate::config::ALLOW_ALL_KEYS;
use crate::model::{Device, RegistrationRequest};
use crate::transport::codec::Payload;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const REQUEST_ID: &str = "requestId";
pub const REQUEST_TYPE: &str = "requestType";
pub const DEVICE_ID: &str = "deviceId";
pub const DEVICE_OS: &str = "deviceOs";
pub const DEVICE_NAME: &str = "deviceName";
pub const DEVICE_IP_ADDRESS: &str = "deviceIpAddress";
pub const DEVICE_PORT: &str = "devicePort";
pub const DEVICE_USERNAME: &str = "deviceUsername";
pub const DEVICE_PASSWORD: &str = "devicePassword";
pub const DEVICE_PUBLIC_KEY: &str = "devicePublicKey";
pub const IP_ADDRESS: &str = "ipAddress";
pub const REFERENCE: &str = "reference";
pub const STATUS: &str = "status";
pub const TIMESTAMP: &str = "timestamp";
pub const PRIORITY: &str = "priority";
pub const RETRY: &str = "retry";
pub const NODE_INFO: &str = "nodeInfo";
/// Key under which status and metric reports nest their body
pub const MESSAGE: &str = "message";

pub const DEFAULT_PRIORITY: &str = "1.0";
pub const DEFAULT_RETRY: &str = "1";
/// The only status token treated as success
pub const SUCCESS_STATUS: &str = "SUCCESS";

/// Kind of request carried by an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Info,
    Install,
    Reinstall,
    Uninstall,
    Diagnostics,
    NodeDetails,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Info => "INFO",
            RequestType::Install => "INSTALL",
            RequestType::Reinstall => "REINSTALL",
            RequestType::Uninstall => "UNINSTALL",
            RequestType::Diagnostics => "DIAGNOSTICS",
            RequestType::NodeDetails => "NODE_DETAILS",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(RequestType::Info),
            "INSTALL" => Ok(RequestType::Install),
            "REINSTALL" => Ok(RequestType::Reinstall),
            "UNINSTALL" => Ok(RequestType::Uninstall),
            "DIAGNOSTICS" => Ok(RequestType::Diagnostics),
            "NODE_DETAILS" => Ok(RequestType::NodeDetails),
            other => Err(format!("Unknown request type: {other}")),
        }
    }
}

fn put(payload: &mut Payload, key: &str, value: impl Into<String>) {
    payload.insert(key.to_string(), Value::String(value.into()));
}

fn epoch_millis_now() -> String {
    Utc::now().timestamp_millis().to_string()
}

fn put_delivery_hints(payload: &mut Payload) {
    put(payload, TIMESTAMP, epoch_millis_now());
    put(payload, PRIORITY, DEFAULT_PRIORITY);
    put(payload, RETRY, DEFAULT_RETRY);
}

/// Request for a registration pipeline step (DIAGNOSTICS or INSTALL)
pub fn registration_envelope(request_type: RequestType, request: &RegistrationRequest) -> Payload {
    let device = &request.device;
    let mut payload = Payload::new();
    put(&mut payload, REQUEST_ID, request.id.as_str());
    put(&mut payload, REQUEST_TYPE, request_type.as_str());
    put(&mut payload, DEVICE_ID, "");
    put(&mut payload, DEVICE_OS, device.os.as_str());
    put(&mut payload, DEVICE_NAME, device.name.as_str());
    put(&mut payload, DEVICE_IP_ADDRESS, device.ip_address.as_str());
    put(
        &mut payload,
        DEVICE_PORT,
        device.port.map(|p| p.to_string()).unwrap_or_default(),
    );
    put(&mut payload, DEVICE_USERNAME, device.credentials.username.as_str());
    put(
        &mut payload,
        DEVICE_PASSWORD,
        device.credentials.password.clone().unwrap_or_default(),
    );
    put(
        &mut payload,
        DEVICE_PUBLIC_KEY,
        device.credentials.public_key.clone().unwrap_or_default(),
    );
    put_delivery_hints(&mut payload);
    payload
}

/// Lifecycle request (REINSTALL or UNINSTALL) for a monitored device
pub fn lifecycle_envelope(request_type: RequestType, device: &Device) -> Payload {
    let mut payload = Payload::new();
    put(
        &mut payload,
        REQUEST_ID,
        device.request_id.clone().unwrap_or_default(),
    );
    put(&mut payload, REQUEST_TYPE, request_type.as_str());
    put(&mut payload, DEVICE_ID, device.id.as_str());
    put(&mut payload, DEVICE_OS, device.os.as_str());
    put(&mut payload, DEVICE_NAME, device.name.as_str());
    put(&mut payload, DEVICE_IP_ADDRESS, device.ip_address.as_str());
    put(&mut payload, DEVICE_USERNAME, device.credentials.username.as_str());
    put(
        &mut payload,
        DEVICE_PASSWORD,
        device.credentials.password.clone().unwrap_or_default(),
    );
    put(
        &mut payload,
        DEVICE_PUBLIC_KEY,
        device.credentials.public_key.clone().unwrap_or_default(),
    );
    put_delivery_hints(&mut payload);
    payload
}

/// Broadcast asking every agent to report its node info
pub fn info_update_envelope() -> Payload {
    let mut payload = Payload::new();
    put(&mut payload, REQUEST_TYPE, RequestType::Info.as_str());
    put_delivery_hints(&mut payload);
    payload
}

/// Ask the agent at `ip_address` to describe itself
pub fn node_details_envelope(ip_address: &str, reference: &str) -> Payload {
    let mut payload = Payload::new();
    put(&mut payload, REQUEST_TYPE, RequestType::NodeDetails.as_str());
    put(&mut payload, DEVICE_IP_ADDRESS, ip_address);
    put(&mut payload, REFERENCE, reference);
    payload
}

/// Trimmed, non-blank text value of `key`; numbers and booleans are rendered
pub fn text_field(payload: &Payload, key: &str) -> Option<String> {
    let text = match payload.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Epoch-millis timestamp of `key`, given as a number or a numeric string
pub fn epoch_millis_field(payload: &Payload, key: &str) -> Option<DateTime<Utc>> {
    let millis = match payload.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// RFC 3339 timestamp of `key`
pub fn rfc3339_field(payload: &Payload, key: &str) -> Option<DateTime<Utc>> {
    let text = text_field(payload, key)?;
    DateTime::parse_from_rfc3339(&text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn request_type_field(payload: &Payload) -> Option<RequestType> {
    text_field(payload, REQUEST_TYPE)?.parse().ok()
}

/// Device IP of a response, preferring `deviceIpAddress` over `ipAddress`
pub fn response_ip_address(payload: &Payload) -> Option<String> {
    text_field(payload, DEVICE_IP_ADDRESS).or_else(|| text_field(payload, IP_ADDRESS))
}

/// The nested `message` object when present, otherwise the payload itself
pub fn unwrap_message(payload: &Payload) -> Payload {
    match payload.get(MESSAGE) {
        Some(Value::Object(inner)) => inner.clone(),
        _ => payload.clone(),
    }
}

/// `nodeInfo` as text pairs; blank keys or values are skipped
pub fn node_info_field(payload: &Payload) -> BTreeMap<String, String> {
    let Some(Value::Object(info)) = payload.get(NODE_INFO) else {
        return BTreeMap::new();
    };
    info.iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => return None,
                other => other.to_string(),
            };
            let key = key.trim();
            (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value))
        })
        .collect()
}

/// Keep the pairs whose key is allowed; `*` in `allowed` admits every key
///
/// Keys are trimmed and compared upper-cased against the allow-list.
pub fn filter_device_info(
    info: &BTreeMap<String, String>,
    allowed: &[String],
) -> BTreeMap<String, String> {
    let allow_all = allowed.iter().any(|k| k.trim() == ALLOW_ALL_KEYS);
    info.iter()
        .filter_map(|(key, value)| {
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            let upper = key.to_uppercase();
            let permitted =
                allow_all || allowed.iter().any(|a| a.trim().to_uppercase() == upper);
            permitted.then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Case-insensitive comparison with the success token
pub fn is_success_status(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case(SUCCESS_STATUS)
}
