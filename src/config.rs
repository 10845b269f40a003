//! Configuration system for the resource discovery engine
//!
//! Every section and field carries a serde default, so a partial (or empty)
//! TOML file yields a runnable configuration. Broker credentials are never
//! stored in the file; only the names of the environment variables that hold
//! them are.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Wildcard entry for `processing.allowed_device_info_keys`
pub const ALLOW_ALL_KEYS: &str = "*";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub topics: TopicSection,
    #[serde(default)]
    pub processing: ProcessingSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub archiving: ArchivingSection,
    #[serde(default)]
    pub fleet: FleetSection,
}

/// Broker connection, health check and retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with protocol and port (`mqtt://` or `mqtts://`)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Client identifier prefix; a timestamp is appended per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_health_check_period")]
    pub health_check_period_secs: u64,
    #[serde(default = "default_health_check_topic")]
    pub health_check_topic: String,
    #[serde(default = "default_subscription_startup_delay")]
    pub subscription_startup_delay_secs: u64,
    #[serde(default = "default_subscription_retry_delay")]
    pub subscription_retry_delay_secs: u64,
    /// Pause between two send attempts after a failure
    #[serde(default = "default_send_retry_interval")]
    pub send_retry_interval_ms: u64,
    /// Send attempts before giving up (0 = retry forever)
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Delay before reconnecting after a failed health check
    #[serde(default = "default_health_reconnect_delay")]
    pub health_reconnect_delay_secs: u64,
    /// Seal and open `encrypted-message` payloads with AES-256-GCM
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Environment variable containing the key password
    pub encryption_password_env: Option<String>,
    #[serde(default = "default_encryption_salt")]
    pub encryption_salt: String,
    /// PBKDF2 iterations used to derive the key from the password
    #[serde(default = "default_key_derivation_rounds")]
    pub key_derivation_rounds: u32,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "resource-discovery".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_health_check_period() -> u64 {
    60
}

fn default_health_check_topic() -> String {
    "_HEALTH_CHECK".to_string()
}

fn default_subscription_startup_delay() -> u64 {
    10
}

fn default_subscription_retry_delay() -> u64 {
    60
}

fn default_send_retry_interval() -> u64 {
    2000
}

fn default_max_send_attempts() -> u32 {
    30
}

fn default_health_reconnect_delay() -> u64 {
    1
}

fn default_encryption_salt() -> String {
    "resource-discovery".to_string()
}

fn default_key_derivation_rounds() -> u32 {
    65_536
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            connect_timeout_secs: default_connect_timeout(),
            health_check_period_secs: default_health_check_period(),
            health_check_topic: default_health_check_topic(),
            subscription_startup_delay_secs: default_subscription_startup_delay(),
            subscription_retry_delay_secs: default_subscription_retry_delay(),
            send_retry_interval_ms: default_send_retry_interval(),
            max_send_attempts: default_max_send_attempts(),
            health_reconnect_delay_secs: default_health_reconnect_delay(),
            encryption_enabled: false,
            encryption_password_env: None,
            encryption_salt: default_encryption_salt(),
            key_derivation_rounds: default_key_derivation_rounds(),
        }
    }
}

impl BrokerSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_period_secs)
    }

    pub fn subscription_startup_delay(&self) -> Duration {
        Duration::from_secs(self.subscription_startup_delay_secs)
    }

    pub fn subscription_retry_delay(&self) -> Duration {
        Duration::from_secs(self.subscription_retry_delay_secs)
    }

    pub fn send_retry_interval(&self) -> Duration {
        Duration::from_millis(self.send_retry_interval_ms)
    }

    pub fn health_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.health_reconnect_delay_secs)
    }

    /// Key password from its environment variable
    pub fn encryption_password(&self) -> Option<String> {
        env_var_optional(self.encryption_password_env.as_ref())
    }

    /// Attempt cap for `send`, `None` when unbounded
    pub fn send_attempt_limit(&self) -> Option<u32> {
        match self.max_send_attempts {
            0 => None,
            n => Some(n),
        }
    }
}

/// Topic names used on the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicSection {
    pub data_collection_request: String,
    pub data_collection_response: String,
    pub lifecycle_request: String,
    pub lifecycle_response: String,
    pub device_info_request: String,
    pub device_info_response: String,
    pub device_status: String,
    pub device_metrics: String,
    pub device_lost: String,
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            data_collection_request: "ems.client.installation.requests".to_string(),
            data_collection_response: "ems.client.installation.reports".to_string(),
            lifecycle_request: "ems.client.installation.requests".to_string(),
            lifecycle_response: "ems.client.installation.reports".to_string(),
            device_info_request: "ems.client.info.requests".to_string(),
            device_info_response: "ems.client.info.reports".to_string(),
            device_status: "_ui_instance_info".to_string(),
            device_metrics: "_client_metrics".to_string(),
            device_lost: "eu.nebulouscloud.monitoring.device_lost".to_string(),
        }
    }
}

impl TopicSection {
    fn named(&self) -> [(&'static str, &str); 9] {
        [
            ("data_collection_request", &self.data_collection_request),
            ("data_collection_response", &self.data_collection_response),
            ("lifecycle_request", &self.lifecycle_request),
            ("lifecycle_response", &self.lifecycle_response),
            ("device_info_request", &self.device_info_request),
            ("device_info_response", &self.device_info_response),
            ("device_status", &self.device_status),
            ("device_metrics", &self.device_metrics),
            ("device_lost", &self.device_lost),
        ]
    }
}

/// Outcome applied to a request once its diagnostic data has been collected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationPolicy {
    /// Wait for an administrator decision
    #[default]
    Manual,
    AlwaysAuthorize,
    AlwaysReject,
}

/// Registration request processing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessingSection {
    pub enable_periodic_processing: bool,
    pub startup_delay_secs: u64,
    pub period_secs: u64,
    /// Interval between two unknown-device reconciliation sweeps
    pub reconciliation_period_secs: u64,
    /// Keys retained from a response's `nodeInfo`; `"*"` keeps everything
    pub allowed_device_info_keys: Vec<String>,
    pub authorization: AuthorizationPolicy,
    pub immediately_archive_success_requests: bool,
}

impl Default for ProcessingSection {
    fn default() -> Self {
        Self {
            enable_periodic_processing: true,
            startup_delay_secs: 10,
            period_secs: 60,
            reconciliation_period_secs: 10,
            allowed_device_info_keys: vec![ALLOW_ALL_KEYS.to_string()],
            authorization: AuthorizationPolicy::Manual,
            immediately_archive_success_requests: true,
        }
    }
}

impl ProcessingSection {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn reconciliation_period(&self) -> Duration {
        Duration::from_secs(self.reconciliation_period_secs)
    }
}

/// Device staleness detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSection {
    pub automatic_failed_detection: bool,
    pub suspect_threshold_mins: u64,
    pub failed_threshold_mins: u64,
    pub period_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            automatic_failed_detection: true,
            suspect_threshold_mins: 5,
            failed_threshold_mins: 10,
            period_secs: 60,
        }
    }
}

impl HealthSection {
    pub fn suspect_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.suspect_threshold_mins as i64)
    }

    pub fn failed_threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.failed_threshold_mins as i64)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Retention of terminal records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchivingSection {
    pub automatic_archiving_enabled: bool,
    pub archiving_threshold_mins: u64,
    pub immediately_archive_offboarded_devices: bool,
}

impl Default for ArchivingSection {
    fn default() -> Self {
        Self {
            automatic_archiving_enabled: false,
            archiving_threshold_mins: 1440,
            immediately_archive_offboarded_devices: true,
        }
    }
}

impl ArchivingSection {
    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.archiving_threshold_mins as i64)
    }
}

/// External fleet registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FleetSection {
    pub registration_enabled: bool,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DiscoveryConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration held in memory
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.broker.broker_url)?;

        if self.health.failed_threshold_mins < self.health.suspect_threshold_mins {
            return Err(ConfigError::InvalidConfig(format!(
                "health.failed_threshold_mins ({}) must not be lower than \
                 health.suspect_threshold_mins ({})",
                self.health.failed_threshold_mins, self.health.suspect_threshold_mins
            )));
        }

        let periods = [
            ("broker.health_check_period_secs", self.broker.health_check_period_secs),
            ("processing.period_secs", self.processing.period_secs),
            (
                "processing.reconciliation_period_secs",
                self.processing.reconciliation_period_secs,
            ),
            ("health.period_secs", self.health.period_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }

        if self.broker.encryption_enabled {
            if self.broker.encryption_password_env.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "broker.encryption_enabled requires broker.encryption_password_env".to_string(),
                ));
            }
            if self.broker.key_derivation_rounds == 0 {
                return Err(ConfigError::InvalidConfig(
                    "broker.key_derivation_rounds must be greater than zero".to_string(),
                ));
            }
        }

        if self.broker.health_check_topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.health_check_topic must not be blank".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .topics
            .named()
            .iter()
            .find(|(_, topic)| topic.trim().is_empty())
        {
            return Err(ConfigError::InvalidConfig(format!(
                "topics.{name} must not be blank"
            )));
        }

        Ok(())
    }

    /// Get broker username from its environment variable
    pub fn broker_username(&self) -> Option<String> {
        env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get broker password from its environment variable
    pub fn broker_password(&self) -> Option<String> {
        env_var_optional(self.broker.password_env.as_ref())
    }

    /// Create a test configuration with short delays for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
broker_url = "mqtt://localhost:1883"
subscription_startup_delay_secs = 0
subscription_retry_delay_secs = 1
send_retry_interval_ms = 1
max_send_attempts = 3

[processing]
allowed_device_info_keys = ["OS_KERNEL"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("broker.broker_url '{broker_url}': {e}")))?;
    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "broker.broker_url scheme '{other}' is not supported"
        ))),
    }
}
