//! Configuration loading and validation tests
//!
//! Tests focus on what a deployment observes when it points the engine at a
//! configuration file, not on TOML parsing details.

use resource_discovery::config::{AuthorizationPolicy, ConfigError, DiscoveryConfig};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
broker_url = "mqtt://broker.local:1883"
client_id = "discovery-test"
username_env = "DISCOVERY_BROKER_USER"
password_env = "DISCOVERY_BROKER_PASS"
max_send_attempts = 0
health_reconnect_delay_secs = 5
encryption_enabled = true
encryption_password_env = "DISCOVERY_KEY_PASSWORD"
encryption_salt = "site-a"
key_derivation_rounds = 100000

[processing]
period_secs = 30
allowed_device_info_keys = ["OS_KERNEL", "CPU_CORES"]
authorization = "always_reject"

[health]
suspect_threshold_mins = 3
failed_threshold_mins = 8

[archiving]
automatic_archiving_enabled = true
archiving_threshold_mins = 60

[fleet]
registration_enabled = true
"#
    )
    .unwrap();

    let config = DiscoveryConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.broker_url, "mqtt://broker.local:1883");
    assert_eq!(config.broker.client_id, "discovery-test");
    assert_eq!(config.broker.send_attempt_limit(), None);
    assert_eq!(config.broker.health_reconnect_delay().as_secs(), 5);
    assert!(config.broker.encryption_enabled);
    assert_eq!(config.broker.encryption_salt, "site-a");
    assert_eq!(config.broker.key_derivation_rounds, 100_000);
    assert_eq!(config.processing.period().as_secs(), 30);
    assert_eq!(
        config.processing.allowed_device_info_keys,
        vec!["OS_KERNEL", "CPU_CORES"]
    );
    assert_eq!(config.processing.authorization, AuthorizationPolicy::AlwaysReject);
    assert_eq!(config.health.suspect_threshold(), chrono::Duration::minutes(3));
    assert_eq!(config.health.failed_threshold(), chrono::Duration::minutes(8));
    assert!(config.archiving.automatic_archiving_enabled);
    assert_eq!(config.archiving.threshold(), chrono::Duration::hours(1));
    assert!(config.fleet.registration_enabled);
}

#[test]
fn test_empty_file_yields_default_config() {
    let temp_file = NamedTempFile::new().unwrap();
    let config = DiscoveryConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config, DiscoveryConfig::default());
    assert_eq!(config.broker.send_attempt_limit(), Some(30));
}

#[test]
fn test_broker_credentials_come_from_environment() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
username_env = "RD_CONFIG_TEST_USER"
password_env = "RD_CONFIG_TEST_UNSET_PASSWORD"
"#
    )
    .unwrap();
    std::env::set_var("RD_CONFIG_TEST_USER", "operator");

    let config = DiscoveryConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.broker_username().as_deref(), Some("operator"));
    assert_eq!(config.broker_password(), None);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let err = DiscoveryConfig::load_from_file(Path::new("/nonexistent/discovery.toml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::FileRead(_)));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[broker\nbroker_url = ").unwrap();

    let err = DiscoveryConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::TomlParse(_)));
}

#[test]
fn test_wrong_field_type_is_a_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[health]\nsuspect_threshold_mins = \"five\"").unwrap();

    let err = DiscoveryConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::TomlParse(_)));
}

#[test]
fn test_unknown_authorization_policy_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[processing]\nauthorization = \"sometimes\"").unwrap();

    assert!(DiscoveryConfig::load_from_file(temp_file.path()).is_err());
}

#[test]
fn test_inconsistent_thresholds_fail_validation() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        "[health]\nsuspect_threshold_mins = 20\nfailed_threshold_mins = 10"
    )
    .unwrap();

    let err = DiscoveryConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidConfig(_)));
}

#[test]
fn test_encryption_requires_password_variable() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[broker]\nencryption_enabled = true").unwrap();

    let err = DiscoveryConfig::load_from_file(temp_file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidConfig(_)));
}
