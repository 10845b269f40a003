//! Pure connection state management for the MQTT connector
//!
//! This module contains pure functions for connection state handling and
//! translating the broker configuration into rumqttc options.

use crate::config::BrokerSection;
use crate::transport::BrokerError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Connection state for one MQTT connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for ConnAck
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
}

/// Broker endpoint parsed from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` URLs
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, BrokerError> {
    let url =
        Url::parse(broker_url).map_err(|_| BrokerError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(BrokerError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Unique client id per connection attempt so that a reconnect never collides
/// with the session the broker still holds for the previous one
pub fn build_client_id(prefix: &str) -> String {
    format!("{prefix}-{}", chrono::Utc::now().timestamp_millis())
}

/// Build rumqttc options from the broker configuration
pub fn configure_mqtt_options(config: &BrokerSection) -> Result<MqttOptions, BrokerError> {
    let endpoint = parse_broker_url(&config.broker_url)?;
    let mut mqtt_options = MqttOptions::new(
        build_client_id(&config.client_id),
        endpoint.host,
        endpoint.port,
    );

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}
