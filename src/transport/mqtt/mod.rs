//! MQTT v5 connector built on rumqttc
//!
//! # Example
//!
//! ```rust,no_run
//! use resource_discovery::config::BrokerSection;
//! use resource_discovery::transport::mqtt::MqttConnector;
//! use resource_discovery::transport::{BrokerChannel, ChannelSettings, Payload};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let section = BrokerSection::default();
//! let connector = Arc::new(MqttConnector::new(section.clone()));
//! let channel = BrokerChannel::new(ChannelSettings::from_config(&section), connector);
//! channel.send("ems.client.info.requests", &Payload::new()).await?;
//! # Ok::<(), resource_discovery::BrokerError>(())
//! # }).unwrap();
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnection, MqttConnector, MqttProducer};
pub use connection::{configure_mqtt_options, parse_broker_url, BrokerEndpoint, ConnectionState};
pub use message_handler::{EventRoute, MessageHandler};
