//! Resource discovery engine
//!
//! Onboards edge devices over a message broker and keeps their lifecycle
//! state current.
//!
//! # Overview
//!
//! - [`transport`]: the shared broker channel with reconnect, retrying sends
//!   and per-topic listener fan-out, plus the MQTT v5 connector
//! - [`processing`]: the response correlator driving registration requests,
//!   the lifecycle request coordinator, the unknown-device reconciler and
//!   the device health sweeper
//! - [`monitor`]: listeners for status reports, metrics and lifecycle responses
//! - [`service`] and [`store`]: record operations over versioned stores
//! - [`runtime`]: wiring and scheduling of all of the above
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use resource_discovery::{DiscoveryConfig, DiscoveryRuntime};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DiscoveryConfig::load_from_file(std::path::Path::new("discovery.toml"))?;
//! let runtime = DiscoveryRuntime::from_config(config)?;
//! runtime.start();
//! // ... serve until a shutdown signal arrives
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fleet;
pub mod model;
pub mod monitor;
pub mod observability;
pub mod processing;
pub mod protocol;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{DiscoveryError, DiscoveryResult};
pub use model::{Device, DeviceStatus, RegistrationRequest, RegistrationStatus};
pub use processing::SweepOutcome;
pub use runtime::DiscoveryRuntime;
pub use transport::{BrokerChannel, BrokerError};
