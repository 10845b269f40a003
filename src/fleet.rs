//! External fleet registration
//!
//! Devices are announced to the fleet/orchestration system after they are
//! persisted and withdrawn before they leave the live store. The outcome never
//! affects the caller: failures are logged and dropped.

use crate::error::DiscoveryResult;
use crate::model::Device;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Fleet/orchestration system collaborator
#[async_trait]
pub trait FleetRegistry: Send + Sync {
    async fn register(&self, device: &Device) -> DiscoveryResult<()>;

    async fn deregister(&self, device: &Device) -> DiscoveryResult<()>;
}

/// Registry that only records the calls in the log
#[derive(Debug, Default)]
pub struct LoggingFleetRegistry;

#[async_trait]
impl FleetRegistry for LoggingFleetRegistry {
    async fn register(&self, device: &Device) -> DiscoveryResult<()> {
        info!(device_id = %device.id, ip = %device.ip_address, "Fleet registration");
        Ok(())
    }

    async fn deregister(&self, device: &Device) -> DiscoveryResult<()> {
        info!(device_id = %device.id, ip = %device.ip_address, "Fleet deregistration");
        Ok(())
    }
}

/// Optional fleet registry whose failures never propagate
#[derive(Clone, Default)]
pub struct FleetNotifier {
    registry: Option<Arc<dyn FleetRegistry>>,
}

impl FleetNotifier {
    pub fn new(registry: Arc<dyn FleetRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    pub fn disabled() -> Self {
        Self { registry: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_some()
    }

    pub async fn register(&self, device: &Device) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.register(device).await {
                warn!(device_id = %device.id, error = %e, "Fleet registration failed");
            }
        }
    }

    pub async fn deregister(&self, device: &Device) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.deregister(device).await {
                warn!(device_id = %device.id, error = %e, "Fleet deregistration failed");
            }
        }
    }
}
