//! Record persistence boundary
//!
//! Live records and archived records are held in two stores of the same
//! shape; archiving is a move from one to the other. Every write carries the
//! version of the snapshot it was computed from and is rejected when the
//! stored record has moved on.

pub mod memory;

use crate::model::{Device, RegistrationRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::InMemoryStore;

/// Store operation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Record not found: {id}")]
    NotFound { id: String },
    #[error("Record {id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Record already exists: {id}")]
    Duplicate { id: String },
    #[error("IP address {ip_address} is already held by {holder}")]
    IpAddressTaken { ip_address: String, holder: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A persisted entity
pub trait Record: Clone + Send + Sync + 'static {
    /// Entity name used in log lines and errors
    const ENTITY: &'static str;

    fn id(&self) -> &str;
    fn owner(&self) -> &str;
    fn ip_address(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    /// Record a modification time
    fn touch(&mut self, at: DateTime<Utc>);
}

impl Record for Device {
    const ENTITY: &'static str = "Device";

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn ip_address(&self) -> &str {
        &self.ip_address
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update_date = Some(at);
    }
}

impl Record for RegistrationRequest {
    const ENTITY: &'static str = "RegistrationRequest";

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> &str {
        &self.requester
    }

    fn ip_address(&self) -> &str {
        &self.device.ip_address
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_update_date = Some(at);
    }
}

/// Persistence operations for one record type
#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError>;

    async fn find_by_owner(&self, owner: &str) -> Result<Vec<T>, StoreError>;

    async fn find_by_ip_address(&self, ip_address: &str) -> Result<Vec<T>, StoreError>;

    async fn find_all(&self) -> Result<Vec<T>, StoreError>;

    /// Insert a record whose id must not exist yet
    ///
    /// Stores that keep IP addresses unique also reject a record whose
    /// address is held by another record, checked under the same write.
    async fn insert(&self, record: T) -> Result<T, StoreError>;

    /// Upsert guarded by version: an existing record is only replaced when
    /// its stored version equals `record.version()`. Returns the stored copy
    /// with its new version. Subject to the same IP address check as
    /// [`insert`](Self::insert).
    async fn save(&self, record: T) -> Result<T, StoreError>;

    async fn delete(&self, id: &str) -> Result<Option<T>, StoreError>;
}

pub type DeviceStore = dyn RecordStore<Device>;
pub type RequestStore = dyn RecordStore<RegistrationRequest>;
