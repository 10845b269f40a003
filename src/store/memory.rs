use super::{Record, RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory implementation of RecordStore using HashMap
pub struct InMemoryStore<T: Record> {
    records: Arc<RwLock<HashMap<String, T>>>,
    unique_ip_addresses: bool,
}

impl<T: Record> InMemoryStore<T> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            unique_ip_addresses: false,
        }
    }

    /// Store for live records: at most one record per non-blank IP address
    pub fn with_unique_ip_addresses() -> Self {
        Self {
            unique_ip_addresses: true,
            ..Self::new()
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool + Send,
    {
        let records = self.records.read().await;
        let mut matches: Vec<T> = records.values().filter(|r| predicate(r)).cloned().collect();
        matches.sort_by(|a, b| a.id().cmp(b.id()));
        matches
    }

    fn check_ip_address(
        &self,
        records: &HashMap<String, T>,
        record: &T,
    ) -> Result<(), StoreError> {
        let ip_address = record.ip_address().trim();
        if !self.unique_ip_addresses || ip_address.is_empty() {
            return Ok(());
        }
        match records
            .values()
            .find(|other| other.id() != record.id() && other.ip_address().trim() == ip_address)
        {
            Some(holder) => Err(StoreError::IpAddressTaken {
                ip_address: ip_address.to_string(),
                holder: holder.id().to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl<T: Record> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Record> RecordStore<T> for InMemoryStore<T> {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(id).cloned())
    }

    async fn find_by_owner(&self, owner: &str) -> Result<Vec<T>, StoreError> {
        Ok(self.filtered(|r| r.owner() == owner).await)
    }

    async fn find_by_ip_address(&self, ip_address: &str) -> Result<Vec<T>, StoreError> {
        let ip_address = ip_address.trim();
        Ok(self.filtered(|r| r.ip_address().trim() == ip_address).await)
    }

    async fn find_all(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.filtered(|_| true).await)
    }

    async fn insert(&self, mut record: T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(record.id()) {
            return Err(StoreError::Duplicate {
                id: record.id().to_string(),
            });
        }
        self.check_ip_address(&records, &record)?;
        record.set_version(record.version() + 1);
        records.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    async fn save(&self, mut record: T) -> Result<T, StoreError> {
        let mut records = self.records.write().await;
        if let Some(current) = records.get(record.id()) {
            if current.version() != record.version() {
                return Err(StoreError::VersionConflict {
                    id: record.id().to_string(),
                    expected: record.version(),
                    actual: current.version(),
                });
            }
        }
        self.check_ip_address(&records, &record)?;
        record.set_version(record.version() + 1);
        records.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<Option<T>, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.remove(id))
    }
}
