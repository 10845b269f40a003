//! Record-level operations shared by the admin boundary and the background jobs

pub mod devices;
pub mod requests;

pub use devices::DeviceService;
pub use requests::RegistrationRequestService;

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::store::{Record, RecordStore, StoreError};
use chrono::Utc;
use tracing::debug;

/// Attempts for one read/compute/compare-and-swap cycle before giving up
pub const MAX_CONFLICT_RETRIES: u32 = 5;

/// Report an address clash caught by the store like one caught up front
pub(crate) fn write_error(e: StoreError) -> DiscoveryError {
    match e {
        StoreError::IpAddressTaken { ip_address, holder } => DiscoveryError::conflict(format!(
            "IP address {ip_address} is already used by {holder}"
        )),
        other => other.into(),
    }
}

/// Read the current snapshot, apply `mutate` to a copy and persist it if it
/// changed; concurrent writers cause a re-read and another attempt
pub(crate) async fn modify_record<T, F>(
    store: &dyn RecordStore<T>,
    id: &str,
    mut mutate: F,
) -> DiscoveryResult<T>
where
    T: Record + PartialEq,
    F: FnMut(&mut T) -> DiscoveryResult<()> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store
            .find_by_id(id)
            .await?
            .ok_or_else(|| DiscoveryError::not_found(T::ENTITY, id))?;

        let mut next = current.clone();
        mutate(&mut next)?;
        if next == current {
            return Ok(current);
        }
        next.touch(Utc::now());

        match store.save(next).await {
            Ok(saved) => return Ok(saved),
            Err(StoreError::VersionConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                debug!(entity = T::ENTITY, id, attempt, "Concurrent update, retrying");
            }
            Err(e) => return Err(write_error(e)),
        }
    }
}

/// Move a record from the live store to the archive store
pub(crate) async fn move_record<T: Record>(
    from: &dyn RecordStore<T>,
    to: &dyn RecordStore<T>,
    record: T,
) -> DiscoveryResult<T> {
    let id = record.id().to_string();
    let moved = to.save(record).await?;
    from.delete(&id).await?;
    Ok(moved)
}
