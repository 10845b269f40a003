//! Device and registration request management through the service layer


use async_trait::async_trait;
use resource_discovery::error::DiscoveryError;
use resource_discovery::fleet::FleetNotifier;
use resource_discovery::model::{Credentials, Device, DeviceStatus, RegistrationStatus};
use resource_discovery::service::DeviceService;
use resource_discovery::store::{InMemoryStore, RecordStore, StoreError};
use std::sync::Arc;
use test_helpers::{device_draft, device_payload, harness};

/// Live device store whose address lookups suspend after reading, the way
/// a networked store answers a query and then hands control back
struct SlowLookupStore {
    inner: InMemoryStore<Device>,
}

#[async_trait]
impl RecordStore<Device> for SlowLookupStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Device>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_owner(&self, owner: &str) -> Result<Vec<Device>, StoreError> {
        self.inner.find_by_owner(owner).await
    }

    async fn find_by_ip_address(&self, ip_address: &str) -> Result<Vec<Device>, StoreError> {
        let found = self.inner.find_by_ip_address(ip_address).await;
        tokio::task::yield_now().await;
        found
    }

    async fn find_all(&self) -> Result<Vec<Device>, StoreError> {
        self.inner.find_all().await
    }

    async fn insert(&self, record: Device) -> Result<Device, StoreError> {
        self.inner.insert(record).await
    }

    async fn save(&self, record: Device) -> Result<Device, StoreError> {
        self.inner.save(record).await
    }

    async fn delete(&self, id: &str) -> Result<Option<Device>, StoreError> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn test_concurrent_creates_for_one_ip_address_keep_a_single_device() {
    let live = Arc::new(SlowLookupStore {
        inner: InMemoryStore::with_unique_ip_addresses(),
    });
    let service = DeviceService::new(
        live.clone(),
        Arc::new(InMemoryStore::<Device>::new()),
        FleetNotifier::disabled(),
    );

    let (a, b) = futures::join!(
        service.create(device_draft("10.0.0.5", "ref-a")),
        service.create(device_draft("10.0.0.5", "ref-b")),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(DiscoveryError::Conflict { .. }))));
    assert_eq!(live.find_by_ip_address("10.0.0.5").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_archive_and_unarchive_keep_device_id() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.5.0.1", "ref-1"))
        .await
        .unwrap();
    h.devices
        .modify(&device.id, |d| {
            d.status = DeviceStatus::Failed;
            d.retries = 4;
            Ok(())
        })
        .await
        .unwrap();

    let archived = h.devices.archive(&device.id).await.unwrap();
    assert!(archived.archive_date.is_some());
    assert!(h.devices.get(&device.id).await.unwrap().is_none());
    assert_eq!(h.devices.get_all_archived().await.unwrap().len(), 1);

    let restored = h
        .devices
        .unarchive(&device.id, Credentials::with_public_key("admin", "ssh-ed25519 AAAA"))
        .await
        .unwrap();
    assert_eq!(restored.id, device.id);
    assert_eq!(restored.status, DeviceStatus::NewDevice);
    assert_eq!(restored.retries, 0);
    assert!(restored.archive_date.is_none());
    assert_eq!(restored.credentials.username, "admin");
    assert_eq!(restored.credentials.password, None);
    assert!(h.devices.get_archived(&device.id).await.unwrap().is_none());
    assert_eq!(h.fleet.deregistered(), vec![device.id.clone()]);
    assert_eq!(h.fleet.registered(), vec![device.id.clone()]);
}

#[tokio::test]
async fn test_unarchive_requires_credentials_and_free_ip() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.5.0.2", "ref-2"))
        .await
        .unwrap();
    h.devices.archive(&device.id).await.unwrap();

    let err = h
        .devices
        .unarchive(&device.id, Credentials::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Validation { .. }));

    h.devices
        .create(device_draft("10.5.0.2", "ref-other"))
        .await
        .unwrap();
    let err = h
        .devices
        .unarchive(&device.id, Credentials::with_password("root", "pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Conflict { .. }));
    assert!(h.devices.get_archived(&device.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_ip_address_is_unique_across_live_devices() {
    let h = harness();
    let first = h
        .devices
        .create(device_draft("10.5.0.3", "ref-a"))
        .await
        .unwrap();

    let err = h
        .devices
        .create(device_draft("10.5.0.3", "ref-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Conflict { .. }));

    let second = h
        .devices
        .create(device_draft("10.5.0.4", "ref-b"))
        .await
        .unwrap();
    let mut moved = second.clone();
    moved.ip_address = first.ip_address.clone();
    assert!(matches!(
        h.devices.update(moved).await,
        Err(DiscoveryError::Conflict { .. })
    ));

    let mut renamed = first.clone();
    renamed.name = "renamed".to_string();
    let updated = h.devices.update(renamed).await.unwrap();
    assert_eq!(updated.name, "renamed");
    assert!(updated.last_update_date.is_some());
}

#[tokio::test]
async fn test_create_reports_every_validation_problem() {
    let h = harness();
    let mut draft = device_draft("", "ref");
    draft.os = String::new();
    draft.credentials = Credentials::default();

    match h.devices.create(draft).await.unwrap_err() {
        DiscoveryError::Validation { messages } => {
            assert!(messages.contains(&"Blank OS".to_string()));
            assert!(messages.contains(&"Blank IP Address".to_string()));
            assert!(messages.contains(&"Blank Username".to_string()));
            assert!(messages.contains(&"Blank Password and Public Key".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_create_rejects_preset_id_and_status() {
    let h = harness();
    let mut with_id = device_draft("10.5.0.5", "ref");
    with_id.id = "chosen".to_string();
    assert!(matches!(
        h.devices.create(with_id).await,
        Err(DiscoveryError::Validation { .. })
    ));

    let mut onboarded = device_draft("10.5.0.5", "ref");
    onboarded.status = DeviceStatus::Onboarded;
    assert!(matches!(
        h.devices.create(onboarded).await,
        Err(DiscoveryError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_stale_device_snapshot_is_rejected() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.5.0.6", "ref"))
        .await
        .unwrap();
    h.devices.set_compromised(&device.id).await.unwrap();

    let mut stale = device.clone();
    stale.name = "late edit".to_string();
    assert!(h.devices.update(stale).await.is_err());
    assert_eq!(
        h.devices.get_required(&device.id).await.unwrap().status,
        DeviceStatus::Compromised
    );
}

#[tokio::test]
async fn test_request_ip_must_not_belong_to_device_or_request() {
    let h = harness();
    h.requests
        .submit(device_payload("10.5.1.1"), "alice")
        .await
        .unwrap();
    assert!(matches!(
        h.requests.submit(device_payload("10.5.1.1"), "bob").await,
        Err(DiscoveryError::Conflict { .. })
    ));

    h.devices
        .create(device_draft("10.5.1.2", "ref"))
        .await
        .unwrap();
    assert!(matches!(
        h.requests.submit(device_payload("10.5.1.2"), "bob").await,
        Err(DiscoveryError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_submit_requires_requester() {
    let h = harness();
    assert!(matches!(
        h.requests.submit(device_payload("10.5.1.3"), " ").await,
        Err(DiscoveryError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_authorization_decides_pending_requests_only() {
    let h = harness();
    let request = h
        .requests
        .submit(device_payload("10.5.1.4"), "alice")
        .await
        .unwrap();

    assert!(matches!(
        h.requests.authorize(&request.id, true).await,
        Err(DiscoveryError::InvalidState { .. })
    ));

    h.requests
        .modify(&request.id, |r| {
            r.status = RegistrationStatus::PendingAuthorization;
            Ok(())
        })
        .await
        .unwrap();
    let authorized = h.requests.authorize(&request.id, true).await.unwrap();
    assert_eq!(authorized.status, RegistrationStatus::PendingOnboarding);

    let other = h
        .requests
        .submit(device_payload("10.5.1.5"), "alice")
        .await
        .unwrap();
    h.requests
        .modify(&other.id, |r| {
            r.status = RegistrationStatus::PendingAuthorization;
            Ok(())
        })
        .await
        .unwrap();
    let rejected = h.requests.authorize(&other.id, false).await.unwrap();
    assert_eq!(rejected.status, RegistrationStatus::AuthorizationReject);
}

#[tokio::test]
async fn test_in_flight_requests_are_locked() {
    let h = harness();
    let request = h
        .requests
        .submit(device_payload("10.5.1.6"), "alice")
        .await
        .unwrap();
    let locked = h
        .requests
        .modify(&request.id, |r| {
            r.status = RegistrationStatus::OnboardingRequested;
            Ok(())
        })
        .await
        .unwrap();

    let mut edited = locked.clone();
    edited.device.name = "renamed".to_string();
    assert!(matches!(
        h.requests.update(edited).await,
        Err(DiscoveryError::InvalidState { .. })
    ));
    assert!(matches!(
        h.requests.delete(&request.id).await,
        Err(DiscoveryError::InvalidState { .. })
    ));
    assert!(h.requests.get(&request.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_archived_request_is_restored_with_new_credentials() {
    let h = harness();
    let request = h
        .requests
        .submit(device_payload("10.5.1.7"), "alice")
        .await
        .unwrap();
    h.requests.archive(&request.id).await.unwrap();
    assert!(h.requests.get(&request.id).await.unwrap().is_none());
    assert!(h.requests.get_archived(&request.id).await.unwrap().is_some());

    let restored = h
        .requests
        .unarchive(&request.id, Credentials::with_password("admin", "new-secret"))
        .await
        .unwrap();
    assert_eq!(restored.id, request.id);
    assert_eq!(restored.device.credentials.username, "admin");
    assert!(restored.archive_date.is_none());
    assert!(h.requests.get_archived(&request.id).await.unwrap().is_none());
}
