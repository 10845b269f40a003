//! Discovery of devices that report in without being registered


use resource_discovery::model::{DeviceStatus, SYSTEM_OWNER};
use resource_discovery::monitor::{MonitorDispatcher, TopicHandler};
use resource_discovery::processing::reconciler::{ReconcileReport, ReconcilerSettings};
use resource_discovery::processing::UnknownDeviceReconciler;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{device_draft, device_payload, harness, object, wait_until, Harness};

fn reconciler(h: &Harness) -> UnknownDeviceReconciler {
    UnknownDeviceReconciler::new(
        h.requests.clone(),
        h.devices.clone(),
        h.channel.clone(),
        ReconcilerSettings::from_config(&h.config),
    )
}

fn status_signal(ip: &str, reference: &str) -> serde_json::Value {
    json!({
        "message": {
            "ipAddress": ip,
            "clientId": "client",
            "state": "RUNNING",
            "stateLastUpdate": chrono::Utc::now().to_rfc3339(),
            "reference": reference
        }
    })
}

fn node_details(ip: &str, reference: &str) -> serde_json::Value {
    json!({
        "requestType": "NODE_DETAILS",
        "requestId": "req-from-agent",
        "deviceIpAddress": ip,
        "reference": reference,
        "os": "LINUX",
        "name": "edge-discovered",
        "provider": "on-prem",
        "price": 1.5,
        "username": "ubuntu",
        "password": "pw",
        "nodeInfo": {"OS_KERNEL": "6.1"}
    })
}

#[tokio::test]
async fn test_unknown_ip_triggers_one_node_details_request() {
    let h = harness();
    let reconciler = reconciler(&h);

    reconciler.record(&object(status_signal("10.0.0.5", "ref-5")));
    reconciler.record(&object(status_signal("10.0.0.5", "ref-5")));
    assert_eq!(reconciler.pending(), (1, 0));

    let report = reconciler.reconcile().await;
    assert_eq!(
        report,
        ReconcileReport {
            details_requested: 1,
            devices_created: 0
        }
    );

    let sent = h.broker.published(&h.config.topics.device_info_request);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].get("requestType"), Some(&json!("NODE_DETAILS")));
    assert_eq!(sent[0].get("deviceIpAddress"), Some(&json!("10.0.0.5")));
    assert_eq!(sent[0].get("reference"), Some(&json!("ref-5")));

    assert_eq!(reconciler.pending(), (0, 0));
    assert_eq!(reconciler.reconcile().await, ReconcileReport::default());
    assert_eq!(h.broker.published(&h.config.topics.device_info_request).len(), 1);
}

#[tokio::test]
async fn test_known_device_is_not_queried() {
    let h = harness();
    let reconciler = reconciler(&h);
    h.devices
        .create(device_draft("10.3.0.1", "Ref-Known"))
        .await
        .unwrap();

    reconciler.record(&object(status_signal("10.3.0.1", "ref-known")));
    let report = reconciler.reconcile().await;

    assert_eq!(report.details_requested, 0);
    assert!(h
        .broker
        .published(&h.config.topics.device_info_request)
        .is_empty());
}

#[tokio::test]
async fn test_reused_ip_with_new_reference_is_queried() {
    let h = harness();
    let reconciler = reconciler(&h);
    h.devices
        .create(device_draft("10.3.0.2", "old-ref"))
        .await
        .unwrap();

    reconciler.record(&object(status_signal("10.3.0.2", "new-ref")));
    assert_eq!(reconciler.reconcile().await.details_requested, 1);
}

#[tokio::test]
async fn test_ip_of_pending_registration_is_not_queried() {
    let h = harness();
    let reconciler = reconciler(&h);
    h.requests
        .submit(device_payload("10.3.0.3"), "alice")
        .await
        .unwrap();

    reconciler.record(&object(status_signal("10.3.0.3", "ref")));
    assert_eq!(reconciler.reconcile().await.details_requested, 0);
}

#[tokio::test]
async fn test_non_signal_responses_are_ignored() {
    let h = harness();
    let reconciler = reconciler(&h);

    reconciler.record(&object(json!({
        "requestType": "DIAGNOSTICS",
        "deviceIpAddress": "10.3.0.4",
        "reference": "ref"
    })));
    reconciler.record(&object(json!({"message": {"ipAddress": "10.3.0.4"}})));
    assert_eq!(reconciler.pending(), (0, 0));

    reconciler.record(&object(json!({
        "requestType": "INFO",
        "deviceIpAddress": "10.3.0.4",
        "reference": "ref"
    })));
    assert_eq!(reconciler.pending(), (1, 0));
}

#[tokio::test]
async fn test_node_details_reply_creates_device() {
    let h = harness();
    let reconciler = reconciler(&h);

    reconciler.record(&object(node_details("10.3.0.5", "ref-new")));
    assert_eq!(reconciler.pending(), (0, 1));
    let report = reconciler.reconcile().await;
    assert_eq!(report.devices_created, 1);

    let device = h
        .devices
        .get_by_ip_address("10.3.0.5")
        .await
        .unwrap()
        .expect("device should be created");
    assert_eq!(device.owner, SYSTEM_OWNER);
    assert_eq!(device.status, DeviceStatus::NewDevice);
    assert_eq!(device.os, "LINUX");
    assert_eq!(device.name, "edge-discovered");
    assert_eq!(device.provider.as_deref(), Some("on-prem"));
    assert_eq!(device.price, Some(1.5));
    assert_eq!(device.credentials.username, "ubuntu");
    assert_eq!(device.credentials.password.as_deref(), Some("pw"));
    assert_eq!(device.node_reference.as_deref(), Some("ref-new"));
    assert_eq!(device.request_id.as_deref(), Some("req-from-agent"));
    assert_eq!(
        device.device_info.get("OS_KERNEL").map(String::as_str),
        Some("6.1")
    );
    assert_eq!(h.fleet.registered(), vec![device.id.clone()]);
}

#[tokio::test]
async fn test_invalid_node_details_create_nothing() {
    let h = harness();
    let reconciler = reconciler(&h);

    let mut reply = object(node_details("10.3.0.6", "ref"));
    reply.remove("password");
    reconciler.record(&reply);

    let report = reconciler.reconcile().await;
    assert_eq!(report.devices_created, 0);
    assert!(h.devices.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_node_details_for_taken_ip_create_nothing() {
    let h = harness();
    let reconciler = reconciler(&h);
    h.devices
        .create(device_draft("10.3.0.7", "ref-a"))
        .await
        .unwrap();

    reconciler.record(&object(node_details("10.3.0.7", "ref-b")));
    assert_eq!(reconciler.reconcile().await.devices_created, 0);
    assert_eq!(h.devices.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_signals_arrive_through_subscribed_topics() {
    let h = harness();
    let _dispatcher = h.channel.start_dispatcher().unwrap();
    let reconciler = Arc::new(reconciler(&h));
    assert!(reconciler.topics().contains(&h.config.topics.device_status));
    assert!(reconciler.topics().contains(&h.config.topics.device_info_response));

    MonitorDispatcher::new(reconciler.clone())
        .bootstrap(h.channel.clone(), Duration::from_millis(10))
        .await;

    assert!(h.broker.inject(
        &h.config.topics.device_status,
        &object(status_signal("10.3.0.8", "ref-8")),
    ));
    assert!(wait_until(Duration::from_secs(2), || async { reconciler.pending() == (1, 0) }).await);
}
