//! Status and metrics monitors, and the subscription bootstrap that feeds them


use chrono::{Duration as ChronoDuration, Utc};
use resource_discovery::model::DeviceStatus;
use resource_discovery::monitor::{
    DeviceMetricsMonitor, DeviceStatusMonitor, MonitorDispatcher, TopicHandler,
};
use resource_discovery::observability::metrics;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{device_draft, harness, object, wait_until};

fn status_report(
    ip: &str,
    reference: &str,
    state: &str,
    at: chrono::DateTime<Utc>,
) -> serde_json::Value {
    json!({
        "message": {
            "ipAddress": ip,
            "clientId": format!("client-{ip}"),
            "state": state,
            "stateLastUpdate": at.to_rfc3339(),
            "reference": reference
        }
    })
}

#[tokio::test]
async fn test_status_report_revives_suspect_device() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.2.0.1", "ref-1"))
        .await
        .unwrap();
    h.devices
        .modify(&device.id, |d| {
            d.status = DeviceStatus::Suspect;
            d.suspect_timestamp = Some(Utc::now());
            d.retries = 2;
            Ok(())
        })
        .await
        .unwrap();

    let monitor = DeviceStatusMonitor::new(h.devices.clone(), "_ui_instance_info");
    let now = Utc::now();
    monitor
        .handle(
            "_ui_instance_info",
            &object(status_report("10.2.0.1", "ref-1", "RUNNING", now)),
        )
        .await
        .unwrap();

    let stored = h.devices.get_required(&device.id).await.unwrap();
    assert_eq!(stored.status, DeviceStatus::Healthy);
    assert_eq!(stored.suspect_timestamp, None);
    assert_eq!(stored.retries, 0);
    let update = stored.status_update.unwrap();
    assert_eq!(update.state, "RUNNING");
    assert_eq!(update.state_last_update.timestamp(), now.timestamp());
}

#[tokio::test]
async fn test_older_status_report_is_ignored() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.2.0.2", "ref-2"))
        .await
        .unwrap();
    let monitor = DeviceStatusMonitor::new(h.devices.clone(), "_ui_instance_info");
    let now = Utc::now();

    monitor
        .handle(
            "_ui_instance_info",
            &object(status_report("10.2.0.2", "ref-2", "RUNNING", now)),
        )
        .await
        .unwrap();
    monitor
        .handle(
            "_ui_instance_info",
            &object(status_report(
                "10.2.0.2",
                "ref-2",
                "STOPPED",
                now - ChronoDuration::minutes(3),
            )),
        )
        .await
        .unwrap();

    let stored = h.devices.get_required(&device.id).await.unwrap();
    assert_eq!(stored.status_update.unwrap().state, "RUNNING");
}

#[tokio::test]
async fn test_status_report_with_wrong_reference_is_ignored() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.2.0.3", "ref-3"))
        .await
        .unwrap();
    let monitor = DeviceStatusMonitor::new(h.devices.clone(), "_ui_instance_info");

    monitor
        .handle(
            "_ui_instance_info",
            &object(status_report("10.2.0.3", "ref-other", "RUNNING", Utc::now())),
        )
        .await
        .unwrap();
    monitor
        .handle(
            "_ui_instance_info",
            &object(status_report("10.9.9.9", "ref-3", "RUNNING", Utc::now())),
        )
        .await
        .unwrap();

    let stored = h.devices.get_required(&device.id).await.unwrap();
    assert!(stored.status_update.is_none());
}

#[tokio::test]
async fn test_metrics_snapshot_is_stored() {
    let h = harness();
    let device = h
        .devices
        .create(device_draft("10.2.0.4", "ref-4"))
        .await
        .unwrap();
    let monitor = DeviceMetricsMonitor::new(h.devices.clone(), "_client_metrics");
    let now = Utc::now();

    monitor
        .handle(
            "_client_metrics",
            &object(json!({
                "message": {
                    "clientId": "client-4",
                    "ipAddress": "10.2.0.4",
                    "receivedAtServer": now.to_rfc3339(),
                    "cpu": 0.25,
                    "latest-events": [{"event": "boot"}]
                }
            })),
        )
        .await
        .unwrap();
    monitor
        .handle(
            "_client_metrics",
            &object(json!({
                "message": {
                    "clientId": "client-4",
                    "ipAddress": "10.2.0.4",
                    "receivedAtServer": (now - ChronoDuration::minutes(1)).to_rfc3339(),
                    "cpu": 0.99
                }
            })),
        )
        .await
        .unwrap();

    let metrics = h
        .devices
        .get_required(&device.id)
        .await
        .unwrap()
        .metrics
        .unwrap();
    assert_eq!(metrics.client_id, "client-4");
    assert_eq!(metrics.metrics.get("cpu"), Some(&json!(0.25)));
    assert_eq!(metrics.latest_events.len(), 1);
}

#[tokio::test]
async fn test_incomplete_metrics_are_rejected() {
    let h = harness();
    let monitor = DeviceMetricsMonitor::new(h.devices.clone(), "_client_metrics");

    let result = monitor
        .handle(
            "_client_metrics",
            &object(json!({"message": {"ipAddress": "10.2.0.5", "cpu": 1}})),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_retries_failed_subscriptions() {
    let h = harness();
    let _dispatcher = h.channel.start_dispatcher().unwrap();
    let device = h
        .devices
        .create(device_draft("10.2.0.6", "ref-6"))
        .await
        .unwrap();

    let dispatcher = MonitorDispatcher::new(Arc::new(DeviceStatusMonitor::new(
        h.devices.clone(),
        "_ui_instance_info",
    )));
    assert_eq!(dispatcher.handler_name(), "device_status_monitor");
    h.broker.fail_next_subscriptions(1);
    tokio::spawn(
        dispatcher
            .clone()
            .bootstrap(h.channel.clone(), Duration::from_secs(5)),
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.channel.subscribed_topics().await.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        h.channel.subscribed_topics().await,
        vec!["_ui_instance_info".to_string()]
    );

    assert!(h.broker.inject(
        "_ui_instance_info",
        &object(status_report("10.2.0.6", "ref-6", "RUNNING", Utc::now())),
    ));
    let devices = h.devices.clone();
    let id = device.id.clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let devices = devices.clone();
            let id = id.clone();
            async move {
                devices
                    .get_required(&id)
                    .await
                    .map(|d| d.status_update.is_some())
                    .unwrap_or(false)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_handler_errors_are_dropped_by_dispatcher() {
    let h = harness();
    let _dispatcher = h.channel.start_dispatcher().unwrap();
    let dispatcher = MonitorDispatcher::new(Arc::new(DeviceMetricsMonitor::new(
        h.devices.clone(),
        "_client_metrics",
    )));
    dispatcher
        .clone()
        .bootstrap(h.channel.clone(), Duration::from_millis(10))
        .await;

    let dropped_before = metrics().snapshot().messages_dropped;
    assert!(h.broker.inject(
        "_client_metrics",
        &object(json!({"message": {"ipAddress": "10.2.0.7"}})),
    ));
    assert!(
        wait_until(Duration::from_secs(2), || async {
            metrics().snapshot().messages_dropped > dropped_before
        })
        .await
    );
}
