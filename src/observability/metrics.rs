//! Thread-safe metrics collection
//!
//! Atomic counters for broker traffic, sweeps and device health transitions.
//! A single process-wide collector is reachable through [`metrics()`].

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct MetricsCollector {
    // Broker connection
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    health_checks_failed: AtomicU64,
    last_health_check: AtomicU64,

    // Broker traffic
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    sends_exhausted: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,

    // Periodic jobs
    sweeps_completed: AtomicU64,
    sweeps_skipped: AtomicU64,

    // Entity transitions
    devices_suspect: AtomicU64,
    devices_failed: AtomicU64,
    devices_discovered: AtomicU64,
    records_archived: AtomicU64,

    uptime_start: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub broker_connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects_scheduled: u64,
    pub health_checks_failed: u64,
    pub last_health_check: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub sends_exhausted: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub sweeps_completed: u64,
    pub sweeps_skipped: u64,
    pub devices_suspect: u64,
    pub devices_failed: u64,
    pub devices_discovered: u64,
    pub records_archived: u64,
    pub uptime_seconds: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            health_checks_failed: AtomicU64::new(0),
            last_health_check: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            sends_exhausted: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            sweeps_completed: AtomicU64::new(0),
            sweeps_skipped: AtomicU64::new(0),
            devices_suspect: AtomicU64::new(0),
            devices_failed: AtomicU64::new(0),
            devices_discovered: AtomicU64::new(0),
            records_archived: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn broker_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_established(&self) {
        self.broker_connected.store(true, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_failed(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connection_closed(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn health_check(&self, healthy: bool) {
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
        if !healthy {
            self.health_checks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_exhausted(&self) {
        self.sends_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_completed(&self) {
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_skipped(&self) {
        self.sweeps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_suspect(&self) {
        self.devices_suspect.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_failed(&self) {
        self.devices_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_discovered(&self) {
        self.devices_discovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archived(&self) {
        self.records_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
            connection_attempts: load(&self.connection_attempts),
            connections_established: load(&self.connections_established),
            connection_failures: load(&self.connection_failures),
            reconnects_scheduled: load(&self.reconnects_scheduled),
            health_checks_failed: load(&self.health_checks_failed),
            last_health_check: load(&self.last_health_check),
            messages_published: load(&self.messages_published),
            publish_failures: load(&self.publish_failures),
            sends_exhausted: load(&self.sends_exhausted),
            messages_received: load(&self.messages_received),
            messages_dropped: load(&self.messages_dropped),
            sweeps_completed: load(&self.sweeps_completed),
            sweeps_skipped: load(&self.sweeps_skipped),
            devices_suspect: load(&self.devices_suspect),
            devices_failed: load(&self.devices_failed),
            devices_discovered: load(&self.devices_discovered),
            records_archived: load(&self.records_archived),
            uptime_seconds: current_timestamp().saturating_sub(load(&self.uptime_start)),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
