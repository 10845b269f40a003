//! Observability: structured logging and process-wide counters

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use crate::{broker_span, monitor_span, sweep_span};
