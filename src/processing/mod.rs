//! Periodic and message-driven processing of devices and registration requests

pub mod correlator;
pub mod lifecycle;
pub mod reconciler;
pub mod sweeper;

pub use correlator::ResponseCorrelator;
pub use lifecycle::LifecycleRequestCoordinator;
pub use reconciler::UnknownDeviceReconciler;
pub use sweeper::HealthSweeper;

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of asking a periodic job to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SweepOutcome {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ALREADY RUNNING")]
    AlreadyRunning,
}

impl fmt::Display for SweepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepOutcome::Done => f.write_str("DONE"),
            SweepOutcome::AlreadyRunning => f.write_str("ALREADY RUNNING"),
        }
    }
}

/// Re-entrancy flag of one periodic job
#[derive(Debug, Default)]
pub struct SweepFlag(AtomicBool);

impl SweepFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the flag; `None` while another run holds it
    pub fn try_acquire(&self) -> Option<SweepGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(&self.0))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag when dropped, also on panic or early return
#[derive(Debug)]
pub struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_rejects_second_holder() {
        let flag = SweepFlag::new();
        let guard = flag.try_acquire();
        assert!(guard.is_some());
        assert!(flag.is_running());
        assert!(flag.try_acquire().is_none());

        drop(guard);
        assert!(!flag.is_running());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(SweepOutcome::Done.to_string(), "DONE");
        assert_eq!(SweepOutcome::AlreadyRunning.to_string(), "ALREADY RUNNING");
        assert_eq!(
            serde_json::to_string(&SweepOutcome::AlreadyRunning).unwrap(),
            "\"ALREADY RUNNING\""
        );
    }
}
