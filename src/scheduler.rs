//! Task scheduler for the periodic jobs
//!
//! Every job runs on its own tokio task and stops when the scheduler is shut
//! down. Fixed-rate jobs spawn each run separately, so a slow run never delays
//! the next tick; the jobs themselves reject overlapping runs.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct TaskScheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Number of scheduled jobs that have not finished yet
    pub fn active_jobs(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter(|task| !task.is_finished()).count()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run `job` once after `delay`
    pub fn schedule_once<Fut>(&self, name: &'static str, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.track(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            debug!(job = name, "Running one-shot job");
            tokio::select! {
                _ = job => {}
                _ = shutdown.changed() => debug!(job = name, "One-shot job cancelled"),
            }
        }));
    }

    /// Start `job` every `period`, the first time after `initial_delay`
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(job = name, period_secs = period.as_secs(), "Scheduled fixed-rate job");
        self.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tokio::spawn(job());
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(job = name, "Fixed-rate job stopped");
        }));
    }

    /// Run `job` repeatedly, waiting `delay` between the end of one run and
    /// the start of the next
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        name: &'static str,
        initial_delay: Duration,
        delay: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(job = name, delay_secs = delay.as_secs(), "Scheduled fixed-delay job");
        self.track(tokio::spawn(async move {
            let mut wait = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                tokio::select! {
                    _ = job() => {}
                    _ = shutdown.changed() => break,
                }
                wait = delay;
            }
            debug!(job = name, "Fixed-delay job stopped");
        }));
    }

    /// Stop every job and wait for their tasks to finish
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Task scheduler stopped");
    }
}
