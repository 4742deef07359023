use crate::core::{GraphError, Result};
use crate::sync::scheduler::{ActionScheduler, FlushReport};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Counters kept by a [`SchedulerWorker`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub flushes: u64,
    pub dispatched: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

impl WorkerStats {
    fn record(&mut self, report: &FlushReport) {
        if report.is_empty() {
            return;
        }
        self.flushes += 1;
        self.dispatched += report.dispatched.len() as u64;
        self.failures += report.failures.len() as u64;
        if let Some(err) = report.failures.last() {
            self.last_error = Some(err.to_string());
        }
    }
}

/// Background task that flushes a scheduler at the end of each turn.
///
/// A turn ends when the task that scheduled an action next yields to the
/// runtime: the worker wakes on every schedule, yields once so the rest of
/// the turn can enqueue, then flushes.
pub struct SchedulerWorker {
    scheduler: Arc<ActionScheduler>,
    stats: Arc<Mutex<WorkerStats>>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SchedulerWorker {
    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.scheduler
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    /// Signals the worker to stop, waits for it, then flushes anything still pending.
    pub async fn stop(mut self) -> Result<FlushReport> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| GraphError::Worker(format!("scheduler worker join: {}", err)))?;
        }

        let report = self.scheduler.flush();
        self.stats.lock()?.record(&report);
        Ok(report)
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns a worker flushing `scheduler` on the current Tokio runtime.
pub fn spawn_scheduler_worker(scheduler: Arc<ActionScheduler>) -> SchedulerWorker {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let stats = Arc::new(Mutex::new(WorkerStats::default()));
    let wakeup = scheduler.wakeup();
    let scheduler_for_worker = scheduler.clone();
    let stats_for_worker = stats.clone();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    break;
                }
                _ = wakeup.notified() => {
                    tokio::task::yield_now().await;
                    let report = scheduler_for_worker.flush();
                    match stats_for_worker.lock() {
                        Ok(mut stats) => stats.record(&report),
                        Err(err) => {
                            event!(Level::ERROR, error = %err, "scheduler worker stats unavailable");
                        }
                    }
                }
            }
        }
    });

    SchedulerWorker {
        scheduler,
        stats,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
