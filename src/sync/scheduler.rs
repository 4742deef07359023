//! Deferred, deduplicated, ordered dispatch of sync actions.

use crate::core::{GraphError, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{Level, event};

/// Something whose methods can be scheduled for deferred dispatch.
pub trait ActionTarget: Send + Sync {
    /// Type-qualified id of the target; the first half of every action key.
    fn action_key_prefix(&self) -> String;

    /// Runs `method` with `args`.
    fn perform(&self, method: &str, args: &[JsonValue]) -> Result<()>;
}

pub type TargetRef = Arc<dyn ActionTarget>;

/// Identity of an action: `{type id}.{method}`.
pub fn action_key(target: &dyn ActionTarget, method: &str) -> String {
    format!("{}.{}", target.action_key_prefix(), method)
}

/// A pending deferred call.
#[derive(Clone)]
pub struct SyncAction {
    pub key: String,
    pub target: TargetRef,
    pub method: String,
    pub args: Vec<JsonValue>,
    pub order: i64,
    seq: u64,
}

impl std::fmt::Debug for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAction")
            .field("key", &self.key)
            .field("args", &self.args)
            .field("order", &self.order)
            .finish()
    }
}

/// Result of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Keys in the order they were dispatched, failed ones included.
    pub dispatched: Vec<String>,
    pub failures: Vec<GraphError>,
}

impl FlushReport {
    pub fn succeeded(&self) -> usize {
        self.dispatched.len() - self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }
}

/// Collects actions requested during a turn and dispatches each one once.
///
/// Scheduling an action whose key is already pending replaces its args and
/// order but keeps its place among equal orders. A flush dispatches a snapshot
/// of the pending set; anything scheduled while it runs waits for the next one.
#[derive(Default)]
pub struct ActionScheduler {
    pending: Mutex<HashMap<String, SyncAction>>,
    next_seq: AtomicU64,
    flushing: AtomicBool,
    wakeup: Arc<Notify>,
}

impl ActionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `target.method(args)`. Returns `true` if a new action was
    /// enqueued, `false` if a pending one was updated.
    pub fn schedule(
        &self,
        target: &TargetRef,
        method: &str,
        args: Vec<JsonValue>,
        order: i64,
    ) -> bool {
        let key = action_key(target.as_ref(), method);
        let enqueued = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match pending.get_mut(&key) {
                Some(existing) => {
                    existing.args = args;
                    existing.order = order;
                    false
                }
                None => {
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    pending.insert(
                        key.clone(),
                        SyncAction {
                            key,
                            target: target.clone(),
                            method: method.to_string(),
                            args,
                            order,
                            seq,
                        },
                    );
                    true
                }
            }
        };
        self.wakeup.notify_one();
        enqueued
    }

    /// Schedules `target.method()` with no args at order 0.
    pub fn schedule_default(&self, target: &TargetRef, method: &str) -> bool {
        self.schedule(target, method, Vec::new(), 0)
    }

    /// Removes a pending action. Returns whether one was pending.
    pub fn unschedule(&self, target: &dyn ActionTarget, method: &str) -> bool {
        let key = action_key(target, method);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key)
            .is_some()
    }

    pub fn is_scheduled(&self, target: &dyn ActionTarget, method: &str) -> bool {
        let key = action_key(target, method);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(&key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or_default()
    }

    /// Pending actions in dispatch order.
    pub fn pending(&self) -> Vec<SyncAction> {
        let mut actions = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect::<Vec<_>>();
        actions.sort_by_key(|action| (action.order, action.seq));
        actions
    }

    /// Dispatches every action pending when the flush starts.
    ///
    /// A failing or panicking action is reported and logged; the remaining
    /// actions still run. Calling `flush` from inside a dispatched action
    /// returns an empty report.
    pub fn flush(&self) -> FlushReport {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }

        let mut batch = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *pending)
                .into_values()
                .collect::<Vec<_>>()
        };
        batch.sort_by_key(|action| (action.order, action.seq));

        let mut report = FlushReport::default();
        for action in batch {
            if let Err(err) = dispatch(&action) {
                event!(Level::WARN, key = %action.key, error = %err, "sync action failed");
                report.failures.push(err);
            }
            report.dispatched.push(action.key);
        }

        self.flushing.store(false, Ordering::Release);
        if !report.is_empty() {
            event!(
                Level::DEBUG,
                dispatched = report.dispatched.len(),
                failed = report.failures.len(),
                "sync actions flushed"
            );
        }
        report
    }

    /// Runs `work`, then flushes whatever it scheduled.
    pub fn run_turn<R>(&self, work: impl FnOnce() -> R) -> (R, FlushReport) {
        let result = work();
        (result, self.flush())
    }

    pub(crate) fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }
}

fn dispatch(action: &SyncAction) -> Result<()> {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        action.target.perform(&action.method, &action.args)
    }));
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(GraphError::ActionDispatch {
            key: action.key.clone(),
            message: err.to_string(),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(GraphError::ActionDispatch {
                key: action.key.clone(),
                message: format!("panicked: {}", message),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Probe {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ActionTarget for Probe {
        fn action_key_prefix(&self) -> String {
            format!("Probe_{}", self.name)
        }

        fn perform(&self, method: &str, args: &[JsonValue]) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}.{}{:?}", self.name, method, args));
            Ok(())
        }
    }

    fn probe(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> TargetRef {
        Arc::new(Probe {
            name,
            log: log.clone(),
        })
    }

    #[test]
    fn test_same_key_is_coalesced_with_latest_args() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = ActionScheduler::new();
        let target = probe("T", &log);

        assert!(scheduler.schedule(&target, "m", vec![json!(1)], 0));
        assert!(!scheduler.schedule(&target, "m", vec![json!(2)], 0));
        let report = scheduler.flush();

        assert_eq!(report.dispatched, vec!["Probe_T.m"]);
        assert_eq!(*log.lock().unwrap(), vec!["T.m[Number(2)]"]);
    }

    #[test]
    fn test_order_then_enqueue_sequence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = ActionScheduler::new();
        let a = probe("A", &log);
        let b = probe("B", &log);
        let c = probe("C", &log);

        scheduler.schedule(&a, "m", vec![], 5);
        scheduler.schedule(&b, "n", vec![], 1);
        scheduler.schedule(&c, "o", vec![], 5);
        scheduler.schedule(&a, "m", vec![], 5);
        scheduler.flush();

        assert_eq!(*log.lock().unwrap(), vec!["B.n[]", "A.m[]", "C.o[]"]);
    }

    #[test]
    fn test_unschedule_before_flush() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = ActionScheduler::new();
        let target = probe("T", &log);
        scheduler.schedule_default(&target, "m");
        assert!(scheduler.is_scheduled(target.as_ref(), "m"));
        assert!(scheduler.unschedule(target.as_ref(), "m"));
        assert!(!scheduler.unschedule(target.as_ref(), "m"));
        assert!(scheduler.flush().is_empty());
        assert!(log.lock().unwrap().is_empty());
    }
}
