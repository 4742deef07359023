pub mod observable;
pub mod scheduler;
pub mod target;
pub mod worker;

pub use observable::ObservedVec;
pub use scheduler::{ActionScheduler, ActionTarget, FlushReport, SyncAction, TargetRef, action_key};
pub use target::DurableTarget;
pub use worker::{SchedulerWorker, WorkerStats, spawn_scheduler_worker};
