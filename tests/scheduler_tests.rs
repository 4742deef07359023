//! Integration tests for deferred action dispatch

use graphpersist::sync::action_key;
use graphpersist::{
    ActionScheduler, ActionTarget, DurableTarget, Entity, GraphContext, GraphError, ObservedVec,
    Result, TargetRef, spawn_scheduler_worker,
};
use serde_json::{Value as JsonValue, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type CallLog = Arc<Mutex<Vec<String>>>;

/// A durable node that logs each dispatched call with its args.
fn node(context: &GraphContext, log: &CallLog) -> DurableTarget {
    let log = log.clone();
    DurableTarget::new(context.clone(), Entity::new("Node"), move |_, method, args| {
        log.lock()
            .unwrap()
            .push(format!("{}:{}", method, JsonValue::from(args.to_vec())));
        Ok(())
    })
}

struct Named {
    name: &'static str,
    log: CallLog,
}

impl ActionTarget for Named {
    fn action_key_prefix(&self) -> String {
        format!("Named_{}", self.name)
    }

    fn perform(&self, method: &str, _args: &[JsonValue]) -> Result<()> {
        match method {
            "fail" => Err(GraphError::InvalidValue("refused".to_string())),
            "panic" => panic!("listener exploded"),
            _ => {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}.{}", self.name, method));
                Ok(())
            }
        }
    }
}

/// Schedules a follow-up action on `next` every time it runs.
struct Chain {
    scheduler: Arc<ActionScheduler>,
    next: TargetRef,
    log: CallLog,
}

impl ActionTarget for Chain {
    fn action_key_prefix(&self) -> String {
        "Chain_1".to_string()
    }

    fn perform(&self, method: &str, _args: &[JsonValue]) -> Result<()> {
        self.log.lock().unwrap().push(format!("chain.{}", method));
        self.scheduler.schedule_default(&self.next, "follow");
        assert!(self.scheduler.flush().is_empty());
        Ok(())
    }
}

fn named(name: &'static str, log: &CallLog) -> TargetRef {
    Arc::new(Named {
        name,
        log: log.clone(),
    })
}

fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn test_action_key_uses_type_id() {
    let context = GraphContext::new();
    let node = node(&context, &CallLog::default());
    context.identities().set_id(node.object(), "n1").unwrap();
    assert_eq!(action_key(&node, "syncToView"), "Node_n1.syncToView");
}

#[test]
fn test_repeated_schedule_dispatches_latest_args_once() {
    let log = CallLog::default();
    let context = GraphContext::new();
    let node: TargetRef = Arc::new(node(&context, &log));
    let scheduler = ActionScheduler::new();

    scheduler.schedule(&node, "syncToView", vec![json!(1)], 0);
    scheduler.schedule(&node, "syncToView", vec![json!(2)], 0);
    scheduler.schedule(&node, "syncToView", vec![json!(3), json!("x")], 0);
    assert_eq!(scheduler.pending_len(), 1);

    let report = scheduler.flush();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(entries(&log), vec![r#"syncToView:[3,"x"]"#]);
    assert!(scheduler.flush().is_empty());
}

#[test]
fn test_dispatch_is_stable_sorted_by_order() {
    let log = CallLog::default();
    let scheduler = ActionScheduler::new();
    let a = named("A", &log);
    let b = named("B", &log);
    let c = named("C", &log);
    let d = named("D", &log);

    scheduler.schedule(&a, "m", vec![], 5);
    scheduler.schedule(&b, "n", vec![], 1);
    scheduler.schedule(&c, "o", vec![], 5);
    scheduler.schedule(&d, "p", vec![], 9);
    // rescheduling D with a lower order moves it ahead of A and C
    scheduler.schedule(&d, "p", vec![], 1);

    let pending = scheduler
        .pending()
        .into_iter()
        .map(|action| action.key)
        .collect::<Vec<_>>();
    assert_eq!(pending, vec!["Named_B.n", "Named_D.p", "Named_A.m", "Named_C.o"]);

    scheduler.flush();
    assert_eq!(entries(&log), vec!["B.n", "D.p", "A.m", "C.o"]);
}

#[test]
fn test_failures_do_not_stop_the_flush() {
    let log = CallLog::default();
    let scheduler = ActionScheduler::new();
    let target = named("T", &log);

    scheduler.schedule(&target, "fail", vec![], 0);
    scheduler.schedule(&target, "panic", vec![], 1);
    scheduler.schedule(&target, "ok", vec![], 2);

    let report = scheduler.flush();

    assert_eq!(report.dispatched.len(), 3);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failures.len(), 2);
    assert!(matches!(
        &report.failures[0],
        GraphError::ActionDispatch { key, .. } if key == "Named_T.fail"
    ));
    assert!(matches!(
        &report.failures[1],
        GraphError::ActionDispatch { key, message } if key == "Named_T.panic" && message.contains("listener exploded")
    ));
    assert_eq!(entries(&log), vec!["T.ok"]);
}

#[test]
fn test_actions_scheduled_during_flush_wait_for_next_flush() {
    let log = CallLog::default();
    let scheduler = Arc::new(ActionScheduler::new());
    let chain: TargetRef = Arc::new(Chain {
        scheduler: scheduler.clone(),
        next: named("N", &log),
        log: log.clone(),
    });

    scheduler.schedule_default(&chain, "start");
    let first = scheduler.flush();
    assert_eq!(first.dispatched, vec!["Chain_1.start"]);
    assert!(first.failures.is_empty());
    assert_eq!(scheduler.pending_len(), 1);
    assert_eq!(entries(&log), vec!["chain.start"]);

    let second = scheduler.flush();
    assert_eq!(second.dispatched, vec!["Named_N.follow"]);
    assert_eq!(entries(&log), vec!["chain.start", "N.follow"]);
}

#[test]
fn test_unschedule_is_a_no_op_after_dispatch() {
    let log = CallLog::default();
    let scheduler = ActionScheduler::new();
    let target = named("T", &log);

    scheduler.schedule_default(&target, "m");
    scheduler.schedule_default(&target, "n");
    assert!(scheduler.unschedule(target.as_ref(), "m"));
    scheduler.flush();
    assert!(!scheduler.unschedule(target.as_ref(), "n"));
    assert!(!scheduler.unschedule(target.as_ref(), "never"));
    assert_eq!(entries(&log), vec!["T.n"]);
}

#[test]
fn test_run_turn_flushes_after_work() {
    let log = CallLog::default();
    let scheduler = Arc::new(ActionScheduler::new());
    let context = GraphContext::new();
    let list = Entity::new("List");
    context.identities().set_id(&list, "l1").unwrap();
    let owner = {
        let log = log.clone();
        DurableTarget::shared(context.clone(), list, move |object, method, _| {
            log.lock()
                .unwrap()
                .push(format!("{}.{}", object.type_name(), method));
            Ok(())
        })
    };

    let (len, report) = scheduler.run_turn(|| {
        let mut items = ObservedVec::new(scheduler.clone(), owner.clone(), "render");
        items.push("a");
        items.push("b");
        items.retain(|item| *item != "a");
        items.len()
    });

    assert_eq!(len, 1);
    assert_eq!(report.dispatched, vec!["List_l1.render"]);
    assert_eq!(entries(&log), vec!["List.render"]);
}

#[tokio::test]
async fn test_worker_flushes_at_end_of_turn() {
    let log = CallLog::default();
    let scheduler = Arc::new(ActionScheduler::new());
    let worker = spawn_scheduler_worker(scheduler.clone());
    let target = named("W", &log);

    scheduler.schedule(&target, "m", vec![json!(1)], 0);
    scheduler.schedule(&target, "m", vec![json!(2)], 0);

    for _ in 0..200 {
        if !entries(&log).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(entries(&log), vec!["W.m"]);
    assert_eq!(worker.stats().dispatched, 1);

    scheduler.schedule_default(&target, "late");
    let report = worker.stop().await.unwrap();
    assert_eq!(report.dispatched, vec!["Named_W.late"]);
    assert_eq!(entries(&log), vec!["W.m", "W.late"]);
}
