use crate::core::{ObjectRef, Result};
use crate::graph::GraphContext;
use crate::sync::scheduler::{ActionTarget, TargetRef};
use serde_json::Value as JsonValue;
use std::sync::Arc;

type Handler = dyn Fn(&ObjectRef, &str, &[JsonValue]) -> Result<()> + Send + Sync;

/// Binds a durable object to the scheduler.
///
/// Actions are keyed by the object's type id in its [`GraphContext`], so two
/// objects never share a key and repeated requests on one object coalesce.
pub struct DurableTarget {
    context: GraphContext,
    object: ObjectRef,
    handler: Box<Handler>,
}

impl DurableTarget {
    pub fn new(
        context: GraphContext,
        object: ObjectRef,
        handler: impl Fn(&ObjectRef, &str, &[JsonValue]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            context,
            object,
            handler: Box::new(handler),
        }
    }

    /// Wraps the target for [`ActionScheduler::schedule`](crate::sync::ActionScheduler::schedule).
    pub fn shared(
        context: GraphContext,
        object: ObjectRef,
        handler: impl Fn(&ObjectRef, &str, &[JsonValue]) -> Result<()> + Send + Sync + 'static,
    ) -> TargetRef {
        Arc::new(Self::new(context, object, handler))
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }
}

impl ActionTarget for DurableTarget {
    fn action_key_prefix(&self) -> String {
        self.context.identities().type_id(self.object.as_ref())
    }

    fn perform(&self, method: &str, args: &[JsonValue]) -> Result<()> {
        (self.handler)(&self.object, method, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Entity, ObjectRole};
    use crate::sync::ActionScheduler;
    use std::sync::Mutex;

    #[test]
    fn test_prefix_is_type_id() {
        let context = GraphContext::new();
        let class = Entity::with_role("Board", ObjectRole::Class);
        context.identities().set_id(&class, "b1").unwrap();
        let target = DurableTarget::new(context, class, |_, _, _| Ok(()));
        assert_eq!(target.action_key_prefix(), "Board_Class_b1");
    }

    #[test]
    fn test_distinct_objects_never_coalesce() {
        let context = GraphContext::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let scheduler = ActionScheduler::new();
        let targets = (0..2)
            .map(|_| {
                let calls = calls.clone();
                let context_for_handler = context.clone();
                DurableTarget::shared(context.clone(), Entity::new("Board"), move |object, method, _| {
                    let key = context_for_handler.identities().type_id(object.as_ref());
                    calls.lock().unwrap().push(format!("{}.{}", key, method));
                    Ok(())
                })
            })
            .collect::<Vec<_>>();

        for target in &targets {
            scheduler.schedule_default(target, "render");
            scheduler.schedule_default(target, "render");
        }
        assert_eq!(scheduler.pending_len(), 2);

        let report = scheduler.flush();
        assert_eq!(report.dispatched, *calls.lock().unwrap());
    }
}
