use crate::sync::scheduler::{ActionScheduler, TargetRef};
use std::ops::Deref;
use std::sync::Arc;

/// A `Vec` that schedules `owner.method` whenever it is mutated.
///
/// Read access goes through `Deref<Target = [T]>`; every mutating call
/// schedules the owner's action once, so a burst of edits in one turn causes
/// a single dispatch.
pub struct ObservedVec<T> {
    items: Vec<T>,
    scheduler: Arc<ActionScheduler>,
    owner: TargetRef,
    method: String,
}

impl<T> ObservedVec<T> {
    pub fn new(scheduler: Arc<ActionScheduler>, owner: TargetRef, method: impl Into<String>) -> Self {
        Self::from_vec(Vec::new(), scheduler, owner, method)
    }

    /// Wraps existing items without scheduling anything.
    pub fn from_vec(
        items: Vec<T>,
        scheduler: Arc<ActionScheduler>,
        owner: TargetRef,
        method: impl Into<String>,
    ) -> Self {
        Self {
            items,
            scheduler,
            owner,
            method: method.into(),
        }
    }

    fn changed(&self) {
        self.scheduler.schedule_default(&self.owner, &self.method);
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.changed();
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.items.pop();
        if item.is_some() {
            self.changed();
        }
        item
    }

    /// Inserts at `index`, clamped to the current length.
    pub fn insert(&mut self, index: usize, item: T) {
        let index = index.min(self.items.len());
        self.items.insert(index, item);
        self.changed();
    }

    /// Removes the item at `index`; out of range is a no-op.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() {
            return None;
        }
        let item = self.items.remove(index);
        self.changed();
        Some(item)
    }

    /// Replaces the item at `index`, returning the previous one.
    pub fn set(&mut self, index: usize, item: T) -> Option<T> {
        let slot = self.items.get_mut(index)?;
        let previous = std::mem::replace(slot, item);
        self.changed();
        Some(previous)
    }

    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        self.items.clear();
        self.changed();
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        let before = self.items.len();
        self.items.retain(keep);
        if self.items.len() != before {
            self.changed();
        }
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

impl<T> Deref for ObservedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ObservedVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedVec")
            .field("items", &self.items)
            .field("method", &self.method)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Entity;
    use crate::graph::GraphContext;
    use crate::sync::DurableTarget;

    fn view(context: &GraphContext) -> TargetRef {
        let object = Entity::new("View");
        context.identities().set_id(&object, "main").unwrap();
        DurableTarget::shared(context.clone(), object, |_, _, _| Ok(()))
    }

    #[test]
    fn test_burst_of_mutations_schedules_once() {
        let context = GraphContext::new();
        let scheduler = Arc::new(ActionScheduler::new());
        let mut rows = ObservedVec::new(scheduler.clone(), view(&context), "render");

        rows.push(1);
        rows.push(2);
        rows.insert(0, 0);
        rows.set(1, 10);
        assert_eq!(&*rows, &[0, 10, 2]);
        assert_eq!(scheduler.pending_len(), 1);

        let report = scheduler.flush();
        assert_eq!(report.dispatched, vec!["View_main.render"]);
    }

    #[test]
    fn test_no_op_mutations_do_not_schedule() {
        let context = GraphContext::new();
        let scheduler = Arc::new(ActionScheduler::new());
        let mut rows: ObservedVec<i32> = ObservedVec::new(scheduler.clone(), view(&context), "render");

        assert_eq!(rows.remove(3), None);
        assert_eq!(rows.set(0, 1), None);
        assert_eq!(rows.pop(), None);
        rows.clear();
        rows.retain(|_| true);
        assert_eq!(scheduler.pending_len(), 0);
    }
}
