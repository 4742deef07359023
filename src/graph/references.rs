//! Forward and reverse reference edges between stored records.

use crate::core::{Puuid, Result};
use crate::graph::codec::{StorableRecord, reference_token_target, unwrap_inline_map};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

/// Collects the id of every reference token inside a record's fields.
///
/// Tokens whose target is not a valid identity are skipped here and reported
/// by [`malformed_references_of`].
pub fn references_of(record: &StorableRecord) -> BTreeSet<Puuid> {
    let mut out = BTreeSet::new();
    for_each_token_target(record, &mut |target| {
        if let Ok(id) = Puuid::parse(target) {
            out.insert(id);
        }
    });
    out
}

/// Raw targets of reference tokens that do not parse as identities.
pub fn malformed_references_of(record: &StorableRecord) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for_each_token_target(record, &mut |target| {
        if Puuid::parse(target).is_err() {
            out.insert(target.to_string());
        }
    });
    out
}

fn for_each_token_target(record: &StorableRecord, visit: &mut dyn FnMut(&str)) {
    for value in record.fields.values() {
        walk_tokens(value, visit);
    }
}

fn walk_tokens(value: &JsonValue, visit: &mut dyn FnMut(&str)) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                walk_tokens(item, visit);
            }
        }
        JsonValue::Object(map) => {
            if let Some(target) = reference_token_target(map) {
                visit(target);
                return;
            }
            let entries = unwrap_inline_map(map).unwrap_or(map);
            for nested in entries.values() {
                walk_tokens(nested, visit);
            }
        }
        _ => {}
    }
}

/// Edges added and removed by one record write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceDiff {
    pub added: BTreeSet<Puuid>,
    pub removed: BTreeSet<Puuid>,
}

impl ReferenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct IndexState {
    forward: HashMap<Puuid, BTreeSet<Puuid>>,
    reverse: HashMap<Puuid, BTreeSet<Puuid>>,
}

impl IndexState {
    fn link(&mut self, from: &Puuid, to: &Puuid) {
        self.reverse
            .entry(to.clone())
            .or_default()
            .insert(from.clone());
    }

    fn unlink(&mut self, from: &Puuid, to: &Puuid) {
        if let Some(referrers) = self.reverse.get_mut(to) {
            referrers.remove(from);
            if referrers.is_empty() {
                self.reverse.remove(to);
            }
        }
    }
}

/// Reference graph over stored records, maintained incrementally on every write.
///
/// The index answers reachability questions; it never deletes anything. Records
/// that end up unreachable stay in the store until a caller deletes them.
#[derive(Default)]
pub struct ReferenceIndex {
    state: Mutex<IndexState>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_written(&self, record: &StorableRecord) -> Result<ReferenceDiff> {
        self.set_references(&record.id, references_of(record))
    }

    /// Replaces the outgoing edges of `from`, updating the reverse index with the difference.
    pub fn set_references(&self, from: &Puuid, targets: BTreeSet<Puuid>) -> Result<ReferenceDiff> {
        let mut state = self.state.lock()?;
        let previous = state.forward.remove(from).unwrap_or_default();
        let diff = ReferenceDiff {
            added: targets.difference(&previous).cloned().collect(),
            removed: previous.difference(&targets).cloned().collect(),
        };
        for target in &diff.removed {
            state.unlink(from, target);
        }
        for target in &diff.added {
            state.link(from, target);
        }
        if !targets.is_empty() {
            state.forward.insert(from.clone(), targets);
        }
        Ok(diff)
    }

    /// Drops the outgoing edges of a deleted record. Incoming edges stay, so
    /// dangling referrers remain visible through [`ReferenceIndex::referenced_by`].
    pub fn record_removed(&self, id: &Puuid) -> Result<BTreeSet<Puuid>> {
        let mut state = self.state.lock()?;
        let previous = state.forward.remove(id).unwrap_or_default();
        for target in &previous {
            state.unlink(id, target);
        }
        Ok(previous)
    }

    pub fn references_from(&self, id: &Puuid) -> Result<BTreeSet<Puuid>> {
        let state = self.state.lock()?;
        Ok(state.forward.get(id).cloned().unwrap_or_default())
    }

    pub fn referenced_by(&self, id: &Puuid) -> Result<BTreeSet<Puuid>> {
        let state = self.state.lock()?;
        Ok(state.reverse.get(id).cloned().unwrap_or_default())
    }

    /// Every id reachable from `root` through forward edges, `root` excluded.
    pub fn reachable_from(&self, root: &Puuid) -> Result<BTreeSet<Puuid>> {
        let state = self.state.lock()?;
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(targets) = state.forward.get(&current) {
                for target in targets {
                    if target != root && seen.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
            }
        }
        Ok(seen)
    }

    pub fn is_reachable(&self, roots: &[Puuid], target: &Puuid) -> Result<bool> {
        for root in roots {
            if root == target || self.reachable_from(root)?.contains(target) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn edge_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.forward.values().map(BTreeSet::len).sum())
            .unwrap_or_default()
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.forward.clear();
        state.reverse.clear();
        Ok(())
    }
}
