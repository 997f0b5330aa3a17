//! Per-instance binding state and the reverse dependency index.
//!
//! Every (binding, node) pair has a [`BindingState`]. Evaluated states record
//! the dependencies of their last evaluation; the table mirrors the node
//! dependencies into a node → states index so a value change finds the
//! states to invalidate without scanning.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use super::binding::BindingId;
use crate::expr::Dependencies;
use crate::model::{Document, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub binding: BindingId,
    pub node: NodeId,
}

impl StateKey {
    pub fn new(binding: BindingId, node: NodeId) -> Self {
        Self { binding, node }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Flag(bool),
    Text(String),
    /// Evaluation failed; the neutral result applies.
    Broken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Unevaluated,
    Evaluated(Outcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingState {
    pub status: Status,
    /// Outcome before the last invalidation, used for change detection.
    pub previous: Option<Outcome>,
    pub deps: Dependencies,
    /// Table clock at the last evaluation.
    pub stamp: u64,
}

impl BindingState {
    fn new() -> Self {
        Self {
            status: Status::Unevaluated,
            previous: None,
            deps: Dependencies::default(),
            stamp: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.status == Status::Unevaluated
    }

    /// Current outcome, or the last known one while dirty.
    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.status {
            Status::Evaluated(outcome) => Some(outcome),
            Status::Unevaluated => self.previous.as_ref(),
        }
    }

    pub fn flag(&self) -> Option<bool> {
        match self.outcome() {
            Some(Outcome::Flag(flag)) => Some(*flag),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StateTable {
    states: HashMap<StateKey, BindingState>,
    /// node → states whose last evaluation read the node
    dependents: HashMap<NodeId, HashSet<StateKey>>,
    /// bound node → its states
    by_node: HashMap<NodeId, Vec<StateKey>>,
    clock: u64,
}

impl StateTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates an unevaluated state. Returns `false` if it already existed.
    pub fn ensure(&mut self, key: StateKey) -> bool {
        if self.states.contains_key(&key) {
            return false;
        }
        self.states.insert(key, BindingState::new());
        self.by_node.entry(key.node).or_default().push(key);
        true
    }

    pub fn get(&self, key: &StateKey) -> Option<&BindingState> {
        self.states.get(key)
    }

    pub fn keys_for_node(&self, node: NodeId) -> &[StateKey] {
        self.by_node.get(&node).map(|k| k.as_slice()).unwrap_or(&[])
    }

    pub fn bound_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_node.keys().copied()
    }

    /// Advances with every recorded evaluation.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn dependents_of(&self, node: NodeId) -> Vec<StateKey> {
        self.dependents
            .get(&node)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn dirty_keys(&self) -> Vec<StateKey> {
        self.states
            .iter()
            .filter(|(_, s)| s.is_dirty())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Stores an evaluation result and replaces the node dependencies of
    /// `key` in the reverse index.
    pub fn record(&mut self, key: StateKey, outcome: Outcome, deps: Dependencies) {
        let Some(state) = self.states.get_mut(&key) else {
            return;
        };
        for node in &state.deps.nodes {
            if let Some(set) = self.dependents.get_mut(node) {
                set.remove(&key);
                if set.is_empty() {
                    self.dependents.remove(node);
                }
            }
        }
        for node in &deps.nodes {
            self.dependents.entry(*node).or_default().insert(key);
        }
        self.clock += 1;
        state.deps = deps;
        state.status = Status::Evaluated(outcome);
        state.stamp = self.clock;
    }

    /// Returns an evaluated state to `Unevaluated`.
    pub fn invalidate(&mut self, key: &StateKey) -> bool {
        let Some(state) = self.states.get_mut(key) else {
            return false;
        };
        match std::mem::replace(&mut state.status, Status::Unevaluated) {
            Status::Evaluated(outcome) => {
                state.previous = Some(outcome);
                true
            }
            Status::Unevaluated => false,
        }
    }

    pub fn invalidate_all(&mut self) -> usize {
        let keys: Vec<StateKey> = self.states.keys().copied().collect();
        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    /// Invalidates every state that read `node`. With `written_at`, states
    /// evaluated after that clock value already saw the write and are kept.
    pub fn invalidate_dependents_of(&mut self, node: NodeId, written_at: Option<u64>) -> usize {
        let keys: Vec<StateKey> = self
            .dependents_of(node)
            .into_iter()
            .filter(|k| match (written_at, self.states.get(k)) {
                (Some(at), Some(state)) => state.stamp <= at,
                _ => true,
            })
            .collect();
        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    pub fn invalidate_where(&mut self, predicate: impl Fn(&StateKey, &BindingState) -> bool) -> usize {
        let keys: Vec<StateKey> = self
            .states
            .iter()
            .filter(|(k, s)| !s.is_dirty() && predicate(k, s))
            .map(|(k, _)| *k)
            .collect();
        keys.iter().filter(|k| self.invalidate(k)).count()
    }

    /// Drops states of nodes no longer in the primary instance.
    pub fn discard_detached(&mut self, doc: &Document) -> usize {
        let detached: Vec<NodeId> = self
            .by_node
            .keys()
            .copied()
            .filter(|n| !doc.is_attached(*n))
            .collect();
        let mut dropped = 0;
        for node in detached {
            for key in self.by_node.remove(&node).unwrap_or_default() {
                if let Some(state) = self.states.remove(&key) {
                    for dep in &state.deps.nodes {
                        if let Some(set) = self.dependents.get_mut(dep) {
                            set.remove(&key);
                        }
                    }
                    dropped += 1;
                }
            }
        }
        self.dependents.retain(|node, keys| !keys.is_empty() && doc.is_attached(*node));
        if dropped > 0 {
            trace!(dropped, "discarded detached binding states");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(nodes: &[NodeId]) -> Dependencies {
        Dependencies {
            nodes: nodes.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_replaces_reverse_edges() {
        let mut table = StateTable::new();
        let key = StateKey::new(BindingId(0), NodeId(5));
        assert!(table.ensure(key));
        assert!(!table.ensure(key));

        table.record(key, Outcome::Text("1".into()), deps(&[NodeId(1), NodeId(2)]));
        assert_eq!(table.invalidate_dependents_of(NodeId(1), None), 1);
        assert_eq!(table.get(&key).unwrap().outcome(), Some(&Outcome::Text("1".into())));

        table.record(key, Outcome::Text("2".into()), deps(&[NodeId(3)]));
        assert_eq!(table.invalidate_dependents_of(NodeId(1), None), 0);
        assert_eq!(table.invalidate_dependents_of(NodeId(3), None), 1);
        assert_eq!(table.get(&key).unwrap().previous, Some(Outcome::Text("2".into())));
    }

    #[test]
    fn test_states_evaluated_after_a_write_are_kept() {
        let mut table = StateTable::new();
        let early = StateKey::new(BindingId(0), NodeId(1));
        let late = StateKey::new(BindingId(1), NodeId(2));
        table.ensure(early);
        table.ensure(late);
        table.record(early, Outcome::Flag(true), deps(&[NodeId(9)]));
        let written_at = table.clock();
        table.record(late, Outcome::Flag(true), deps(&[NodeId(9)]));

        assert_eq!(table.invalidate_dependents_of(NodeId(9), Some(written_at)), 1);
        assert!(table.get(&early).unwrap().is_dirty());
        assert!(!table.get(&late).unwrap().is_dirty());
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let mut table = StateTable::new();
        let key = StateKey::new(BindingId(1), NodeId(7));
        table.ensure(key);
        assert!(!table.invalidate(&key));
        table.record(key, Outcome::Flag(false), Dependencies::default());
        assert!(table.invalidate(&key));
        assert!(!table.invalidate(&key));
        assert_eq!(table.get(&key).unwrap().flag(), Some(false));
        assert_eq!(table.dirty_keys(), vec![key]);
    }

    #[test]
    fn test_discard_detached() {
        let mut doc = Document::from_xml("<data><a/><b/></data>").unwrap();
        let a = doc.get_node("/data/a", 0).unwrap();
        let b = doc.get_node("/data/b", 0).unwrap();
        let mut table = StateTable::new();
        let ka = StateKey::new(BindingId(0), a);
        let kb = StateKey::new(BindingId(0), b);
        table.ensure(ka);
        table.ensure(kb);
        table.record(kb, Outcome::Flag(true), deps(&[a]));

        doc.remove_subtree(a);
        assert_eq!(table.discard_detached(&doc), 1);
        assert_eq!(table.len(), 1);
        assert!(table.keys_for_node(a).is_empty());
        assert_eq!(table.keys_for_node(b), &[kb]);
    }
}
