//! Change sets and the deferred queue used by batched scheduling.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::model::NodeId;

/// When the cascade runs after an external change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SchedulingPolicy {
    /// Every mutation settles the cascade before returning.
    #[default]
    Synchronous,
    /// Mutations are queued until [`Form::flush`](crate::Form::flush).
    Batched,
}

/// Inputs of one cascade round: leaves whose value changed and repeat series
/// whose instance list changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub values: BTreeSet<NodeId>,
    pub structures: BTreeSet<String>,
    /// Every binding is re-evaluated.
    pub full: bool,
}

impl ChangeSet {
    pub fn everything() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn value(node: NodeId) -> Self {
        let mut changes = Self::default();
        changes.values.insert(node);
        changes
    }

    pub fn structure(series: impl Into<String>) -> Self {
        let mut changes = Self::default();
        changes.structures.insert(series.into());
        changes
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.values.extend(other.values);
        self.structures.extend(other.structures);
        self.full |= other.full;
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.structures.is_empty() && !self.full
    }
}

/// Pending work accumulated between flushes.
///
/// Each queued value change carries the generation of its node at enqueue
/// time. A later change to the same node bumps the generation, so the
/// earlier entry is recognised as superseded and dropped at drain time.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: Vec<(NodeId, u64)>,
    generations: HashMap<NodeId, u64>,
    structures: BTreeSet<String>,
    full: bool,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push_value(&mut self, node: NodeId) {
        let generation = self.generations.entry(node).or_insert(0);
        *generation += 1;
        self.entries.push((node, *generation));
    }

    pub fn push_structure(&mut self, series: impl Into<String>) {
        self.structures.insert(series.into());
    }

    pub fn push_full(&mut self) {
        self.full = true;
    }

    pub fn push(&mut self, changes: ChangeSet) {
        for node in changes.values {
            self.push_value(node);
        }
        self.structures.extend(changes.structures);
        self.full |= changes.full;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.structures.is_empty() && !self.full
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.structures.len()
    }

    /// Takes every live entry, dropping superseded ones.
    pub fn drain(&mut self) -> ChangeSet {
        let mut changes = ChangeSet {
            full: self.full,
            structures: std::mem::take(&mut self.structures),
            ..Default::default()
        };
        let mut superseded = 0usize;
        for (node, generation) in self.entries.drain(..) {
            if self.generations.get(&node) == Some(&generation) {
                changes.values.insert(node);
            } else {
                superseded += 1;
            }
        }
        trace!(
            values = changes.values.len(),
            superseded,
            structures = changes.structures.len(),
            "deferred queue drained"
        );
        self.generations.clear();
        self.full = false;
        changes
    }
}
