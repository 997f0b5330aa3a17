//! # Evaluation Cascade
//!
//! Keeps every derived property of a form (calculated values, relevance,
//! requiredness, read-only state, constraint validity) consistent with the
//! document after a change, re-evaluating only what the change can affect.
//!
//! ## Rounds
//!
//! A round takes a [`ChangeSet`], invalidates the binding states that read a
//! changed node or enumerated a changed series, and evaluates the dirty
//! states tier by tier:
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌──────────────────────────────┐
//! │ relevance │──▶│ calculation │──▶│ required / readonly / valid  │
//! └───────────┘   └─────────────┘   └──────────────────────────────┘
//! ```
//!
//! Calculations run in dependency order. A relevance binding that reads a
//! calculated node is evaluated again in that order, after the calculation
//! and before anything in its subtree. Values written become the change set
//! of the next round. [`Form`](crate::Form) drives rounds until
//! nothing changes or the configured depth is reached.
//!
//! Bindings of nodes that are not relevant are not evaluated. They stay
//! dirty and run once the node becomes relevant again.

pub mod binding;
pub mod scheduler;
pub mod state;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

pub use binding::{Binding, BindingCatalogue, BindingId, BindingKind};
pub use scheduler::{ChangeSet, DeferredQueue, SchedulingPolicy};
pub use state::{BindingState, Outcome, StateKey, StateTable, Status};

use crate::event::{ChangeEvent, ChangeKind, EventBus};
use crate::expr::{Dependencies, Expr, ExprResult, ExpressionEvaluator, ResultType, XPathValue};
use crate::model::{Document, ModelResult, NodeId};
use crate::resolver::PathResolver;

/// Something the cascade could not do cleanly. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CascadeDiagnostic {
    /// Calculations that depend on each other; evaluated in document order.
    Cycle { paths: Vec<String> },
    /// Changes were still pending after the maximum number of rounds.
    DepthExceeded { rounds: usize },
    /// A binding failed to evaluate and fell back to its neutral result.
    BrokenBinding {
        path: String,
        kind: String,
        message: String,
    },
    /// A repeat count asked for more instances than the configured limit.
    RepeatCountClamped {
        path: String,
        requested: i64,
        limit: usize,
    },
}

/// Mutable view of the form that rounds work against. All document writes
/// made during a round go through [`CascadeEnv::write_value`], which records
/// the change and publishes the event.
pub struct CascadeEnv<'a> {
    pub doc: &'a mut Document,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub resolver: &'a PathResolver,
    pub bus: &'a EventBus,
    pub changes: ChangeSet,
}

impl<'a> CascadeEnv<'a> {
    pub fn new(
        doc: &'a mut Document,
        evaluator: &'a dyn ExpressionEvaluator,
        resolver: &'a PathResolver,
        bus: &'a EventBus,
    ) -> Self {
        Self {
            doc,
            evaluator,
            resolver,
            bus,
            changes: ChangeSet::default(),
        }
    }

    /// Writes a leaf value. A changed value is recorded for the next round
    /// and announced.
    pub fn write_value(&mut self, node: NodeId, value: &str) -> ModelResult<bool> {
        let changed = self.doc.set_value(node, value)?;
        if changed {
            self.changes.values.insert(node);
            self.notify(node, ChangeKind::Value);
        }
        Ok(changed)
    }

    pub fn notify(&self, node: NodeId, kind: ChangeKind) {
        let resolver = self.resolver;
        self.bus.publish(ChangeEvent::for_node(self.doc, node, kind, |p| {
            resolver.is_series(p)
        }));
    }

    /// Resolves `prepared` for `context` and evaluates it.
    pub fn evaluate(
        &self,
        prepared: &Expr,
        result_type: ResultType,
        context: NodeId,
    ) -> ExprResult<(XPathValue, Dependencies)> {
        let concrete = self.resolver.resolve(self.doc, prepared, context);
        self.evaluator
            .evaluate(self.doc, &concrete.expr, result_type, context)
    }

    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }
}

/// Counters for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub invalidated: usize,
    pub evaluated: usize,
    /// Dirty states left alone because their node is not relevant.
    pub skipped: usize,
}

#[derive(Debug)]
pub struct Cascade {
    catalogue: BindingCatalogue,
    states: StateTable,
    /// Effective relevance of relevance-bound nodes at the end of the last round.
    relevance: HashMap<NodeId, bool>,
    /// Clock value at each calculated write of the current round.
    written: HashMap<NodeId, u64>,
    diagnostics: Vec<CascadeDiagnostic>,
}

impl Cascade {
    pub fn new(catalogue: BindingCatalogue) -> Self {
        Self {
            catalogue,
            states: StateTable::new(),
            relevance: HashMap::new(),
            written: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn catalogue(&self) -> &BindingCatalogue {
        &self.catalogue
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn diagnostics(&self) -> &[CascadeDiagnostic] {
        &self.diagnostics
    }

    pub fn push_diagnostic(&mut self, diagnostic: CascadeDiagnostic) {
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }

    /// Invalidates what `changes` can affect and evaluates the dirty states.
    #[instrument(level = "debug", skip_all, fields(values = changes.values.len(), structures = changes.structures.len(), full = changes.full))]
    pub fn run_round(&mut self, env: &mut CascadeEnv, changes: &ChangeSet) -> RoundReport {
        let mut report = RoundReport::default();
        if changes.full || !changes.structures.is_empty() {
            self.states.discard_detached(env.doc);
            self.relevance.retain(|node, _| env.doc.is_attached(*node));
            self.materialize(env.doc);
        }
        report.invalidated = self.invalidate(env.doc, changes);

        self.run_relevance(env, &mut report);
        self.run_calculations(env, &mut report);
        for kind in [
            BindingKind::Required,
            BindingKind::Readonly,
            BindingKind::Constraint,
        ] {
            self.run_derived(env, kind, &mut report);
        }
        debug!(
            invalidated = report.invalidated,
            evaluated = report.evaluated,
            skipped = report.skipped,
            "cascade round finished"
        );
        report
    }

    /// Creates states for bound nodes that have none yet.
    fn materialize(&mut self, doc: &Document) {
        let mut created = 0;
        for binding in self.catalogue.iter() {
            for node in doc.nodes_at_path(&binding.path) {
                if self.states.ensure(StateKey::new(binding.id, node)) {
                    created += 1;
                }
            }
        }
        trace!(created, "binding states materialized");
    }

    fn invalidate(&mut self, doc: &Document, changes: &ChangeSet) -> usize {
        let written = std::mem::take(&mut self.written);
        if changes.full {
            return self.states.invalidate_all();
        }
        let mut count = 0;
        // A changed leaf also changes the string-value of its ancestors.
        // External writes (no clock value) invalidate every reader.
        let mut touched: BTreeMap<NodeId, Option<u64>> = BTreeMap::new();
        for node in &changes.values {
            let at = written.get(node).copied();
            for member in std::iter::once(*node).chain(doc.ancestors(*node)) {
                let entry = touched.entry(member).or_insert(at);
                *entry = match (*entry, at) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
        }
        for (node, at) in touched {
            count += self.states.invalidate_dependents_of(node, at);
        }
        if !changes.structures.is_empty() {
            count += self.states.invalidate_where(|_, state| {
                changes
                    .structures
                    .iter()
                    .any(|series| state.deps.touches_structure(series))
            });
        }
        count
    }

    /// Dirty states of `kind`, in document order.
    fn pending(&self, doc: &Document, kind: BindingKind) -> Vec<StateKey> {
        let mut keys: Vec<(Vec<usize>, StateKey)> = self
            .states
            .dirty_keys()
            .into_iter()
            .filter(|k| self.catalogue.get(k.binding).kind == kind && doc.is_attached(k.node))
            .map(|k| (doc.order_key(k.node), k))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, k)| k).collect()
    }

    fn run_relevance(&mut self, env: &mut CascadeEnv, report: &mut RoundReport) {
        for key in self.pending(env.doc, BindingKind::Relevant) {
            let flag = self.evaluate_flag(env, key);
            trace!(node = key.node.raw(), flag, "relevance evaluated");
            report.evaluated += 1;
        }

        let nodes: Vec<NodeId> = self
            .states
            .bound_nodes()
            .filter(|n| self.own_relevance(*n).is_some() && env.doc.is_attached(*n))
            .collect();
        self.publish_relevance(env, nodes, report);
    }

    /// Announces relevance flips among `nodes`, in document order.
    fn publish_relevance(
        &mut self,
        env: &mut CascadeEnv,
        mut nodes: Vec<NodeId>,
        report: &mut RoundReport,
    ) {
        nodes.sort_by_key(|n| env.doc.order_key(*n));
        for node in nodes {
            let now = self.is_relevant(env.doc, node);
            let before = self.relevance.insert(node, now).unwrap_or(true);
            if before == now {
                continue;
            }
            debug!(node = node.raw(), relevant = now, "relevance flipped");
            env.notify(node, ChangeKind::Relevance);
            if now {
                // Everything below was skipped while hidden; run it once.
                let subtree = env.doc.descendants_or_self(node);
                for member in subtree {
                    let keys: Vec<StateKey> = self.states.keys_for_node(member).to_vec();
                    for key in keys {
                        if self.catalogue.get(key.binding).kind != BindingKind::Relevant
                            && self.states.invalidate(&key)
                        {
                            report.invalidated += 1;
                        }
                    }
                }
            }
        }
    }

    /// Evaluates the dirty calculations together with the relevance bindings
    /// that read them. A relevance binding runs after the calculations it
    /// reads and before the calculations in its subtree, so a calculation is
    /// never run under a node that this round makes non-relevant.
    #[instrument(level = "debug", skip_all)]
    fn run_calculations(&mut self, env: &mut CascadeEnv, report: &mut RoundReport) {
        self.mark_downstream(env.doc);
        let mut pending = self.pending(env.doc, BindingKind::Calculate);
        if pending.is_empty() {
            return;
        }
        let gates = self.pending(env.doc, BindingKind::Relevant);
        let gate_of: HashMap<NodeId, StateKey> = gates.iter().map(|k| (k.node, *k)).collect();
        pending.extend(gates);

        // Kahn's algorithm: an edge runs from the calculation writing a node
        // to every binding that read it, and from a relevance binding to the
        // calculations at or below its node.
        let writers: HashMap<NodeId, StateKey> = pending
            .iter()
            .filter(|k| self.catalogue.get(k.binding).kind == BindingKind::Calculate)
            .map(|k| (k.node, *k))
            .collect();
        let mut in_degree: HashMap<StateKey, usize> = pending.iter().map(|k| (*k, 0)).collect();
        let mut edges: HashMap<StateKey, Vec<StateKey>> = HashMap::new();
        let mut link = |from: StateKey, to: StateKey| {
            if from != to {
                edges.entry(from).or_default().push(to);
                *in_degree.entry(to).or_default() += 1;
            }
        };
        for key in &pending {
            if let Some(state) = self.states.get(key) {
                for node in &state.deps.nodes {
                    if let Some(writer) = writers.get(node) {
                        link(*writer, *key);
                    }
                }
            }
            if self.catalogue.get(key.binding).kind == BindingKind::Calculate {
                for member in std::iter::once(key.node).chain(env.doc.ancestors(key.node)) {
                    if let Some(gate) = gate_of.get(&member) {
                        link(*gate, *key);
                    }
                }
            }
        }

        let order: HashMap<StateKey, Vec<usize>> = pending
            .iter()
            .map(|k| (*k, env.doc.order_key(k.node)))
            .collect();
        let mut ready: BTreeSet<(Vec<usize>, StateKey)> = pending
            .iter()
            .filter(|k| in_degree.get(*k) == Some(&0))
            .map(|k| (order[k].clone(), *k))
            .collect();
        let mut done = 0;
        while let Some((_, key)) = ready.pop_first() {
            self.run_ordered(env, key, report);
            done += 1;
            for dependent in edges.get(&key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((order[dependent].clone(), *dependent));
                    }
                }
            }
        }

        if done < pending.len() {
            let mut cyclic: Vec<(Vec<usize>, StateKey)> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(k, _)| (order[k].clone(), *k))
                .collect();
            cyclic.sort();
            let paths: BTreeSet<String> = cyclic
                .iter()
                .map(|(_, k)| self.catalogue.get(k.binding).path.clone())
                .collect();
            warn!(?paths, "circular calculations; evaluating in document order");
            self.push_diagnostic(CascadeDiagnostic::Cycle {
                paths: paths.into_iter().collect(),
            });
            for (_, key) in cyclic {
                self.run_ordered(env, key, report);
            }
        }
    }

    /// One step of the calculation order: a relevance binding is evaluated
    /// and its flips announced; a calculation runs only if its node is
    /// relevant at this point.
    fn run_ordered(&mut self, env: &mut CascadeEnv, key: StateKey, report: &mut RoundReport) {
        if self.catalogue.get(key.binding).kind == BindingKind::Relevant {
            let flag = self.evaluate_flag(env, key);
            trace!(node = key.node.raw(), flag, "relevance re-evaluated");
            report.evaluated += 1;
            let nodes: Vec<NodeId> = env
                .doc
                .descendants_or_self(key.node)
                .into_iter()
                .filter(|n| self.own_relevance(*n).is_some())
                .collect();
            self.publish_relevance(env, nodes, report);
        } else if self.is_relevant(env.doc, key.node) {
            self.evaluate_calculation(env, key);
            report.evaluated += 1;
        } else {
            report.skipped += 1;
        }
    }

    /// Dirties every calculation and relevance binding that reads the node of
    /// a dirty relevant calculation, transitively, so a chain settles within
    /// one round.
    fn mark_downstream(&mut self, doc: &Document) {
        let mut frontier: Vec<NodeId> = self
            .pending(doc, BindingKind::Calculate)
            .into_iter()
            .filter(|k| self.is_relevant(doc, k.node))
            .map(|k| k.node)
            .collect();
        while let Some(node) = frontier.pop() {
            for key in self.states.dependents_of(node) {
                match self.catalogue.get(key.binding).kind {
                    BindingKind::Calculate => {
                        if self.states.invalidate(&key) {
                            frontier.push(key.node);
                        }
                    }
                    BindingKind::Relevant => {
                        self.states.invalidate(&key);
                    }
                    _ => {}
                }
            }
        }
    }

    fn evaluate_calculation(&mut self, env: &mut CascadeEnv, key: StateKey) {
        let binding = self.catalogue.get(key.binding);
        let result = match &binding.expr {
            Ok(expr) => env.evaluate(expr, ResultType::String, key.node),
            Err(e) => Err(e.clone()),
        };
        let (value, deps) = match result {
            Ok(evaluated) => evaluated,
            Err(e) => {
                let diagnostic = broken(binding, &e.to_string());
                warn!(path = %binding.path, error = %e, "calculation failed");
                self.push_diagnostic(diagnostic);
                self.states.record(key, Outcome::Broken, Dependencies::default());
                return;
            }
        };
        let raw = value.as_str().unwrap_or_default();
        let coerced = self.catalogue.data_type(&binding.path).coerce(raw);
        match env.write_value(key.node, &coerced) {
            Ok(true) => {
                self.written.insert(key.node, self.states.clock());
            }
            Ok(false) => {}
            Err(e) => warn!(path = %binding.path, error = %e, "calculated value not written"),
        }
        self.states.record(key, Outcome::Text(coerced), deps);
    }

    fn run_derived(&mut self, env: &mut CascadeEnv, kind: BindingKind, report: &mut RoundReport) {
        let event = match kind {
            BindingKind::Required => ChangeKind::Requiredness,
            BindingKind::Readonly => ChangeKind::Readonly,
            _ => ChangeKind::Validity,
        };
        for key in self.pending(env.doc, kind) {
            if !self.is_relevant(env.doc, key.node) {
                report.skipped += 1;
                continue;
            }
            let before = self
                .states
                .get(&key)
                .and_then(|s| s.flag())
                .unwrap_or(kind.neutral());
            let now = self.evaluate_flag(env, key);
            report.evaluated += 1;
            if before != now {
                env.notify(key.node, event);
            }
        }
    }

    /// Evaluates a boolean binding and records it. Failures yield the
    /// neutral result.
    fn evaluate_flag(&mut self, env: &CascadeEnv, key: StateKey) -> bool {
        let binding = self.catalogue.get(key.binding);
        let result = match &binding.expr {
            Ok(expr) => env.evaluate(expr, ResultType::Boolean, key.node),
            Err(e) => Err(e.clone()),
        };
        match result {
            Ok((value, deps)) => {
                let flag = value.as_bool().unwrap_or(binding.kind.neutral());
                self.states.record(key, Outcome::Flag(flag), deps);
                flag
            }
            Err(e) => {
                let neutral = binding.kind.neutral();
                let diagnostic = broken(binding, &e.to_string());
                warn!(path = %binding.path, kind = %binding.kind, error = %e, "binding failed");
                self.push_diagnostic(diagnostic);
                self.states.record(key, Outcome::Flag(neutral), Dependencies::default());
                neutral
            }
        }
    }

    fn flag_of(&self, node: NodeId, kind: BindingKind) -> Option<bool> {
        self.states
            .keys_for_node(node)
            .iter()
            .find(|k| self.catalogue.get(k.binding).kind == kind)
            .and_then(|k| self.states.get(k))
            .and_then(|s| s.flag())
    }

    /// The node's own relevance result, ignoring ancestors.
    pub fn own_relevance(&self, node: NodeId) -> Option<bool> {
        self.flag_of(node, BindingKind::Relevant)
    }

    /// A node is relevant when neither it nor any ancestor evaluated to
    /// non-relevant.
    pub fn is_relevant(&self, doc: &Document, node: NodeId) -> bool {
        if self.own_relevance(node) == Some(false) {
            return false;
        }
        doc.ancestors(node)
            .into_iter()
            .all(|a| self.own_relevance(a) != Some(false))
    }

    pub fn is_required(&self, node: NodeId) -> bool {
        self.flag_of(node, BindingKind::Required).unwrap_or(false)
    }

    /// Read-only state is inherited from ancestors.
    pub fn is_readonly(&self, doc: &Document, node: NodeId) -> bool {
        if self.flag_of(node, BindingKind::Readonly) == Some(true) {
            return true;
        }
        doc.ancestors(node)
            .into_iter()
            .any(|a| self.flag_of(a, BindingKind::Readonly) == Some(true))
    }

    pub fn constraint_holds(&self, node: NodeId) -> bool {
        self.flag_of(node, BindingKind::Constraint).unwrap_or(true)
    }
}

fn broken(binding: &Binding, message: &str) -> CascadeDiagnostic {
    CascadeDiagnostic::BrokenBinding {
        path: binding.path.clone(),
        kind: binding.kind.to_string(),
        message: message.to_string(),
    }
}
