//! # Dynamic Choice Lists
//!
//! A select node may draw its options from a nodeset (usually a secondary
//! instance filtered by answers elsewhere in the form). The synchronizer
//! rebuilds an option list only when the nodeset's dependencies changed and
//! the resulting list differs from the previous one, then drops selections
//! that are no longer offered.
//!
//! Lists that read only a secondary instance with constant predicates are
//! identical for every node and are computed once.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use crate::cascade::{Cascade, CascadeEnv, ChangeSet};
use crate::definition::ItemsetDef;
use crate::event::ChangeKind;
use crate::expr::{parse_expression, Dependencies, Expr, ExprError, NodeRef, ResultType};
use crate::model::{Document, NodeId};
use crate::resolver::PathResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug)]
struct ItemsetBinding {
    def: ItemsetDef,
    nodeset: Result<Expr, ExprError>,
    value: Result<Expr, ExprError>,
    label: Result<Expr, ExprError>,
    is_static: bool,
}

impl ItemsetBinding {
    fn new(def: &ItemsetDef, resolver: &PathResolver) -> Self {
        let prepare = |source: &str| parse_expression(source).map(|e| resolver.prepare(e));
        let nodeset = prepare(&def.nodeset);
        let is_static = nodeset.as_ref().map(is_static).unwrap_or(false);
        let binding = Self {
            def: def.clone(),
            nodeset,
            value: prepare(&def.value_ref),
            label: prepare(&def.label_ref),
            is_static,
        };
        for (what, result) in [
            ("nodeset", &binding.nodeset),
            ("value", &binding.value),
            ("label", &binding.label),
        ] {
            if let Err(e) = result {
                warn!(path = %def.path, what, error = %e, "itemset expression does not parse");
            }
        }
        binding
    }

    fn cache_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.def.nodeset, self.def.value_ref, self.def.label_ref
        )
    }
}

/// A nodeset is static when it starts at `instance('id')` and every
/// predicate is a constant position.
fn is_static(expr: &Expr) -> bool {
    let Expr::Filter {
        primary,
        predicates,
        steps,
    } = expr
    else {
        return false;
    };
    let rooted_at_instance = matches!(
        primary.as_ref(),
        Expr::FunctionCall { name, args } if name == "instance" && matches!(args.as_slice(), [Expr::Literal(_)])
    );
    rooted_at_instance
        && predicates.iter().all(|p| matches!(p, Expr::Number(_)))
        && steps
            .iter()
            .flat_map(|s| s.predicates.iter())
            .all(|p| matches!(p, Expr::Number(_)))
}

#[derive(Debug, Default)]
struct ItemsetState {
    /// Count and concatenated text of the last option list.
    fingerprint: Option<(usize, String)>,
    options: Vec<ItemOption>,
    deps: Dependencies,
    dirty: bool,
}

#[derive(Debug)]
pub struct ItemsetSynchronizer {
    bindings: Vec<ItemsetBinding>,
    states: HashMap<(usize, NodeId), ItemsetState>,
    cache: HashMap<String, Vec<ItemOption>>,
    cache_enabled: bool,
}

impl ItemsetSynchronizer {
    pub fn new(defs: &[ItemsetDef], resolver: &PathResolver, cache_enabled: bool) -> Self {
        Self {
            bindings: defs.iter().map(|d| ItemsetBinding::new(d, resolver)).collect(),
            states: HashMap::new(),
            cache: HashMap::new(),
            cache_enabled,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Current options of the select node `node`.
    pub fn options(&self, node: NodeId) -> Option<&[ItemOption]> {
        self.states
            .iter()
            .find(|((_, n), state)| *n == node && state.fingerprint.is_some())
            .map(|(_, state)| state.options.as_slice())
    }

    /// Brings option lists up to date with `changes`. Returns how many lists
    /// were rebuilt with different content.
    #[instrument(level = "debug", skip_all)]
    pub fn sync(&mut self, env: &mut CascadeEnv, cascade: &Cascade, changes: &ChangeSet) -> usize {
        if self.bindings.is_empty() {
            return 0;
        }
        if changes.full || !changes.structures.is_empty() {
            self.materialize(env.doc);
        }
        self.invalidate(env.doc, changes);

        let mut dirty: Vec<(Vec<usize>, (usize, NodeId))> = self
            .states
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(k, _)| (env.doc.order_key(k.1), *k))
            .collect();
        dirty.sort();

        let mut rebuilt = 0;
        for (_, key) in dirty {
            if !cascade.is_relevant(env.doc, key.1) {
                trace!(node = key.1.raw(), "itemset skipped while not relevant");
                continue;
            }
            if self.refresh(env, key) {
                rebuilt += 1;
            }
        }
        rebuilt
    }

    fn materialize(&mut self, doc: &Document) {
        self.states.retain(|(_, node), _| doc.is_attached(*node));
        for (index, binding) in self.bindings.iter().enumerate() {
            for node in doc.nodes_at_path(&binding.def.path) {
                self.states.entry((index, node)).or_insert_with(|| ItemsetState {
                    dirty: true,
                    ..Default::default()
                });
            }
        }
    }

    fn invalidate(&mut self, doc: &Document, changes: &ChangeSet) {
        let mut touched: BTreeSet<NodeId> = BTreeSet::new();
        for node in &changes.values {
            touched.insert(*node);
            touched.extend(doc.ancestors(*node));
        }
        for state in self.states.values_mut().filter(|s| !s.dirty) {
            state.dirty = changes.full
                || state.deps.nodes.iter().any(|n| touched.contains(n))
                || changes
                    .structures
                    .iter()
                    .any(|series| state.deps.touches_structure(series));
        }
    }

    /// Rebuilds one list. Returns true when its content changed.
    fn refresh(&mut self, env: &mut CascadeEnv, key: (usize, NodeId)) -> bool {
        let (index, node) = key;
        let binding = &self.bindings[index];
        let cache_key = binding.cache_key();
        let cached = if binding.is_static && self.cache_enabled {
            self.cache.get(&cache_key).cloned()
        } else {
            None
        };
        let (options, deps) = match cached {
            Some(options) => (options, Dependencies::default()),
            None => {
                let (options, deps) = build_options(env, binding, node);
                if binding.is_static && self.cache_enabled {
                    self.cache.insert(cache_key, options.clone());
                }
                (options, deps)
            }
        };
        let multiple = binding.def.multiple;

        let fingerprint = fingerprint(&options);
        let Some(state) = self.states.get_mut(&key) else {
            return false;
        };
        state.deps = deps;
        state.dirty = false;
        if state.fingerprint.as_ref() == Some(&fingerprint) {
            return false;
        }
        let first = state.fingerprint.is_none();
        state.fingerprint = Some(fingerprint);
        state.options = options;
        if first {
            return false;
        }

        debug!(node = node.raw(), count = state.options.len(), "itemset rebuilt");
        env.notify(node, ChangeKind::Itemset);
        let current = env.doc.text(node).to_string();
        let kept = reconcile(&current, &state.options, multiple);
        if kept != current {
            if let Err(e) = env.write_value(node, &kept) {
                warn!(node = node.raw(), error = %e, "selection not cleared");
            }
        }
        true
    }
}

fn build_options(
    env: &CascadeEnv,
    binding: &ItemsetBinding,
    node: NodeId,
) -> (Vec<ItemOption>, Dependencies) {
    let mut deps = Dependencies::default();
    let nodeset = match &binding.nodeset {
        Ok(expr) => expr,
        Err(_) => return (Vec::new(), deps),
    };
    let items = match env.evaluate(nodeset, ResultType::Nodes, node) {
        Ok((value, d)) => {
            deps.merge(d);
            value.into_nodes()
        }
        Err(e) => {
            warn!(path = %binding.def.path, error = %e, "itemset nodeset failed");
            return (Vec::new(), deps);
        }
    };
    let mut options = Vec::with_capacity(items.len());
    for item in items.into_iter().filter_map(|r| match r {
        NodeRef::Element(id) => Some(id),
        _ => None,
    }) {
        let mut text = |expr: &Result<Expr, ExprError>| -> String {
            let Ok(expr) = expr else {
                return String::new();
            };
            match env.evaluator.evaluate(env.doc, expr, ResultType::String, item) {
                Ok((value, d)) => {
                    deps.merge(d);
                    value.as_str().unwrap_or_default().to_string()
                }
                Err(e) => {
                    trace!(error = %e, "itemset item text failed");
                    String::new()
                }
            }
        };
        let value = text(&binding.value);
        let label = text(&binding.label);
        options.push(ItemOption { value, label });
    }
    (options, deps)
}

fn fingerprint(options: &[ItemOption]) -> (usize, String) {
    let mut text = String::new();
    for option in options {
        text.push_str(&option.value);
        text.push('\u{1f}');
        text.push_str(&option.label);
        text.push('\u{1e}');
    }
    (options.len(), text)
}

/// Keeps only the selected values still offered.
fn reconcile(current: &str, options: &[ItemOption], multiple: bool) -> String {
    let offered = |v: &str| options.iter().any(|o| o.value == v);
    if multiple {
        current
            .split_whitespace()
            .filter(|v| offered(v))
            .collect::<Vec<_>>()
            .join(" ")
    } else if current.is_empty() || offered(current) {
        current.to_string()
    } else {
        String::new()
    }
}
