//! # Repeat Lifecycle
//!
//! A repeat series is a run of same-named siblings cloned from a template.
//! [`RepeatManager`] owns the templates (detached subtrees in the document
//! arena), creates and removes instances, and maintains ordinals:
//! `enk:ordinal` on every instance and `enk:last-used-ordinal` on the first
//! instance of each run. Ordinals are never renumbered or reused.
//!
//! The manager only edits structure. Publishing change events and running
//! the cascade is left to [`Form`](crate::Form), which is the only caller.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::definition::RepeatDef;
use crate::model::{
    last_used_ordinal_attr, ordinal_attr, template_attr, Document, NodeId, QName,
    ORDINAL_NAMESPACE, ORDINAL_PREFIX,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepeatError {
    #[error("Not a repeat series: {path}")]
    NotARepeat { path: String },
    #[error("Repeat series {path} has no template")]
    MissingTemplate { path: String },
    #[error("Repeat series {path} has no parent node to insert into")]
    NoParent { path: String },
}

pub type RepeatResult<T> = Result<T, RepeatError>;

#[derive(Debug, Clone)]
struct Series {
    template: Option<NodeId>,
    count: Option<String>,
}

/// Result of removing one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: NodeId,
    /// Empty instance created because the removed one was the last of its run.
    pub replacement: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct RepeatManager {
    series: BTreeMap<String, Series>,
    ordinals: bool,
}

impl RepeatManager {
    pub fn new(ordinals: bool) -> Self {
        Self {
            series: BTreeMap::new(),
            ordinals,
        }
    }

    /// Registers the series, extracts templates and drops `jr:template`
    /// markers from the primary instance.
    #[instrument(level = "debug", skip(self, doc, defs))]
    pub fn initialize(&mut self, doc: &mut Document, defs: &[RepeatDef]) {
        for def in defs {
            self.series.insert(
                def.path.clone(),
                Series {
                    template: None,
                    count: def.count.clone(),
                },
            );
        }

        let mut deepest_first: Vec<String> = self.series.keys().cloned().collect();
        deepest_first.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for path in &deepest_first {
            let template = self.build_template(doc, path);
            if template.is_none() {
                warn!(path, "repeat series has no instance to derive a template from");
            }
            if let Some(series) = self.series.get_mut(path) {
                series.template = template;
            }
        }

        for path in &deepest_first {
            for marked in doc.nodes_at_path(path) {
                if doc.attribute(marked, &template_attr()).is_none() {
                    continue;
                }
                let has_real_sibling = doc
                    .same_name_siblings(marked)
                    .iter()
                    .any(|s| doc.attribute(*s, &template_attr()).is_none());
                if has_real_sibling {
                    doc.remove_subtree(marked);
                } else {
                    doc.remove_attribute(marked, &template_attr());
                }
            }
        }

        if self.ordinals {
            self.initialize_ordinals(doc);
        }
    }

    fn build_template(&self, doc: &mut Document, path: &str) -> Option<NodeId> {
        let candidates = doc.nodes_at_path(path);
        let source = candidates
            .iter()
            .copied()
            .find(|n| doc.attribute(*n, &template_attr()).is_some())
            .or_else(|| candidates.first().copied())?;

        let template = doc.deep_clone(source);
        doc.clear_values(template);
        for node in doc.descendants_or_self(template) {
            doc.remove_attribute(node, &template_attr());
            doc.remove_attribute(node, &ordinal_attr());
            doc.remove_attribute(node, &last_used_ordinal_attr());
        }

        // Nested series keep a single instance in the template.
        let base = doc.template_path(template);
        for nested in self.series.keys().filter(|p| p.starts_with(&format!("{}/", path))) {
            let relative = &nested[path.len()..];
            let target = format!("{}{}", base, relative);
            let mut seen_parents = Vec::new();
            for node in doc.descendants_or_self(template) {
                if doc.template_path(node) != target {
                    continue;
                }
                let parent = doc.parent(node);
                if seen_parents.contains(&parent) {
                    doc.remove_subtree(node);
                } else {
                    seen_parents.push(parent);
                }
            }
        }
        debug!(path, "template extracted");
        Some(template)
    }

    fn initialize_ordinals(&self, doc: &mut Document) {
        let root = doc.root();
        let declaration = QName::prefixed("xmlns", ORDINAL_PREFIX);
        if doc.attribute(root, &declaration).is_none() {
            doc.set_attribute(root, declaration, ORDINAL_NAMESPACE);
        }
        for path in self.series.keys() {
            for run in runs(doc, doc.nodes_at_path(path)) {
                let mut last_used = last_used_in_run(doc, &run);
                for instance in &run {
                    if ordinal(doc, *instance).is_none() {
                        last_used += 1;
                        doc.set_attribute(*instance, ordinal_attr(), last_used.to_string());
                    }
                }
                set_last_used(doc, &run, last_used);
            }
        }
    }

    pub fn is_series(&self, path: &str) -> bool {
        self.series.contains_key(path)
    }

    pub fn template(&self, path: &str) -> Option<NodeId> {
        self.series.get(path).and_then(|s| s.template)
    }

    pub fn counted_series(&self) -> Vec<(String, String)> {
        self.series
            .iter()
            .filter_map(|(path, s)| s.count.clone().map(|c| (path.clone(), c)))
            .collect()
    }

    /// All instances of the series in document order.
    pub fn instances(&self, doc: &Document, path: &str) -> Vec<NodeId> {
        doc.nodes_at_path(path)
    }

    pub fn ordinal_of(&self, doc: &Document, node: NodeId) -> Option<u64> {
        ordinal(doc, node)
    }

    /// Clones the template and inserts it after the `after`-th instance
    /// (`0` inserts before the first one, `None` appends).
    #[instrument(level = "debug", skip(self, doc))]
    pub fn create_instance(
        &self,
        doc: &mut Document,
        path: &str,
        after: Option<usize>,
    ) -> RepeatResult<NodeId> {
        let instances = self.checked_instances(doc, path)?;
        let (parent, index) = match (after, instances.as_slice()) {
            (_, []) => {
                let parent_path = parent_path(path);
                let parent = doc
                    .get_node(parent_path, 0)
                    .ok_or_else(|| RepeatError::NoParent {
                        path: path.to_string(),
                    })?;
                (parent, doc.children(parent).len())
            }
            (Some(0), [first, ..]) => (self.parent_of(doc, path, *first)?, child_index(doc, *first)),
            (Some(n), _) => {
                let anchor = instances[n.min(instances.len()) - 1];
                (self.parent_of(doc, path, anchor)?, child_index(doc, anchor) + 1)
            }
            (None, [.., last]) => (self.parent_of(doc, path, *last)?, child_index(doc, *last) + 1),
        };
        self.insert_instance(doc, path, parent, index)
    }

    /// Inserts a fresh instance as child `index` of `parent`.
    pub fn insert_instance(
        &self,
        doc: &mut Document,
        path: &str,
        parent: NodeId,
        index: usize,
    ) -> RepeatResult<NodeId> {
        let template = self.template(path).ok_or_else(|| RepeatError::MissingTemplate {
            path: path.to_string(),
        })?;
        let run_before: Vec<NodeId> = doc
            .children(parent)
            .iter()
            .copied()
            .filter(|c| doc.name(*c) == doc.name(template))
            .collect();
        let last_used = if self.ordinals {
            last_used_in_run(doc, &run_before)
        } else {
            0
        };

        let instance = doc.deep_clone(template);
        doc.insert_child(parent, index, instance);

        if self.ordinals {
            let next = last_used + 1;
            doc.set_attribute(instance, ordinal_attr(), next.to_string());
            let run = doc.same_name_siblings(instance);
            set_last_used(doc, &run, next);
            self.number_nested(doc, path, instance);
        }
        debug!(path, node = instance.raw(), "instance created");
        Ok(instance)
    }

    /// Numbers the nested series runs inside a freshly cloned instance from 1.
    fn number_nested(&self, doc: &mut Document, path: &str, instance: NodeId) {
        let prefix = format!("{}/", path);
        for nested in self.series.keys().filter(|p| p.starts_with(&prefix)) {
            let members: Vec<NodeId> = doc
                .descendants_or_self(instance)
                .into_iter()
                .filter(|n| doc.template_path(*n) == *nested)
                .collect();
            for run in runs(doc, members) {
                for (i, member) in run.iter().enumerate() {
                    doc.set_attribute(*member, ordinal_attr(), (i + 1).to_string());
                }
                set_last_used(doc, &run, run.len() as u64);
            }
        }
    }

    /// Removes the `index`-th instance (0-based, document order). Removing a
    /// missing index is a no-op.
    #[instrument(level = "debug", skip(self, doc))]
    pub fn remove_instance(
        &self,
        doc: &mut Document,
        path: &str,
        index: usize,
    ) -> RepeatResult<Option<Removal>> {
        let instances = self.checked_instances(doc, path)?;
        let Some(node) = instances.get(index).copied() else {
            warn!(path, index, count = instances.len(), "no repeat instance at index");
            return Ok(None);
        };
        self.remove_node(doc, path, node).map(Some)
    }

    pub fn remove_node(&self, doc: &mut Document, path: &str, node: NodeId) -> RepeatResult<Removal> {
        let parent = self.parent_of(doc, path, node)?;
        let run = doc.same_name_siblings(node);
        let last_used = last_used_in_run(doc, &run);
        let index = child_index(doc, node);
        doc.remove_subtree(node);

        let replacement = if run.len() == 1 {
            // A series never drops to zero instances.
            let fresh = self.insert_instance(doc, path, parent, index)?;
            if self.ordinals {
                let next = last_used + 1;
                doc.set_attribute(fresh, ordinal_attr(), next.to_string());
                set_last_used(doc, &[fresh], next);
            }
            Some(fresh)
        } else {
            if self.ordinals {
                let remaining: Vec<NodeId> = run.into_iter().filter(|n| *n != node).collect();
                set_last_used(doc, &remaining, last_used);
            }
            None
        };
        debug!(path, node = node.raw(), "instance removed");
        Ok(Removal {
            removed: node,
            replacement,
        })
    }

    fn checked_instances(&self, doc: &Document, path: &str) -> RepeatResult<Vec<NodeId>> {
        if !self.is_series(path) {
            return Err(RepeatError::NotARepeat {
                path: path.to_string(),
            });
        }
        Ok(doc.nodes_at_path(path))
    }

    fn parent_of(&self, doc: &Document, path: &str, node: NodeId) -> RepeatResult<NodeId> {
        doc.parent(node).ok_or_else(|| RepeatError::NoParent {
            path: path.to_string(),
        })
    }
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn child_index(doc: &Document, node: NodeId) -> usize {
    doc.child_index(node).unwrap_or(0)
}

/// Instances grouped by parent, in the order given.
fn runs(doc: &Document, instances: Vec<NodeId>) -> Vec<Vec<NodeId>> {
    let mut runs: Vec<Vec<NodeId>> = Vec::new();
    let mut parents: Vec<Option<NodeId>> = Vec::new();
    for node in instances {
        let parent = doc.parent(node);
        match parents.iter().position(|p| *p == parent) {
            Some(i) => runs[i].push(node),
            None => {
                parents.push(parent);
                runs.push(vec![node]);
            }
        }
    }
    runs
}

fn ordinal(doc: &Document, node: NodeId) -> Option<u64> {
    doc.attribute(node, &ordinal_attr())
        .and_then(|v| v.trim().parse().ok())
}

fn last_used_in_run(doc: &Document, run: &[NodeId]) -> u64 {
    let recorded = run
        .iter()
        .filter_map(|n| doc.attribute(*n, &last_used_ordinal_attr()))
        .filter_map(|v| v.trim().parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    let assigned = run.iter().filter_map(|n| ordinal(doc, *n)).max().unwrap_or(0);
    recorded.max(assigned)
}

/// Keeps the counter on the first instance of the run only.
fn set_last_used(doc: &mut Document, run: &[NodeId], value: u64) {
    let attr = last_used_ordinal_attr();
    for (i, node) in run.iter().enumerate() {
        if i == 0 {
            doc.set_attribute(*node, attr.clone(), value.to_string());
        } else {
            doc.remove_attribute(*node, &attr);
        }
    }
}
