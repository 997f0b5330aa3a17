//! # Form
//!
//! [`Form`] ties the pieces together: it owns the document, the repeat
//! manager, the cascade and the itemset synchronizer, applies external
//! mutations and drives cascade rounds until the form is consistent again.
//!
//! ```text
//! set_value / add_repeat / remove_repeat
//!        │
//!        ▼
//!   ┌─────────┐  changes  ┌─────────┐   ┌──────────┐   ┌──────────────┐
//!   │Document │──────────▶│ Cascade │──▶│ Itemsets │──▶│ repeat counts│──┐
//!   └─────────┘           └─────────┘   └──────────┘   └──────────────┘  │
//!        ▲                                                              │
//!        └──────────────────── next round's changes ────────────────────┘
//! ```
//!
//! With [`SchedulingPolicy::Batched`] the document is written immediately
//! but the rounds wait for [`Form::flush`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::cascade::{
    BindingCatalogue, Cascade, CascadeDiagnostic, CascadeEnv, ChangeSet, DeferredQueue,
    SchedulingPolicy,
};
use crate::config::FormConfig;
use crate::definition::FormDefinition;
use crate::error::{LoadError, LoadErrors};
use crate::event::{ChangeEvent, ChangeKind, EventBus, EventReceiver};
use crate::expr::{
    parse_expression, Expr, ExprError, ExpressionEvaluator, ResultType, XPathEvaluator,
    XPathValue,
};
use crate::itemset::{ItemOption, ItemsetSynchronizer};
use crate::model::{merge::new_instance_id, merge_record, xml, Document, ModelError, NodeId};
use crate::repeat::{RepeatError, RepeatManager};
use crate::resolver::PathResolver;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormError {
    #[error("Node not found: {path}[{index}]")]
    NodeNotFound { path: String, index: usize },
    #[error("Node is read-only: {path}")]
    ReadonlyNode { path: String },
    #[error("Repeat error: {0}")]
    Repeat(#[from] RepeatError),
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),
}

pub type FormResult<T> = Result<T, FormError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializeOptions {
    /// Keep subtrees that are currently not relevant.
    #[serde(default)]
    pub include_non_relevant: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum IssueKind {
    Required,
    Constraint,
    DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub path: String,
    pub index: usize,
    pub kind: IssueKind,
    pub message: Option<String>,
}

pub struct Form {
    doc: Document,
    config: FormConfig,
    resolver: PathResolver,
    evaluator: Box<dyn ExpressionEvaluator>,
    repeats: RepeatManager,
    cascade: Cascade,
    itemsets: ItemsetSynchronizer,
    /// Series with a count expression, prepared.
    counts: Vec<(String, Result<Expr, ExprError>)>,
    bus: EventBus,
    queue: DeferredQueue,
}

impl Form {
    /// Builds a form from `definition`, merging `record` when given, and
    /// brings every derived property up to date.
    pub fn load(
        definition: &FormDefinition,
        record: Option<&str>,
        config: FormConfig,
    ) -> Result<Self, LoadErrors> {
        Self::load_with_evaluator(definition, record, config, Box::new(XPathEvaluator::new()))
    }

    #[instrument(level = "debug", skip_all, fields(record = record.is_some()))]
    pub fn load_with_evaluator(
        definition: &FormDefinition,
        record: Option<&str>,
        config: FormConfig,
        evaluator: Box<dyn ExpressionEvaluator>,
    ) -> Result<Self, LoadErrors> {
        definition.check()?;
        let mut doc = Document::from_xml(&definition.primary_instance)
            .map_err(|e| LoadError::MalformedInstance(format!("primary instance: {}", e)))?;

        let mut errors = Vec::new();
        for (id, source) in &definition.secondary_instances {
            if let Err(e) = doc.add_secondary_instance(id, &instance_source(source)) {
                errors.push(LoadError::MalformedInstance(format!("instance '{}': {}", id, e)));
            }
        }
        if !errors.is_empty() {
            return Err(errors.into());
        }

        let series: BTreeSet<String> = definition.repeats.iter().map(|r| r.path.clone()).collect();
        if let Some(record) = record {
            merge_record(&mut doc, record, &series, &config.merge)?;
        }
        assign_instance_id(&mut doc);

        let mut repeats = RepeatManager::new(config.repeat_ordinals);
        repeats.initialize(&mut doc, &definition.repeats);
        let resolver = PathResolver::new(series.iter().cloned());
        let cascade = Cascade::new(BindingCatalogue::build(&definition.binds, &resolver));
        let itemsets = ItemsetSynchronizer::new(
            &definition.itemsets,
            &resolver,
            config.static_itemset_cache,
        );
        let counts = repeats
            .counted_series()
            .into_iter()
            .map(|(path, source)| {
                let expr = parse_expression(&source).map(|e| resolver.prepare(e));
                if let Err(e) = &expr {
                    warn!(path, error = %e, "repeat count does not parse");
                }
                (path, expr)
            })
            .collect();

        let mut form = Self {
            doc,
            bus: EventBus::new(config.event_buffer_size),
            config,
            resolver,
            evaluator,
            repeats,
            cascade,
            itemsets,
            counts,
            queue: DeferredQueue::new(),
        };
        let rounds = form.settle(ChangeSet::everything());
        info!(
            bindings = form.cascade.catalogue().len(),
            states = form.cascade.states().len(),
            rounds,
            "form loaded"
        );
        Ok(form)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn config(&self) -> &FormConfig {
        &self.config
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn diagnostics(&self) -> &[CascadeDiagnostic] {
        self.cascade.diagnostics()
    }

    pub fn instance_id(&self) -> Option<String> {
        self.doc.instance_id()
    }

    pub fn instance_name(&self) -> Option<String> {
        self.doc.instance_name()
    }

    pub fn node(&self, path: &str, index: usize) -> FormResult<NodeId> {
        self.doc
            .get_node(path, index)
            .ok_or_else(|| FormError::NodeNotFound {
                path: path.to_string(),
                index,
            })
    }

    pub fn value(&self, path: &str, index: usize) -> Option<&str> {
        self.doc.get_node(path, index).map(|n| self.doc.text(n))
    }

    // ---- mutation ----

    /// Writes an answer. Returns whether the stored value changed.
    pub fn set_value(&mut self, path: &str, index: usize, value: &str) -> FormResult<bool> {
        let node = self.node(path, index)?;
        self.set_node_value(node, value)
    }

    pub fn set_node_value(&mut self, node: NodeId, value: &str) -> FormResult<bool> {
        if self.cascade.is_readonly(&self.doc, node) {
            return Err(FormError::ReadonlyNode {
                path: self.doc.template_path(node),
            });
        }
        let changed = self.env().write_value(node, value)?;
        if changed {
            self.schedule(ChangeSet::value(node));
        }
        Ok(changed)
    }

    /// Adds a repeat instance after the `after`-th one (`0` for the front,
    /// `None` to append).
    #[instrument(level = "debug", skip(self))]
    pub fn add_repeat(&mut self, series: &str, after: Option<usize>) -> FormResult<NodeId> {
        let node = self.repeats.create_instance(&mut self.doc, series, after)?;
        self.env().notify(node, ChangeKind::Structure);
        self.schedule(ChangeSet::structure(series));
        Ok(node)
    }

    /// Removes the `index`-th instance (0-based). Returns false when there is
    /// no such instance.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_repeat(&mut self, series: &str, index: usize) -> FormResult<bool> {
        let event = self
            .doc
            .get_node(series, index)
            .map(|n| self.event(n, ChangeKind::Structure));
        let Some(removal) = self.repeats.remove_instance(&mut self.doc, series, index)? else {
            return Ok(false);
        };
        if let Some(event) = event {
            self.bus.publish(event);
        }
        if let Some(replacement) = removal.replacement {
            self.env().notify(replacement, ChangeKind::Structure);
        }
        self.schedule(ChangeSet::structure(series));
        Ok(true)
    }

    /// Runs the cascade for everything queued under batched scheduling.
    /// Returns the number of rounds run.
    pub fn flush(&mut self) -> usize {
        let changes = self.queue.drain();
        if changes.is_empty() {
            return 0;
        }
        self.settle(changes)
    }

    pub fn pending_changes(&self) -> usize {
        self.queue.len()
    }

    /// Re-evaluates every binding regardless of what changed.
    pub fn recompute_all(&mut self) -> usize {
        let mut changes = self.queue.drain();
        changes.merge(ChangeSet::everything());
        self.settle(changes)
    }

    /// Empties every leaf that is currently not relevant.
    pub fn clear_non_relevant(&mut self) -> usize {
        let hidden: Vec<NodeId> = self
            .doc
            .descendants_or_self(self.doc.root())
            .into_iter()
            .filter(|n| self.doc.is_leaf(*n) && !self.cascade.is_relevant(&self.doc, *n))
            .collect();
        let mut env = self.env();
        let mut cleared = 0;
        for node in hidden {
            match env.write_value(node, "") {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(e) => warn!(node = node.raw(), error = %e, "non-relevant value not cleared"),
            }
        }
        let changes = env.take_changes();
        debug!(cleared, "non-relevant values cleared");
        if !changes.is_empty() {
            self.schedule(changes);
        }
        cleared
    }

    // ---- queries ----

    pub fn serialize(&self, options: SerializeOptions) -> String {
        if options.include_non_relevant {
            return self.doc.to_xml();
        }
        xml::write(&self.doc, self.doc.root(), &|node| {
            self.cascade.own_relevance(node) != Some(false)
        })
    }

    pub fn is_relevant(&self, path: &str, index: usize) -> FormResult<bool> {
        let node = self.node(path, index)?;
        Ok(self.cascade.is_relevant(&self.doc, node))
    }

    pub fn is_required(&self, path: &str, index: usize) -> FormResult<bool> {
        let node = self.node(path, index)?;
        Ok(self.cascade.is_required(node))
    }

    pub fn is_readonly(&self, path: &str, index: usize) -> FormResult<bool> {
        let node = self.node(path, index)?;
        Ok(self.cascade.is_readonly(&self.doc, node))
    }

    pub fn itemset_options(&self, path: &str, index: usize) -> Option<&[ItemOption]> {
        let node = self.doc.get_node(path, index)?;
        self.itemsets.options(node)
    }

    pub fn repeat_count(&self, series: &str) -> usize {
        self.repeats.instances(&self.doc, series).len()
    }

    pub fn ordinal(&self, series: &str, index: usize) -> Option<u64> {
        let node = self.doc.get_node(series, index)?;
        self.repeats.ordinal_of(&self.doc, node)
    }

    /// Evaluates an ad-hoc expression, with `context` as the context node
    /// (the root when absent).
    pub fn evaluate(
        &self,
        expression: &str,
        result_type: ResultType,
        context: Option<(&str, usize)>,
    ) -> FormResult<XPathValue> {
        let context = match context {
            Some((path, index)) => self.node(path, index)?,
            None => self.doc.root(),
        };
        let concrete = self.resolver.resolve_str(&self.doc, expression, context)?;
        trace!(
            expression = %concrete.expr,
            context = concrete.context.raw(),
            index = concrete.context_index,
            "evaluating"
        );
        let (value, _) =
            self.evaluator
                .evaluate(&self.doc, &concrete.expr, result_type, concrete.context)?;
        Ok(value)
    }

    /// Problems with relevant answers: missing required values, failed
    /// constraints and malformed typed values.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let catalogue = self.cascade.catalogue();
        let mut issues: Vec<(Vec<usize>, ValidationIssue)> = Vec::new();
        for path in catalogue.declared_paths() {
            let data_type = catalogue.data_type(path);
            for (index, node) in self.doc.nodes_at_path(path).into_iter().enumerate() {
                if !self.cascade.is_relevant(&self.doc, node) {
                    continue;
                }
                let value = self.doc.string_value(node);
                let mut push = |kind: IssueKind, message: Option<String>| {
                    issues.push((
                        self.doc.order_key(node),
                        ValidationIssue {
                            path: path.to_string(),
                            index,
                            kind,
                            message,
                        },
                    ))
                };
                if value.trim().is_empty() {
                    if self.cascade.is_required(node) {
                        push(IssueKind::Required, None);
                    }
                    continue;
                }
                if !self.cascade.constraint_holds(node) {
                    push(
                        IssueKind::Constraint,
                        catalogue.constraint_message(path).map(str::to_string),
                    );
                }
                if self.doc.is_leaf(node) && !data_type.is_valid(&value) {
                    push(IssueKind::DataType, Some(format!("not a valid {}", data_type)));
                }
            }
        }
        issues.sort_by(|a, b| a.0.cmp(&b.0));
        issues.into_iter().map(|(_, issue)| issue).collect()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    // ---- internals ----

    fn env(&mut self) -> CascadeEnv<'_> {
        CascadeEnv::new(
            &mut self.doc,
            self.evaluator.as_ref(),
            &self.resolver,
            &self.bus,
        )
    }

    fn event(&self, node: NodeId, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::for_node(&self.doc, node, kind, |p| self.resolver.is_series(p))
    }

    fn schedule(&mut self, changes: ChangeSet) {
        match self.config.scheduling {
            SchedulingPolicy::Synchronous => {
                self.settle(changes);
            }
            SchedulingPolicy::Batched => self.queue.push(changes),
        }
    }

    /// Runs rounds until no further changes are produced. Returns the number
    /// of rounds.
    fn settle(&mut self, first: ChangeSet) -> usize {
        let limit = self.config.max_cascade_depth.max(1);
        let mut changes = first;
        let mut rounds = 0;
        while !changes.is_empty() {
            if rounds == limit {
                warn!(rounds, "cascade did not settle; giving up");
                self.cascade
                    .push_diagnostic(CascadeDiagnostic::DepthExceeded { rounds });
                break;
            }
            rounds += 1;
            let mut env = CascadeEnv::new(
                &mut self.doc,
                self.evaluator.as_ref(),
                &self.resolver,
                &self.bus,
            );
            self.cascade.run_round(&mut env, &changes);
            self.itemsets.sync(&mut env, &self.cascade, &changes);
            let structural = reconcile_counts(
                &mut env,
                &self.repeats,
                &self.counts,
                self.config.max_repeat_count,
                &mut self.cascade,
            );
            let mut next = env.take_changes();
            next.merge(structural);
            changes = next;
        }
        debug!(rounds, "cascade settled");
        rounds
    }
}

/// Secondary instances are addressed as `instance('id')/root/...`, so the
/// stored tree must start at the `<instance>` element.
fn instance_source(source: &str) -> String {
    let trimmed = source.trim_start();
    if trimmed.starts_with("<instance") {
        trimmed.to_string()
    } else {
        format!("<instance>{}</instance>", source)
    }
}

fn assign_instance_id(doc: &mut Document) {
    let Some(node) = doc.meta_node("instanceID") else {
        return;
    };
    if !doc.text(node).trim().is_empty() {
        return;
    }
    if let Err(e) = doc.set_value(node, &new_instance_id()) {
        warn!(error = %e, "instanceID not assigned");
    }
}

/// Adds or removes instances at the end of each run so its length matches
/// the series' count expression, within `1..=limit`.
fn reconcile_counts(
    env: &mut CascadeEnv,
    repeats: &RepeatManager,
    counts: &[(String, Result<Expr, ExprError>)],
    limit: usize,
    cascade: &mut Cascade,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    for (series, expr) in counts {
        let Ok(expr) = expr else {
            continue;
        };
        let parent_path = match series.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent,
            _ => continue,
        };
        for parent in env.doc.nodes_at_path(parent_path) {
            let run: Vec<NodeId> = env
                .doc
                .children(parent)
                .iter()
                .copied()
                .filter(|c| env.doc.template_path(*c) == *series)
                .collect();
            let context = run.first().copied().unwrap_or(parent);
            let wanted = match env.evaluate(expr, ResultType::Number, context) {
                Ok((value, _)) => value.as_number().unwrap_or(f64::NAN),
                Err(e) => {
                    warn!(series, error = %e, "repeat count failed");
                    continue;
                }
            };
            if !wanted.is_finite() {
                continue;
            }
            let requested = wanted.trunc() as i64;
            let limit = limit.max(1);
            let wanted = requested.clamp(1, limit as i64) as usize;
            if wanted == run.len() {
                continue;
            }
            if requested > limit as i64 {
                warn!(series, requested, limit, "repeat count clamped");
                cascade.push_diagnostic(CascadeDiagnostic::RepeatCountClamped {
                    path: series.clone(),
                    requested,
                    limit,
                });
            }
            debug!(series, from = run.len(), to = wanted, "repeat count applied");

            if wanted > run.len() {
                let mut index = match run.last() {
                    Some(last) => env.doc.child_index(*last).map(|i| i + 1).unwrap_or(0),
                    None => env.doc.children(parent).len(),
                };
                for _ in run.len()..wanted {
                    match repeats.insert_instance(env.doc, series, parent, index) {
                        Ok(node) => {
                            env.notify(node, ChangeKind::Structure);
                            index += 1;
                        }
                        Err(e) => {
                            warn!(series, error = %e, "repeat instance not created");
                            break;
                        }
                    }
                }
            } else {
                for node in run[wanted..].iter().rev() {
                    env.notify(*node, ChangeKind::Structure);
                    if let Err(e) = repeats.remove_node(env.doc, series, *node) {
                        warn!(series, error = %e, "repeat instance not removed");
                    }
                }
            }
            changes.structures.insert(series.clone());
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{BindDef, ItemsetDef, RepeatDef};
    use pretty_assertions::assert_eq;

    fn definition(primary: &str) -> FormDefinition {
        FormDefinition {
            primary_instance: primary.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_assigns_instance_id() {
        let form = Form::load(
            &definition("<data><a/><meta><instanceID/></meta></data>"),
            None,
            FormConfig::default(),
        )
        .unwrap();
        assert!(form.instance_id().unwrap().starts_with("uuid:"));
    }

    #[test]
    fn test_instance_name_from_record() {
        let def = definition("<data><a/><meta><instanceID/><instanceName/></meta></data>");
        let form = Form::load(&def, None, FormConfig::default()).unwrap();
        assert_eq!(form.instance_name(), None);

        let record = "<data><a/><meta><instanceID>uuid:1</instanceID><instanceName>Visit 3</instanceName></meta></data>";
        let form = Form::load(&def, Some(record), FormConfig::default()).unwrap();
        assert_eq!(form.instance_name().as_deref(), Some("Visit 3"));
    }

    #[test]
    fn test_load_reports_malformed_instances() {
        let mut def = definition("<data><a/></data>");
        def.secondary_instances.insert("x".into(), "<root><a></root>".into());
        def.secondary_instances.insert("y".into(), "<root><b></root>".into());
        let errors = Form::load(&def, None, FormConfig::default()).err().unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_readonly_node_refuses_writes() {
        let mut def = definition("<data><a>fixed</a></data>");
        def.binds.push(BindDef {
            nodeset: "/data/a".into(),
            readonly: Some("true()".into()),
            ..Default::default()
        });
        let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
        assert_eq!(
            form.set_value("/data/a", 0, "x"),
            Err(FormError::ReadonlyNode {
                path: "/data/a".into()
            })
        );
        assert_eq!(form.value("/data/a", 0), Some("fixed"));
    }

    #[test]
    fn test_unknown_node() {
        let mut form =
            Form::load(&definition("<data><a/></data>"), None, FormConfig::default()).unwrap();
        assert!(matches!(
            form.set_value("/data/zzz", 0, "1"),
            Err(FormError::NodeNotFound { .. })
        ));
        assert!(matches!(
            form.add_repeat("/data/a", None),
            Err(FormError::Repeat(RepeatError::NotARepeat { .. }))
        ));
    }

    #[test]
    fn test_repeat_count_follows_expression() {
        let mut def = definition("<data><n>3</n><rep><q/></rep></data>");
        def.repeats.push(RepeatDef {
            path: "/data/rep".into(),
            count: Some("/data/n".into()),
        });
        let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
        assert_eq!(form.repeat_count("/data/rep"), 3);

        form.set_value("/data/n", 0, "1").unwrap();
        assert_eq!(form.repeat_count("/data/rep"), 1);

        form.set_value("/data/n", 0, "0").unwrap();
        assert_eq!(form.repeat_count("/data/rep"), 1);
    }

    #[test]
    fn test_repeat_count_is_clamped_to_limit() {
        let mut def = definition("<data><n>2</n><rep><q/></rep></data>");
        def.repeats.push(RepeatDef {
            path: "/data/rep".into(),
            count: Some("/data/n".into()),
        });
        let config = FormConfig {
            max_repeat_count: 5,
            ..Default::default()
        };
        let mut form = Form::load(&def, None, config).unwrap();
        assert!(form.diagnostics().is_empty());

        form.set_value("/data/n", 0, "3000").unwrap();
        assert_eq!(form.repeat_count("/data/rep"), 5);
        assert_eq!(
            form.diagnostics(),
            &[CascadeDiagnostic::RepeatCountClamped {
                path: "/data/rep".into(),
                requested: 3000,
                limit: 5,
            }]
        );

        form.set_value("/data/n", 0, "4").unwrap();
        assert_eq!(form.repeat_count("/data/rep"), 4);
    }

    #[test]
    fn test_merged_record_without_instance_id_gets_one() {
        let form = Form::load(
            &definition("<data><a/><meta><instanceID/></meta></data>"),
            Some("<data><a>kept</a><meta><instanceID/></meta></data>"),
            FormConfig::default(),
        )
        .unwrap();
        assert_eq!(form.value("/data/a", 0), Some("kept"));
        assert!(form.instance_id().unwrap().starts_with("uuid:"));
    }

    #[test]
    fn test_validate_reports_relevant_problems() {
        let mut def = definition("<data><show>yes</show><a/><b>5</b><c>x</c></data>");
        def.binds = vec![
            BindDef {
                nodeset: "/data/a".into(),
                required: Some("true()".into()),
                ..Default::default()
            },
            BindDef {
                nodeset: "/data/b".into(),
                constraint: Some(". > 10".into()),
                constraint_message: Some("too small".into()),
                ..Default::default()
            },
            BindDef {
                nodeset: "/data/c".into(),
                relevant: Some("/data/show = 'yes'".into()),
                data_type: crate::datatype::DataType::Int,
                ..Default::default()
            },
        ];
        let mut form = Form::load(&def, None, FormConfig::default()).unwrap();
        let kinds: Vec<IssueKind> = form.validate().into_iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![IssueKind::Required, IssueKind::Constraint, IssueKind::DataType]
        );

        form.set_value("/data/show", 0, "no").unwrap();
        form.set_value("/data/a", 0, "filled").unwrap();
        form.set_value("/data/b", 0, "11").unwrap();
        assert!(form.is_valid());
    }

    #[test]
    fn test_evaluate_in_repeat_context() {
        let mut def = definition("<data><rep><q>a</q></rep><rep><q>b</q></rep></data>");
        def.repeats.push(RepeatDef {
            path: "/data/rep".into(),
            count: None,
        });
        let form = Form::load(&def, None, FormConfig::default()).unwrap();
        let value = form
            .evaluate("/data/rep/q", ResultType::String, Some(("/data/rep/q", 1)))
            .unwrap();
        assert_eq!(value, XPathValue::String("b".into()));
        assert!(matches!(
            form.evaluate("1 +", ResultType::Number, None),
            Err(FormError::Expression(_))
        ));
    }

    #[test]
    fn test_secondary_instance_without_wrapper() {
        let mut def = definition("<data><sel/></data>");
        def.secondary_instances.insert(
            "opts".into(),
            "<root><item><name>a</name><label>A</label></item></root>".into(),
        );
        def.itemsets.push(ItemsetDef {
            path: "/data/sel".into(),
            nodeset: "instance('opts')/root/item".into(),
            value_ref: "name".into(),
            label_ref: "label".into(),
            multiple: false,
        });
        let form = Form::load(&def, None, FormConfig::default()).unwrap();
        let options = form.itemset_options("/data/sel", 0).unwrap();
        assert_eq!(
            options,
            &[ItemOption {
                value: "a".into(),
                label: "A".into()
            }]
        );
    }
}
