//! # Path Resolution
//!
//! Turns an expression written against template paths into one that can be
//! evaluated for a concrete node. Rewriting is a chain of transforms over the
//! parsed AST:
//!
//! 1. `pulldata(id, column, key, value)` becomes
//!    `instance(id)/root/item[key = value]/column`;
//! 2. `indexed-repeat(node, repeat, index, ...)` becomes `node` with a
//!    `[position() = index]` predicate on each named repeat step;
//! 3. positional injection: an absolute path that passes through a repeat
//!    series enclosing the context node gets the context's position injected
//!    on the series step (`/data/rep/q` evaluated inside the second `rep`
//!    becomes `/data/rep[2]/q`).
//!
//! Steps 1 and 2 depend only on the expression and run once per binding
//! ([`PathResolver::prepare`]); step 3 runs per evaluation
//! ([`PathResolver::resolve`]).

use std::collections::BTreeSet;

use tracing::{instrument, warn};

use crate::expr::{parse_expression, Axis, BinaryOperator, Expr, ExprResult, LocationPath, Step};
use crate::model::{Document, NodeId, QName};

/// An expression bound to the node it is evaluated for.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteExpression {
    pub expr: Expr,
    pub context: NodeId,
    /// 0-based index of the context among nodes sharing its template path.
    pub context_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    series: BTreeSet<String>,
}

impl PathResolver {
    pub fn new<I, S>(series: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            series: series.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_series(&self, path: &str) -> bool {
        self.series.contains(path)
    }

    /// Applies the context-free rewrites.
    pub fn prepare(&self, expr: Expr) -> Expr {
        rewrite_calls(expr)
    }

    /// Applies positional injection for `context`.
    #[instrument(level = "trace", skip(self, doc, prepared))]
    pub fn resolve(&self, doc: &Document, prepared: &Expr, context: NodeId) -> ConcreteExpression {
        let enclosing = self.enclosing_instances(doc, context);
        let mut expr = prepared.clone();
        if !enclosing.is_empty() {
            visit_paths_mut(&mut expr, &mut |path| inject_positions(path, &enclosing));
        }
        ConcreteExpression {
            expr,
            context,
            context_index: doc.index_of(context),
        }
    }

    pub fn resolve_str(
        &self,
        doc: &Document,
        source: &str,
        context: NodeId,
    ) -> ExprResult<ConcreteExpression> {
        let prepared = self.prepare(parse_expression(source)?);
        Ok(self.resolve(doc, &prepared, context))
    }

    /// Repeat instances enclosing `context` (inclusive), outermost first,
    /// with the name path of their series and their 1-based position.
    fn enclosing_instances(&self, doc: &Document, context: NodeId) -> Vec<(Vec<QName>, usize)> {
        if self.series.is_empty() || !doc.is_attached(context) {
            return Vec::new();
        }
        let mut chain: Vec<NodeId> = doc.ancestors(context);
        chain.reverse();
        chain.push(context);
        chain
            .into_iter()
            .filter_map(|node| {
                let path = doc.template_path(node);
                if !self.series.contains(&path) {
                    return None;
                }
                let mut names: Vec<QName> = vec![doc.name(node).clone()];
                names.extend(doc.ancestors(node).iter().map(|a| doc.name(*a).clone()));
                names.reverse();
                Some((names, doc.position(node)))
            })
            .collect()
    }
}

fn inject_positions(path: &mut LocationPath, enclosing: &[(Vec<QName>, usize)]) {
    if !path.absolute {
        return;
    }
    for (names, position) in enclosing {
        let series_step = names.len() - 1;
        // The path must continue past the series step.
        if path.steps.len() <= names.len() {
            continue;
        }
        let follows_series = names.iter().zip(&path.steps).all(|(name, step)| {
            step.child_name()
                .map(|test| name.matches(test))
                .unwrap_or(false)
        });
        if follows_series && path.steps[series_step].predicates.is_empty() {
            path.steps[series_step]
                .predicates
                .push(Expr::Number(*position as f64));
        }
    }
}

fn visit_paths_mut(expr: &mut Expr, visit: &mut dyn FnMut(&mut LocationPath)) {
    match expr {
        Expr::Path(path) => {
            for step in &mut path.steps {
                for predicate in &mut step.predicates {
                    visit_paths_mut(predicate, visit);
                }
            }
            visit(path);
        }
        Expr::Filter {
            primary,
            predicates,
            steps,
        } => {
            visit_paths_mut(primary, visit);
            for predicate in predicates {
                visit_paths_mut(predicate, visit);
            }
            for step in steps {
                for predicate in &mut step.predicates {
                    visit_paths_mut(predicate, visit);
                }
            }
        }
        Expr::FunctionCall { args, .. } => {
            for arg in args {
                visit_paths_mut(arg, visit);
            }
        }
        Expr::Binary { left, right, .. } => {
            visit_paths_mut(left, visit);
            visit_paths_mut(right, visit);
        }
        Expr::Negate(inner) => visit_paths_mut(inner, visit),
        Expr::Number(_) | Expr::Literal(_) => {}
    }
}

/// Bottom-up rewrite of compatibility calls.
fn rewrite_calls(expr: Expr) -> Expr {
    match expr {
        Expr::FunctionCall { name, args } => {
            let args: Vec<Expr> = args.into_iter().map(rewrite_calls).collect();
            let rewritten = match name.as_str() {
                "pulldata" => rewrite_pulldata(&args),
                "indexed-repeat" => rewrite_indexed_repeat(&args),
                _ => None,
            };
            rewritten.unwrap_or(Expr::FunctionCall { name, args })
        }
        Expr::Path(mut path) => {
            rewrite_step_predicates(&mut path.steps);
            Expr::Path(path)
        }
        Expr::Filter {
            primary,
            predicates,
            mut steps,
        } => {
            rewrite_step_predicates(&mut steps);
            Expr::Filter {
                primary: Box::new(rewrite_calls(*primary)),
                predicates: predicates.into_iter().map(rewrite_calls).collect(),
                steps,
            }
        }
        Expr::Binary { op, left, right } => {
            Expr::binary(op, rewrite_calls(*left), rewrite_calls(*right))
        }
        Expr::Negate(inner) => Expr::Negate(Box::new(rewrite_calls(*inner))),
        other => other,
    }
}

fn rewrite_step_predicates(steps: &mut [Step]) {
    for step in steps {
        let predicates = std::mem::take(&mut step.predicates);
        step.predicates = predicates.into_iter().map(rewrite_calls).collect();
    }
}

/// `pulldata(id, column, key, value)` with literal id, column and key.
fn rewrite_pulldata(args: &[Expr]) -> Option<Expr> {
    let [Expr::Literal(id), Expr::Literal(column), Expr::Literal(key), value] = args else {
        warn!("pulldata() needs literal instance, column and key arguments");
        return None;
    };
    let predicate = Expr::binary(
        BinaryOperator::Equal,
        Expr::path(false, vec![Step::child(QName::parse(key))]),
        anchor_to_current(value.clone()),
    );
    let mut item = Step::child(QName::new("item"));
    item.predicates.push(predicate);
    Some(Expr::Filter {
        primary: Box::new(Expr::FunctionCall {
            name: "instance".to_string(),
            args: vec![Expr::Literal(id.clone())],
        }),
        predicates: Vec::new(),
        steps: vec![
            Step::child(QName::new("root")),
            item,
            Step::child(QName::parse(column)),
        ],
    })
}

/// `indexed-repeat(node, repeat1, index1, [repeat2, index2, ...])`
fn rewrite_indexed_repeat(args: &[Expr]) -> Option<Expr> {
    if args.len() < 3 || args.len() % 2 == 0 {
        warn!(count = args.len(), "indexed-repeat() needs a node and repeat/index pairs");
        return None;
    }
    let Expr::Path(target) = &args[0] else {
        return None;
    };
    let mut target = target.clone();
    if !target.absolute {
        return None;
    }
    for pair in args[1..].chunks(2) {
        let (Expr::Path(repeat), index) = (&pair[0], &pair[1]) else {
            return None;
        };
        let depth = repeat.steps.len();
        let matches_prefix = repeat.absolute
            && depth > 0
            && depth <= target.steps.len()
            && repeat
                .steps
                .iter()
                .zip(&target.steps)
                .all(|(r, t)| r.child_name().is_some() && r.child_name() == t.child_name());
        if !matches_prefix {
            warn!(repeat = %repeat, node = %target, "indexed-repeat() repeat is not an ancestor of node");
            return None;
        }
        let position = Expr::binary(
            BinaryOperator::Equal,
            Expr::FunctionCall {
                name: "position".to_string(),
                args: Vec::new(),
            },
            anchor_to_current(index.clone()),
        );
        target.steps[depth - 1].predicates.push(position);
    }
    Some(Expr::Path(target))
}

/// Re-roots relative paths at `current()` so the expression keeps its
/// meaning when moved into a predicate.
fn anchor_to_current(expr: Expr) -> Expr {
    match expr {
        Expr::Path(path) if !path.absolute => {
            let steps = if path
                .steps
                .first()
                .map(|s| s.axis == Axis::SelfAxis && s.predicates.is_empty())
                .unwrap_or(false)
            {
                path.steps[1..].to_vec()
            } else {
                path.steps
            };
            let current = Expr::FunctionCall {
                name: "current".to_string(),
                args: Vec::new(),
            };
            if steps.is_empty() {
                current
            } else {
                Expr::Filter {
                    primary: Box::new(current),
                    predicates: Vec::new(),
                    steps,
                }
            }
        }
        Expr::FunctionCall { name, args } => Expr::FunctionCall {
            name,
            args: args.into_iter().map(anchor_to_current).collect(),
        },
        Expr::Binary { op, left, right } => {
            Expr::binary(op, anchor_to_current(*left), anchor_to_current(*right))
        }
        Expr::Negate(inner) => Expr::Negate(Box::new(anchor_to_current(*inner))),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExpressionEvaluator, ResultType, XPathEvaluator, XPathValue};

    fn doc() -> Document {
        Document::from_xml(
            "<data><rep><q>a</q><sub><v>1</v></sub><sub><v>2</v></sub></rep><rep><q>b</q><sub><v>3</v></sub></rep><idx>2</idx><total/></data>",
        )
        .unwrap()
    }

    fn resolver() -> PathResolver {
        PathResolver::new(["/data/rep", "/data/rep/sub"])
    }

    fn resolved(doc: &Document, source: &str, context: NodeId) -> String {
        resolver()
            .resolve_str(doc, source, context)
            .unwrap()
            .expr
            .to_string()
    }

    #[test]
    fn test_injects_position_inside_series() {
        let doc = doc();
        let q2 = doc.get_node("/data/rep/q", 1).unwrap();
        assert_eq!(resolved(&doc, "/data/rep/q", q2), "/data/rep[2]/q");
        assert_eq!(
            resolved(&doc, "concat(/data/rep/q, ../q)", q2),
            "concat(/data/rep[2]/q, ../q)"
        );
    }

    #[test]
    fn test_injects_every_enclosing_level() {
        let doc = doc();
        let v2 = doc.get_node("/data/rep/sub/v", 1).unwrap();
        assert_eq!(
            resolved(&doc, "/data/rep/sub/v + 1", v2),
            "/data/rep[1]/sub[2]/v + 1"
        );
    }

    #[test]
    fn test_no_injection_outside_series_or_without_continuation() {
        let doc = doc();
        let total = doc.get_node("/data/total", 0).unwrap();
        assert_eq!(resolved(&doc, "sum(/data/rep/q)", total), "sum(/data/rep/q)");
        let q1 = doc.get_node("/data/rep/q", 0).unwrap();
        assert_eq!(resolved(&doc, "count(/data/rep)", q1), "count(/data/rep)");
    }

    #[test]
    fn test_existing_predicate_is_kept() {
        let doc = doc();
        let q2 = doc.get_node("/data/rep/q", 1).unwrap();
        assert_eq!(resolved(&doc, "/data/rep[1]/q", q2), "/data/rep[1]/q");
    }

    #[test]
    fn test_name_suffix_is_not_a_match() {
        let doc = Document::from_xml("<data><rep><q/></rep><other><rep><q/></rep></other></data>")
            .unwrap();
        let resolver = PathResolver::new(["/data/rep"]);
        let q = doc.get_node("/data/rep/q", 0).unwrap();
        let concrete = resolver.resolve_str(&doc, "/data/other/rep/q", q).unwrap();
        assert_eq!(concrete.expr.to_string(), "/data/other/rep/q");
    }

    #[test]
    fn test_indexed_repeat_rewrite() {
        let doc = doc();
        let total = doc.get_node("/data/total", 0).unwrap();
        let concrete = resolver()
            .resolve_str(&doc, "indexed-repeat(/data/rep/q, /data/rep, /data/idx)", total)
            .unwrap();
        assert_eq!(concrete.expr.to_string(), "/data/rep[position() = /data/idx]/q");
        let (value, _) = XPathEvaluator
            .evaluate(&doc, &concrete.expr, ResultType::String, total)
            .unwrap();
        assert_eq!(value, XPathValue::String("b".into()));
    }

    #[test]
    fn test_nested_indexed_repeat_rewrite() {
        let doc = doc();
        let total = doc.get_node("/data/total", 0).unwrap();
        let concrete = resolver()
            .resolve_str(
                &doc,
                "indexed-repeat(/data/rep/sub/v, /data/rep, 1, /data/rep/sub, ../idx)",
                total,
            )
            .unwrap();
        assert_eq!(
            concrete.expr.to_string(),
            "/data/rep[position() = 1]/sub[position() = current()/../idx]/v"
        );
        let (value, _) = XPathEvaluator
            .evaluate(&doc, &concrete.expr, ResultType::String, total)
            .unwrap();
        assert_eq!(value, XPathValue::String("2".into()));
    }

    #[test]
    fn test_pulldata_rewrite() {
        let mut doc = doc();
        doc.add_secondary_instance(
            "fruits",
            "<instance><root><item><name>apple</name><price>3</price></item><item><name>pear</name><price>5</price></item></root></instance>",
        )
        .unwrap();
        let q1 = doc.get_node("/data/rep/q", 0).unwrap();
        let concrete = resolver()
            .resolve_str(&doc, "pulldata('fruits', 'price', 'name', 'pear')", q1)
            .unwrap();
        assert_eq!(
            concrete.expr.to_string(),
            "instance('fruits')/root/item[name = 'pear']/price"
        );
        let (value, _) = XPathEvaluator
            .evaluate(&doc, &concrete.expr, ResultType::Number, q1)
            .unwrap();
        assert_eq!(value, XPathValue::Number(5.0));
    }

    #[test]
    fn test_malformed_calls_are_left_alone() {
        let doc = doc();
        let total = doc.get_node("/data/total", 0).unwrap();
        assert_eq!(
            resolved(&doc, "pulldata(/data/idx, 'a', 'b', 'c')", total),
            "pulldata(/data/idx, 'a', 'b', 'c')"
        );
        assert_eq!(
            resolved(&doc, "indexed-repeat(/data/total, /data/rep, 1)", total),
            "indexed-repeat(/data/total, /data/rep, 1)"
        );
    }
}
