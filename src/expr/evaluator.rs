use std::cmp::Ordering;

use regex::Regex;
use tracing::trace;

use super::ast::{format_number, Axis, BinaryOperator, Expr, LocationPath, NodeTest, Step};
use super::{Dependencies, ExprError, ExprResult, ExpressionEvaluator, NodeRef, ResultType, XPathValue};
use crate::model::{Document, NodeId};

/// Reference evaluator for the form expression dialect.
///
/// Records every primary-instance node whose value is read and every child
/// set that is enumerated. Secondary instances are read-only and are not
/// recorded.
#[derive(Debug, Clone, Copy, Default)]
pub struct XPathEvaluator;

impl XPathEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for XPathEvaluator {
    fn evaluate(
        &self,
        doc: &Document,
        expr: &Expr,
        result_type: ResultType,
        context: NodeId,
    ) -> ExprResult<(XPathValue, Dependencies)> {
        let mut evaluation = Evaluation {
            doc,
            current: context,
            predicate_depth: 0,
            deps: Dependencies::default(),
        };
        let ctx = Context {
            node: NodeRef::Element(context),
            position: 1,
            size: 1,
        };
        let value = evaluation.eval(expr, &ctx)?;
        let value = evaluation.convert(value, result_type)?;
        trace!(%expr, ?value, "evaluated");
        Ok((value, evaluation.deps))
    }
}

#[derive(Debug, Clone, Copy)]
struct Context {
    node: NodeRef,
    position: usize,
    size: usize,
}

struct Evaluation<'a> {
    doc: &'a Document,
    current: NodeId,
    predicate_depth: usize,
    deps: Dependencies,
}

impl<'a> Evaluation<'a> {
    fn eval(&mut self, expr: &Expr, ctx: &Context) -> ExprResult<XPathValue> {
        match expr {
            Expr::Number(n) => Ok(XPathValue::Number(*n)),
            Expr::Literal(s) => Ok(XPathValue::String(s.clone())),
            Expr::Path(path) => Ok(XPathValue::Nodes(self.eval_path(path, ctx)?)),
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                let mut nodes = match self.eval(primary, ctx)? {
                    XPathValue::Nodes(nodes) => nodes,
                    other => {
                        return Err(ExprError::Type(format!(
                            "cannot apply steps to {:?}",
                            other
                        )))
                    }
                };
                for predicate in predicates {
                    nodes = self.filter(nodes, predicate)?;
                }
                Ok(XPathValue::Nodes(self.apply_steps(nodes, steps)?))
            }
            Expr::FunctionCall { name, args } => self.call(name, args, ctx),
            Expr::Negate(inner) => {
                let value = self.eval(inner, ctx)?;
                Ok(XPathValue::Number(-self.to_number(&value)))
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, ctx),
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOperator,
        left: &Expr,
        right: &Expr,
        ctx: &Context,
    ) -> ExprResult<XPathValue> {
        match op {
            BinaryOperator::Or => {
                let l = self.eval(left, ctx)?;
                if self.to_boolean(&l) {
                    return Ok(XPathValue::Boolean(true));
                }
                let r = self.eval(right, ctx)?;
                Ok(XPathValue::Boolean(self.to_boolean(&r)))
            }
            BinaryOperator::And => {
                let l = self.eval(left, ctx)?;
                if !self.to_boolean(&l) {
                    return Ok(XPathValue::Boolean(false));
                }
                let r = self.eval(right, ctx)?;
                Ok(XPathValue::Boolean(self.to_boolean(&r)))
            }
            BinaryOperator::Union => {
                let l = self.eval(left, ctx)?;
                let r = self.eval(right, ctx)?;
                match (l, r) {
                    (XPathValue::Nodes(mut a), XPathValue::Nodes(b)) => {
                        a.extend(b);
                        Ok(XPathValue::Nodes(self.sort_nodes(a)))
                    }
                    _ => Err(ExprError::Type("union of non node-sets".into())),
                }
            }
            BinaryOperator::Equal
            | BinaryOperator::NotEqual
            | BinaryOperator::LessThan
            | BinaryOperator::LessThanEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanEqual => {
                let l = self.eval(left, ctx)?;
                let r = self.eval(right, ctx)?;
                Ok(XPathValue::Boolean(self.compare(op, l, r)))
            }
            BinaryOperator::Add
            | BinaryOperator::Subtract
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo => {
                let l = self.eval(left, ctx)?;
                let r = self.eval(right, ctx)?;
                let (a, b) = (self.to_number(&l), self.to_number(&r));
                let n = match op {
                    BinaryOperator::Add => a + b,
                    BinaryOperator::Subtract => a - b,
                    BinaryOperator::Multiply => a * b,
                    BinaryOperator::Divide => a / b,
                    _ => a % b,
                };
                Ok(XPathValue::Number(n))
            }
        }
    }

    // ---- paths ----

    fn eval_path(&mut self, path: &LocationPath, ctx: &Context) -> ExprResult<Vec<NodeRef>> {
        let start = if path.absolute {
            vec![NodeRef::Document]
        } else {
            vec![ctx.node]
        };
        self.apply_steps(start, &path.steps)
    }

    fn apply_steps(&mut self, mut nodes: Vec<NodeRef>, steps: &[Step]) -> ExprResult<Vec<NodeRef>> {
        for step in steps {
            let mut out = Vec::new();
            for node in &nodes {
                let mut candidates = self.axis_nodes(*node, step);
                for predicate in &step.predicates {
                    candidates = self.filter(candidates, predicate)?;
                }
                out.extend(candidates);
            }
            nodes = self.sort_nodes(out);
            if nodes.is_empty() {
                break;
            }
        }
        Ok(nodes)
    }

    fn filter(&mut self, nodes: Vec<NodeRef>, predicate: &Expr) -> ExprResult<Vec<NodeRef>> {
        let size = nodes.len();
        let mut kept = Vec::new();
        self.predicate_depth += 1;
        for (i, node) in nodes.into_iter().enumerate() {
            let ctx = Context {
                node,
                position: i + 1,
                size,
            };
            let value = match self.eval(predicate, &ctx) {
                Ok(value) => value,
                Err(e) => {
                    self.predicate_depth -= 1;
                    return Err(e);
                }
            };
            let keep = match value {
                XPathValue::Number(n) => n == (i + 1) as f64,
                other => self.to_boolean(&other),
            };
            if keep {
                kept.push(node);
            }
        }
        self.predicate_depth -= 1;
        Ok(kept)
    }

    /// Nodes along `step.axis` that pass the node test, in axis order.
    fn axis_nodes(&mut self, node: NodeRef, step: &Step) -> Vec<NodeRef> {
        let doc = self.doc;
        let test = &step.test;
        match step.axis {
            Axis::Child => match node {
                NodeRef::Document => {
                    let root = NodeRef::Element(doc.root());
                    if self.test_node(root, test) {
                        vec![root]
                    } else {
                        Vec::new()
                    }
                }
                NodeRef::Element(id) => {
                    if matches!(test, NodeTest::Text) {
                        return if doc.is_leaf(id) && !doc.text(id).is_empty() {
                            vec![node]
                        } else {
                            Vec::new()
                        };
                    }
                    let matched: Vec<NodeRef> = doc
                        .children(id)
                        .iter()
                        .map(|c| NodeRef::Element(*c))
                        .filter(|c| self.test_node(*c, test))
                        .collect();
                    self.record_children(id, test, &matched);
                    matched
                }
                NodeRef::Attribute(..) => Vec::new(),
            },
            Axis::Attribute => match node {
                NodeRef::Element(id) => doc
                    .attributes(id)
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| !a.name.is_namespace_declaration())
                    .map(|(i, _)| NodeRef::Attribute(id, i))
                    .filter(|a| self.test_node(*a, test))
                    .collect(),
                _ => Vec::new(),
            },
            Axis::SelfAxis => self.keep_if(node, test),
            Axis::Parent => match self.parent_of(node) {
                Some(parent) => self.keep_if(parent, test),
                None => Vec::new(),
            },
            Axis::Ancestor | Axis::AncestorOrSelf => {
                let mut out = Vec::new();
                let mut current = if step.axis == Axis::AncestorOrSelf {
                    Some(node)
                } else {
                    self.parent_of(node)
                };
                while let Some(n) = current {
                    if self.test_node(n, test) {
                        out.push(n);
                    }
                    current = self.parent_of(n);
                }
                out
            }
            Axis::Descendant | Axis::DescendantOrSelf => {
                let (start, include_self) = match node {
                    NodeRef::Document => {
                        self.deps.deep_structures.insert(String::new());
                        (doc.root(), true)
                    }
                    NodeRef::Element(id) => {
                        if doc.is_attached(id) {
                            self.deps.deep_structures.insert(doc.template_path(id));
                        }
                        (id, step.axis == Axis::DescendantOrSelf)
                    }
                    NodeRef::Attribute(..) => {
                        return if step.axis == Axis::DescendantOrSelf {
                            self.keep_if(node, test)
                        } else {
                            Vec::new()
                        };
                    }
                };
                let mut out = Vec::new();
                if step.axis == Axis::DescendantOrSelf && node == NodeRef::Document {
                    out.extend(self.keep_if(node, test));
                }
                for id in doc.descendants_or_self(start) {
                    if id == start && !include_self {
                        continue;
                    }
                    let n = NodeRef::Element(id);
                    if self.test_node(n, test) {
                        out.push(n);
                    }
                }
                out
            }
            Axis::FollowingSibling | Axis::PrecedingSibling => {
                self.deps.position_sensitive = true;
                let NodeRef::Element(id) = node else {
                    return Vec::new();
                };
                let Some(parent) = doc.parent(id) else {
                    return Vec::new();
                };
                let siblings = doc.children(parent);
                let Some(index) = siblings.iter().position(|s| *s == id) else {
                    return Vec::new();
                };
                let range: Vec<NodeId> = if step.axis == Axis::FollowingSibling {
                    siblings[index + 1..].to_vec()
                } else {
                    siblings[..index].iter().rev().copied().collect()
                };
                range
                    .into_iter()
                    .map(NodeRef::Element)
                    .filter(|n| self.test_node(*n, test))
                    .collect()
            }
        }
    }

    fn record_children(&mut self, parent: NodeId, test: &NodeTest, matched: &[NodeRef]) {
        let doc = self.doc;
        if !doc.is_attached(parent) {
            return;
        }
        let parent_path = doc.template_path(parent);
        match test {
            NodeTest::Name(name) => {
                self.deps.structures.insert(format!("{}/{}", parent_path, name));
                if let Some(NodeRef::Element(first)) = matched.first() {
                    self.deps.structures.insert(doc.template_path(*first));
                }
            }
            _ => {
                self.deps.structures.insert(format!("{}/*", parent_path));
            }
        }
    }

    fn keep_if(&self, node: NodeRef, test: &NodeTest) -> Vec<NodeRef> {
        if self.test_node(node, test) {
            vec![node]
        } else {
            Vec::new()
        }
    }

    fn parent_of(&self, node: NodeRef) -> Option<NodeRef> {
        match node {
            NodeRef::Document => None,
            NodeRef::Attribute(owner, _) => Some(NodeRef::Element(owner)),
            NodeRef::Element(id) => match self.doc.parent(id) {
                Some(parent) => Some(NodeRef::Element(parent)),
                None if id == self.doc.root() => Some(NodeRef::Document),
                None => None,
            },
        }
    }

    fn test_node(&self, node: NodeRef, test: &NodeTest) -> bool {
        match (node, test) {
            (_, NodeTest::AnyNode) => true,
            (NodeRef::Document, _) => false,
            (NodeRef::Element(id), NodeTest::Name(name)) => self.doc.name(id).matches(name),
            (NodeRef::Element(id), NodeTest::Wildcard(prefix)) => match prefix {
                Some(prefix) => self.doc.name(id).prefix.as_deref() == Some(prefix.as_str()),
                None => true,
            },
            (NodeRef::Element(_), NodeTest::Text) => false,
            (NodeRef::Attribute(id, i), NodeTest::Name(name)) => self
                .doc
                .attributes(id)
                .get(i)
                .map(|a| a.name.matches(name))
                .unwrap_or(false),
            (NodeRef::Attribute(..), NodeTest::Wildcard(_)) => true,
            (NodeRef::Attribute(..), NodeTest::Text) => false,
        }
    }

    /// Deduplicates and sorts into document order.
    fn sort_nodes(&self, nodes: Vec<NodeRef>) -> Vec<NodeRef> {
        if nodes.len() < 2 {
            return nodes;
        }
        let mut keyed: Vec<((Vec<usize>, usize), NodeRef)> = nodes
            .into_iter()
            .map(|n| (self.sort_key(n), n))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.1 == b.1);
        keyed.into_iter().map(|(_, n)| n).collect()
    }

    fn sort_key(&self, node: NodeRef) -> (Vec<usize>, usize) {
        match node {
            NodeRef::Document => (Vec::new(), 0),
            NodeRef::Element(id) => (self.doc.order_key(id), 0),
            NodeRef::Attribute(id, i) => (self.doc.order_key(id), i + 1),
        }
    }

    // ---- conversions ----

    fn string_of_node(&mut self, node: NodeRef) -> String {
        match node {
            NodeRef::Document => {
                let root = self.doc.root();
                self.deps.nodes.insert(root);
                self.doc.string_value(root)
            }
            NodeRef::Element(id) => {
                if self.doc.is_attached(id) {
                    self.deps.nodes.insert(id);
                }
                self.doc.string_value(id)
            }
            NodeRef::Attribute(id, i) => {
                if self.doc.is_attached(id) {
                    self.deps.nodes.insert(id);
                }
                self.doc
                    .attributes(id)
                    .get(i)
                    .map(|a| a.value.clone())
                    .unwrap_or_default()
            }
        }
    }

    fn to_string(&mut self, value: &XPathValue) -> String {
        match value {
            XPathValue::Nodes(nodes) => match nodes.first() {
                Some(first) => self.string_of_node(*first),
                None => String::new(),
            },
            other => atomic_string(other),
        }
    }

    fn to_number(&mut self, value: &XPathValue) -> f64 {
        match value {
            XPathValue::Nodes(_) => parse_number(&self.to_string(value)),
            other => atomic_number(other),
        }
    }

    fn to_boolean(&mut self, value: &XPathValue) -> bool {
        match value {
            XPathValue::Nodes(nodes) => !nodes.is_empty(),
            other => atomic_boolean(other),
        }
    }

    fn node_strings(&mut self, value: &XPathValue) -> Vec<String> {
        match value {
            XPathValue::Nodes(nodes) => nodes.iter().map(|n| self.string_of_node(*n)).collect(),
            other => vec![atomic_string(other)],
        }
    }

    fn convert(&mut self, value: XPathValue, result_type: ResultType) -> ExprResult<XPathValue> {
        Ok(match result_type {
            ResultType::String => XPathValue::String(self.to_string(&value)),
            ResultType::Number => XPathValue::Number(self.to_number(&value)),
            ResultType::Boolean => XPathValue::Boolean(self.to_boolean(&value)),
            ResultType::Nodes => match value {
                XPathValue::Nodes(_) => value,
                other => {
                    return Err(ExprError::Type(format!(
                        "expected a node-set, got {:?}",
                        other
                    )))
                }
            },
        })
    }

    fn compare(&mut self, op: BinaryOperator, left: XPathValue, right: XPathValue) -> bool {
        match (&left, &right) {
            (XPathValue::Nodes(_), XPathValue::Nodes(_)) => {
                let a = self.node_strings(&left);
                let b = self.node_strings(&right);
                a.iter().any(|x| {
                    b.iter().any(|y| {
                        compare_atomic(
                            op,
                            &XPathValue::String(x.clone()),
                            &XPathValue::String(y.clone()),
                        )
                    })
                })
            }
            (XPathValue::Nodes(_), XPathValue::Boolean(_)) => {
                let b = XPathValue::Boolean(self.to_boolean(&left));
                compare_atomic(op, &b, &right)
            }
            (XPathValue::Boolean(_), XPathValue::Nodes(_)) => {
                let b = XPathValue::Boolean(self.to_boolean(&right));
                compare_atomic(op, &left, &b)
            }
            (XPathValue::Nodes(_), _) => self
                .node_strings(&left)
                .into_iter()
                .any(|s| compare_atomic(op, &XPathValue::String(s), &right)),
            (_, XPathValue::Nodes(_)) => self
                .node_strings(&right)
                .into_iter()
                .any(|s| compare_atomic(op, &left, &XPathValue::String(s))),
            _ => compare_atomic(op, &left, &right),
        }
    }

    // ---- functions ----

    fn call(&mut self, name: &str, args: &[Expr], ctx: &Context) -> ExprResult<XPathValue> {
        if name == "if" {
            check_arity(name, args, 3, 3)?;
            let condition = self.eval(&args[0], ctx)?;
            let branch = if self.to_boolean(&condition) {
                &args[1]
            } else {
                &args[2]
            };
            return self.eval(branch, ctx);
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, ctx)?);
        }

        let value = match name {
            "position" => {
                check_arity(name, args, 0, 1)?;
                match values.first() {
                    Some(value) => {
                        self.deps.position_sensitive = true;
                        let node = self.single_element(name, value)?;
                        XPathValue::Number(self.doc.position(node) as f64)
                    }
                    None => {
                        if self.predicate_depth == 0 {
                            self.deps.position_sensitive = true;
                        }
                        XPathValue::Number(ctx.position as f64)
                    }
                }
            }
            "last" => {
                check_arity(name, args, 0, 0)?;
                if self.predicate_depth == 0 {
                    self.deps.position_sensitive = true;
                }
                XPathValue::Number(ctx.size as f64)
            }
            "count" => {
                check_arity(name, args, 1, 1)?;
                match &values[0] {
                    XPathValue::Nodes(nodes) => XPathValue::Number(nodes.len() as f64),
                    _ => return Err(invalid(name, "expected a node-set")),
                }
            }
            "string" => {
                check_arity(name, args, 0, 1)?;
                let s = match values.first() {
                    Some(v) => self.to_string(v),
                    None => self.string_of_node(ctx.node),
                };
                XPathValue::String(s)
            }
            "concat" => {
                let mut out = String::new();
                for v in &values {
                    out.push_str(&self.to_string(v));
                }
                XPathValue::String(out)
            }
            "number" => {
                check_arity(name, args, 0, 1)?;
                let n = match values.first() {
                    Some(v) => self.to_number(v),
                    None => parse_number(&self.string_of_node(ctx.node)),
                };
                XPathValue::Number(n)
            }
            "boolean" => {
                check_arity(name, args, 1, 1)?;
                XPathValue::Boolean(self.to_boolean(&values[0]))
            }
            "boolean-from-string" => {
                check_arity(name, args, 1, 1)?;
                let s = self.to_string(&values[0]);
                XPathValue::Boolean(s == "true" || s == "1")
            }
            "not" => {
                check_arity(name, args, 1, 1)?;
                XPathValue::Boolean(!self.to_boolean(&values[0]))
            }
            "true" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::Boolean(true)
            }
            "false" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::Boolean(false)
            }
            "sum" => {
                check_arity(name, args, 1, 1)?;
                if !matches!(values[0], XPathValue::Nodes(_)) {
                    return Err(invalid(name, "expected a node-set"));
                }
                let total = self
                    .node_strings(&values[0])
                    .iter()
                    .map(|s| parse_number(s))
                    .sum();
                XPathValue::Number(total)
            }
            "string-length" => {
                check_arity(name, args, 0, 1)?;
                let s = match values.first() {
                    Some(v) => self.to_string(v),
                    None => self.string_of_node(ctx.node),
                };
                XPathValue::Number(s.chars().count() as f64)
            }
            "normalize-space" => {
                check_arity(name, args, 0, 1)?;
                let s = match values.first() {
                    Some(v) => self.to_string(v),
                    None => self.string_of_node(ctx.node),
                };
                XPathValue::String(s.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            "contains" | "starts-with" | "ends-with" | "substring-before" | "substring-after" => {
                check_arity(name, args, 2, 2)?;
                let haystack = self.to_string(&values[0]);
                let needle = self.to_string(&values[1]);
                match name {
                    "contains" => XPathValue::Boolean(haystack.contains(&needle)),
                    "starts-with" => XPathValue::Boolean(haystack.starts_with(&needle)),
                    "ends-with" => XPathValue::Boolean(haystack.ends_with(&needle)),
                    "substring-before" => XPathValue::String(
                        haystack
                            .split_once(&needle)
                            .map(|(before, _)| before.to_string())
                            .unwrap_or_default(),
                    ),
                    _ => XPathValue::String(
                        haystack
                            .split_once(&needle)
                            .map(|(_, after)| after.to_string())
                            .unwrap_or_default(),
                    ),
                }
            }
            "substring" => {
                check_arity(name, args, 2, 3)?;
                let s = self.to_string(&values[0]);
                let start = xpath_round(self.to_number(&values[1]));
                let end = match values.get(2) {
                    Some(len) => start + xpath_round(self.to_number(len)),
                    None => f64::INFINITY,
                };
                let out: String = s
                    .chars()
                    .enumerate()
                    .filter(|(i, _)| {
                        let p = (*i + 1) as f64;
                        p >= start && p < end
                    })
                    .map(|(_, c)| c)
                    .collect();
                XPathValue::String(out)
            }
            "translate" => {
                check_arity(name, args, 3, 3)?;
                let s = self.to_string(&values[0]);
                let from: Vec<char> = self.to_string(&values[1]).chars().collect();
                let to: Vec<char> = self.to_string(&values[2]).chars().collect();
                let out: String = s
                    .chars()
                    .filter_map(|c| match from.iter().position(|f| *f == c) {
                        Some(i) => to.get(i).copied(),
                        None => Some(c),
                    })
                    .collect();
                XPathValue::String(out)
            }
            "round" | "floor" | "ceiling" | "int" | "abs" => {
                check_arity(name, args, 1, 1)?;
                let n = self.to_number(&values[0]);
                XPathValue::Number(match name {
                    "round" => xpath_round(n),
                    "floor" => n.floor(),
                    "ceiling" => n.ceil(),
                    "int" => n.trunc(),
                    _ => n.abs(),
                })
            }
            "coalesce" => {
                check_arity(name, args, 2, 2)?;
                let first = self.to_string(&values[0]);
                if first.is_empty() {
                    XPathValue::String(self.to_string(&values[1]))
                } else {
                    XPathValue::String(first)
                }
            }
            "selected" => {
                check_arity(name, args, 2, 2)?;
                let list = self.to_string(&values[0]);
                let wanted = self.to_string(&values[1]);
                let wanted = wanted.trim();
                XPathValue::Boolean(list.split_whitespace().any(|t| t == wanted))
            }
            "count-selected" => {
                check_arity(name, args, 1, 1)?;
                let list = self.to_string(&values[0]);
                XPathValue::Number(list.split_whitespace().count() as f64)
            }
            "instance" => {
                check_arity(name, args, 1, 1)?;
                let id = self.to_string(&values[0]);
                match self.doc.secondary_root(&id) {
                    Some(root) => XPathValue::Nodes(vec![NodeRef::Element(root)]),
                    None => XPathValue::Nodes(Vec::new()),
                }
            }
            "current" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::Nodes(vec![NodeRef::Element(self.current)])
            }
            "regex" => {
                check_arity(name, args, 2, 2)?;
                let value = self.to_string(&values[0]);
                let pattern = self.to_string(&values[1]);
                let re = Regex::new(&pattern).map_err(|e| invalid(name, &e.to_string()))?;
                XPathValue::Boolean(re.is_match(&value))
            }
            "today" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::String(chrono::Local::now().format("%Y-%m-%d").to_string())
            }
            "now" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::String(chrono::Local::now().to_rfc3339())
            }
            "min" | "max" => {
                let mut numbers = Vec::new();
                for v in &values {
                    numbers.extend(self.node_strings(v).iter().map(|s| parse_number(s)));
                }
                let n = if numbers.is_empty() || numbers.iter().any(|n| n.is_nan()) {
                    f64::NAN
                } else if name == "min" {
                    numbers.into_iter().fold(f64::INFINITY, f64::min)
                } else {
                    numbers.into_iter().fold(f64::NEG_INFINITY, f64::max)
                };
                XPathValue::Number(n)
            }
            "join" => {
                if values.is_empty() {
                    return Err(invalid(name, "expected a separator"));
                }
                let separator = self.to_string(&values[0]);
                let mut parts = Vec::new();
                for v in &values[1..] {
                    parts.extend(self.node_strings(v));
                }
                XPathValue::String(parts.join(&separator))
            }
            "uuid" => {
                check_arity(name, args, 0, 0)?;
                XPathValue::String(uuid::Uuid::new_v4().to_string())
            }
            _ => return Err(ExprError::UnknownFunction(name.to_string())),
        };
        Ok(value)
    }

    fn single_element(&self, function: &str, value: &XPathValue) -> ExprResult<NodeId> {
        match value {
            XPathValue::Nodes(nodes) => nodes
                .iter()
                .find_map(|n| n.element())
                .ok_or_else(|| invalid(function, "empty node-set")),
            _ => Err(invalid(function, "expected a node-set")),
        }
    }
}

fn check_arity(name: &str, args: &[Expr], min: usize, max: usize) -> ExprResult<()> {
    if args.len() < min || args.len() > max {
        return Err(invalid(
            name,
            &format!("expected {}..={} arguments, got {}", min, max, args.len()),
        ));
    }
    Ok(())
}

fn invalid(function: &str, message: &str) -> ExprError {
    ExprError::InvalidArguments {
        function: function.to_string(),
        message: message.to_string(),
    }
}

fn xpath_round(n: f64) -> f64 {
    if n.is_finite() {
        (n + 0.5).floor()
    } else {
        n
    }
}

/// XPath `number()` applied to a string: only plain decimal notation parses.
pub(crate) fn parse_number(s: &str) -> f64 {
    let s = s.trim();
    let digits = s.strip_prefix('-').unwrap_or(s);
    let valid = !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.matches('.').count() <= 1;
    if valid {
        s.parse().unwrap_or(f64::NAN)
    } else {
        f64::NAN
    }
}

fn atomic_string(value: &XPathValue) -> String {
    match value {
        XPathValue::String(s) => s.clone(),
        XPathValue::Number(n) => format_number(*n),
        XPathValue::Boolean(b) => b.to_string(),
        XPathValue::Nodes(_) => String::new(),
    }
}

fn atomic_number(value: &XPathValue) -> f64 {
    match value {
        XPathValue::String(s) => parse_number(s),
        XPathValue::Number(n) => *n,
        XPathValue::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        XPathValue::Nodes(_) => f64::NAN,
    }
}

fn atomic_boolean(value: &XPathValue) -> bool {
    match value {
        XPathValue::String(s) => !s.is_empty(),
        XPathValue::Number(n) => *n != 0.0 && !n.is_nan(),
        XPathValue::Boolean(b) => *b,
        XPathValue::Nodes(nodes) => !nodes.is_empty(),
    }
}

fn compare_atomic(op: BinaryOperator, left: &XPathValue, right: &XPathValue) -> bool {
    match op {
        BinaryOperator::Equal | BinaryOperator::NotEqual => {
            let equal = if matches!(left, XPathValue::Boolean(_))
                || matches!(right, XPathValue::Boolean(_))
            {
                atomic_boolean(left) == atomic_boolean(right)
            } else if matches!(left, XPathValue::Number(_))
                || matches!(right, XPathValue::Number(_))
            {
                atomic_number(left) == atomic_number(right)
            } else {
                atomic_string(left) == atomic_string(right)
            };
            (op == BinaryOperator::Equal) == equal
        }
        _ => {
            let (a, b) = (atomic_number(left), atomic_number(right));
            match a.partial_cmp(&b) {
                None => false,
                Some(ordering) => match op {
                    BinaryOperator::LessThan => ordering == Ordering::Less,
                    BinaryOperator::LessThanEqual => ordering != Ordering::Greater,
                    BinaryOperator::GreaterThan => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            }
        }
    }
}
