//! # Expression Language
//!
//! Forms express calculations, relevance, constraints and choice-list
//! sources in an XPath 1.0 dialect. This module holds the AST, a `nom`
//! parser, and [`ExpressionEvaluator`]: the service the cascade consumes to
//! evaluate an expression against a context node and learn which parts of the
//! document it read.
//!
//! [`XPathEvaluator`] is the bundled implementation. Any other engine can be
//! plugged into a [`Form`](crate::Form) as long as it reports
//! [`Dependencies`] faithfully.

pub mod ast;
pub mod evaluator;
pub mod parser;

use std::collections::HashSet;

pub use ast::{Axis, BinaryOperator, Expr, LocationPath, NodeTest, Step};
pub use evaluator::XPathEvaluator;
pub use parser::parse_expression;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Document, NodeId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("Failed to parse '{expression}': {message}")]
    Parse { expression: String, message: String },
    #[error("Evaluation failed: {0}")]
    Eval(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Invalid arguments for {function}(): {message}")]
    InvalidArguments { function: String, message: String },
    #[error("Type error: {0}")]
    Type(String),
}

pub type ExprResult<T> = Result<T, ExprError>;

/// Result type requested from an evaluation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResultType {
    String,
    Boolean,
    Number,
    Nodes,
}

/// A node as seen by expressions: the document node, an element, or one
/// attribute of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Document,
    Element(NodeId),
    Attribute(NodeId, usize),
}

impl NodeRef {
    pub fn element(&self) -> Option<NodeId> {
        match self {
            NodeRef::Element(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum XPathValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Nodes(Vec<NodeRef>),
}

impl XPathValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XPathValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            XPathValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            XPathValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_nodes(self) -> Vec<NodeRef> {
        match self {
            XPathValue::Nodes(nodes) => nodes,
            _ => Vec::new(),
        }
    }
}

/// What one evaluation read from the primary instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    /// Nodes whose value was read.
    pub nodes: HashSet<NodeId>,
    /// Template paths of enumerated child sets, e.g. `/data/rep`, or
    /// `/data/*` for wildcard enumerations.
    pub structures: HashSet<String>,
    /// Template paths below which descendants were enumerated.
    pub deep_structures: HashSet<String>,
    /// The result depends on sibling positions (`position()`, `last()`,
    /// sibling axes).
    pub position_sensitive: bool,
}

impl Dependencies {
    pub fn merge(&mut self, other: Dependencies) {
        self.nodes.extend(other.nodes);
        self.structures.extend(other.structures);
        self.deep_structures.extend(other.deep_structures);
        self.position_sensitive |= other.position_sensitive;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.structures.is_empty()
            && self.deep_structures.is_empty()
            && !self.position_sensitive
    }

    /// Whether a structural change to the series at `series_path` can alter
    /// the result.
    pub fn touches_structure(&self, series_path: &str) -> bool {
        if self.position_sensitive || self.structures.contains(series_path) {
            return true;
        }
        if let Some((parent, _)) = series_path.rsplit_once('/') {
            if self.structures.contains(&format!("{}/*", parent)) {
                return true;
            }
        }
        self.deep_structures
            .iter()
            .any(|deep| series_path.starts_with(&format!("{}/", deep)))
    }
}

/// Evaluation service consumed by the cascade, resolver and itemsets.
pub trait ExpressionEvaluator {
    /// Evaluates `expr` with `context` as the context node and converts the
    /// result to `result_type`.
    fn evaluate(
        &self,
        doc: &Document,
        expr: &Expr,
        result_type: ResultType,
        context: NodeId,
    ) -> ExprResult<(XPathValue, Dependencies)>;
}
