//! # Document Model
//!
//! The record is held as an arena of element nodes. A [`Document`] owns one
//! primary instance (the record that is edited and submitted) and any number
//! of read-only secondary instances used as lookup sources.
//!
//! Nodes are addressed by [`NodeId`]. Removal marks a subtree as removed and
//! detaches it; ids are never reused, so stale ids held by the cascade simply
//! stop resolving.

mod document;
pub mod merge;
mod node;
pub mod xml;

pub use document::Document;
pub use merge::{merge_record, MergeOptions};
pub use node::{Attribute, NodeId, QName};

use thiserror::Error;

/// Namespace of the ordinal bookkeeping attributes.
pub const ORDINAL_NAMESPACE: &str = "http://enketo.org/xforms";
pub const ORDINAL_PREFIX: &str = "enk";

pub fn template_attr() -> QName {
    QName::prefixed("jr", "template")
}

pub fn ordinal_attr() -> QName {
    QName::prefixed(ORDINAL_PREFIX, "ordinal")
}

pub fn last_used_ordinal_attr() -> QName {
    QName::prefixed(ORDINAL_PREFIX, "last-used-ordinal")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Malformed XML at byte {position}: {message}")]
    Xml { position: usize, message: String },
    #[error("Document has no root element")]
    EmptyDocument,
    #[error("Node {path} is not a leaf and cannot hold a value")]
    NotALeaf { path: String },
    #[error("Node not found: {path}[{index}]")]
    NodeNotFound { path: String, index: usize },
    #[error("Secondary instance '{0}' already exists")]
    DuplicateInstance(String),
}

pub type ModelResult<T> = Result<T, ModelError>;
