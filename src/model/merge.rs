//! # Record Merge
//!
//! Overlays a previously saved record onto the default instance. The schema
//! (default instance) decides node order, namespaces and shape; the record
//! supplies values and the number of repeat instances.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::node::{NodeId, QName};
use super::{template_attr, xml, Document};
use crate::error::LoadError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeOptions {
    /// Move the record's instanceID to deprecatedID and issue a fresh one.
    #[serde(default = "default_true")]
    pub deprecate_instance_id: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            deprecate_instance_id: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Merges `record` into the primary instance of `doc` in place.
///
/// All structural problems are collected and returned together; on error the
/// document is left untouched.
#[instrument(level = "debug", skip(doc, record, repeat_paths))]
pub fn merge_record(
    doc: &mut Document,
    record: &str,
    repeat_paths: &BTreeSet<String>,
    options: &MergeOptions,
) -> Result<(), Vec<LoadError>> {
    let record_root = xml::parse_detached(doc, record, false)
        .map_err(|e| vec![LoadError::MalformedRecord(e.to_string())])?;

    let mut errors = Vec::new();
    let schema_root = doc.root();
    let schema_name = doc.name(schema_root).clone();
    let record_name = doc.name(record_root).clone();
    if schema_name.local != record_name.local {
        errors.push(LoadError::DifferentRootNodes {
            expected: schema_name.to_string(),
            found: record_name.to_string(),
        });
    }

    let record_ids = identity_nodes(doc, record_root);
    let schema_ids = doc.meta_nodes("instanceID");
    if !record_ids.is_empty() && schema_ids.len() != 1 {
        errors.push(LoadError::MissingInstanceId {
            found: schema_ids.len(),
        });
    }
    if record_ids.len() > 1 {
        errors.push(LoadError::DuplicateInstanceId {
            count: record_ids.len(),
        });
    }
    if !errors.is_empty() {
        doc.remove_subtree(record_root);
        return Err(errors);
    }

    let old_id = record_ids
        .first()
        .map(|n| doc.text(*n).trim().to_string())
        .filter(|v| !v.is_empty());

    let root_path = format!("/{}", schema_name);
    let merged = merge_node(doc, schema_root, Some(record_root), &root_path, repeat_paths);
    doc.remove_subtree(record_root);
    doc.replace_root(merged);

    if options.deprecate_instance_id {
        if let Some(old_id) = old_id {
            let deprecated = doc.ensure_meta_node("deprecatedID");
            doc.set_text_raw(deprecated, old_id);
            if let Some(instance_id) = doc.meta_node("instanceID") {
                doc.set_text_raw(instance_id, new_instance_id());
            }
        }
    }
    Ok(())
}

pub fn new_instance_id() -> String {
    format!("uuid:{}", uuid::Uuid::new_v4())
}

fn identity_nodes(doc: &Document, root: NodeId) -> Vec<NodeId> {
    doc.children(root)
        .iter()
        .filter(|c| doc.name(**c).local == "meta")
        .flat_map(|m| doc.children(*m).iter().copied())
        .filter(|c| doc.name(*c).local == "instanceID")
        .collect()
}

fn merge_node(
    doc: &mut Document,
    schema: NodeId,
    record: Option<NodeId>,
    path: &str,
    repeat_paths: &BTreeSet<String>,
) -> NodeId {
    let merged = doc.create_element(doc.name(schema).clone());
    for attr in doc.attributes(schema).to_vec() {
        if attr.name != template_attr() {
            doc.set_attribute(merged, attr.name, attr.value);
        }
    }
    if let Some(record) = record {
        for attr in doc.attributes(record).to_vec() {
            if attr.name != template_attr() {
                doc.set_attribute(merged, attr.name, attr.value);
            }
        }
    }

    let schema_children = doc.children(schema).to_vec();
    if schema_children.is_empty() {
        let value = match record {
            Some(record) => {
                if !doc.is_leaf(record) {
                    debug!(path, "record has children where the schema has a leaf");
                }
                let text = doc.text(record);
                if text.trim().is_empty() {
                    String::new()
                } else {
                    text.to_string()
                }
            }
            None => doc.text(schema).to_string(),
        };
        doc.set_text_raw(merged, value);
        return merged;
    }

    let record_children: Vec<NodeId> = record
        .map(|r| doc.children(r).to_vec())
        .unwrap_or_default();
    // An empty record element means "populate from the schema, values empty".
    let record_is_empty = record.is_some() && record_children.is_empty();

    let mut handled: Vec<QName> = Vec::new();
    for schema_child in &schema_children {
        let name = doc.name(*schema_child).clone();
        if handled.contains(&name) {
            continue;
        }
        handled.push(name.clone());

        let child_path = format!("{}/{}", path, name);
        let matches: Vec<NodeId> = record_children
            .iter()
            .copied()
            .filter(|c| doc.name(*c).local == name.local)
            .collect();

        if repeat_paths.contains(&child_path) {
            let template = schema_children
                .iter()
                .copied()
                .find(|c| {
                    doc.name(*c) == &name && doc.attribute(*c, &template_attr()).is_some()
                })
                .unwrap_or(*schema_child);
            if matches.is_empty() {
                let instance = merge_node(doc, template, None, &child_path, repeat_paths);
                doc.clear_values(instance);
                doc.append_child(merged, instance);
            } else {
                for record_instance in matches {
                    let instance = merge_node(
                        doc,
                        template,
                        Some(record_instance),
                        &child_path,
                        repeat_paths,
                    );
                    doc.append_child(merged, instance);
                }
            }
            continue;
        }

        let child = match matches.first() {
            Some(record_child) => merge_node(
                doc,
                *schema_child,
                Some(*record_child),
                &child_path,
                repeat_paths,
            ),
            None => {
                let child = merge_node(doc, *schema_child, None, &child_path, repeat_paths);
                if record_is_empty {
                    doc.clear_values(child);
                }
                child
            }
        };
        doc.append_child(merged, child);
    }

    for record_child in record_children {
        let name = doc.name(record_child);
        if !handled.iter().any(|h| h.local == name.local) {
            debug!(path, node = %name, "dropping record node unknown to the schema");
        }
    }
    merged
}
