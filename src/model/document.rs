use std::collections::BTreeMap;

use tracing::trace;

use super::node::{Attribute, NodeData, NodeId, QName};
use super::{xml, ModelError, ModelResult};

/// Hierarchical record: primary instance plus read-only secondary instances.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<NodeData>,
    root: NodeId,
    secondary: BTreeMap<String, NodeId>,
}

impl Document {
    /// Creates a document whose primary instance is a single empty root.
    pub fn new(root_name: QName) -> Self {
        Self {
            nodes: vec![NodeData::new(root_name)],
            root: NodeId(0),
            secondary: BTreeMap::new(),
        }
    }

    /// Parses the default instance. Leaf text is trimmed here and nowhere else.
    pub fn from_xml(source: &str) -> ModelResult<Self> {
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            secondary: BTreeMap::new(),
        };
        let root = xml::parse_detached(&mut doc, source, true)?;
        doc.root = root;
        Ok(doc)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Swaps in a new primary root and retires the old tree.
    pub(crate) fn replace_root(&mut self, new_root: NodeId) {
        let old = self.root;
        if old != new_root {
            self.mark_removed(old);
        }
        self.nodes[new_root.0].parent = None;
        self.root = new_root;
    }

    pub fn add_secondary_instance(&mut self, id: &str, source: &str) -> ModelResult<NodeId> {
        if self.secondary.contains_key(id) {
            return Err(ModelError::DuplicateInstance(id.to_string()));
        }
        let root = xml::parse_detached(self, source, true)?;
        self.secondary.insert(id.to_string(), root);
        Ok(root)
    }

    pub fn secondary_root(&self, id: &str) -> Option<NodeId> {
        self.secondary.get(id).copied()
    }

    // ---- node creation and structure ----

    pub fn create_element(&mut self, name: QName) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData::new(name));
        id
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        let len = self.nodes[parent.0].children.len();
        self.insert_child(parent, len, child);
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        let children = &mut self.nodes[parent.0].children;
        let index = index.min(children.len());
        children.insert(index, child);
        self.nodes[child.0].parent = Some(parent);
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != node);
        }
    }

    /// Detaches `node` and marks its whole subtree removed.
    pub fn remove_subtree(&mut self, node: NodeId) {
        self.detach(node);
        self.mark_removed(node);
    }

    fn mark_removed(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let data = &mut self.nodes[current.0];
            data.removed = true;
            stack.extend(data.children.iter().copied());
        }
    }

    /// Copies a subtree. The copy is detached until inserted.
    pub fn deep_clone(&mut self, node: NodeId) -> NodeId {
        let data = &self.nodes[node.0];
        let name = data.name.clone();
        let attributes = data.attributes.clone();
        let text = data.text.clone();
        let children = data.children.clone();

        let copy = self.create_element(name);
        self.nodes[copy.0].attributes = attributes;
        self.nodes[copy.0].text = text;
        for child in children {
            let child_copy = self.deep_clone(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    /// Clears every leaf value under `node` (inclusive).
    pub fn clear_values(&mut self, node: NodeId) {
        for id in self.descendants_or_self(node) {
            if self.is_leaf(id) {
                self.nodes[id.0].text.clear();
            }
        }
    }

    // ---- accessors ----

    pub fn name(&self, node: NodeId) -> &QName {
        &self.nodes[node.0].name
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node.0].children
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    pub fn text(&self, node: NodeId) -> &str {
        &self.nodes[node.0].text
    }

    pub(crate) fn set_text_raw(&mut self, node: NodeId, text: String) {
        self.nodes[node.0].text = text;
    }

    pub fn attributes(&self, node: NodeId) -> &[Attribute] {
        &self.nodes[node.0].attributes
    }

    pub fn attribute(&self, node: NodeId, name: &QName) -> Option<&str> {
        self.nodes[node.0]
            .attributes
            .iter()
            .find(|a| a.name == *name)
            .map(|a| a.value.as_str())
    }

    pub fn set_attribute(&mut self, node: NodeId, name: QName, value: impl Into<String>) {
        let value = value.into();
        let attributes = &mut self.nodes[node.0].attributes;
        match attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => attributes.push(Attribute::new(name, value)),
        }
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &QName) -> bool {
        let attributes = &mut self.nodes[node.0].attributes;
        let before = attributes.len();
        attributes.retain(|a| a.name != *name);
        attributes.len() != before
    }

    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.nodes[node.0].children.is_empty()
    }

    pub fn is_removed(&self, node: NodeId) -> bool {
        self.nodes
            .get(node.0)
            .map(|n| n.removed)
            .unwrap_or(true)
    }

    /// True when `node` is reachable from the primary root.
    pub fn is_attached(&self, node: NodeId) -> bool {
        self.top_of(node) == self.root && !self.is_removed(node)
    }

    fn top_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        while let Some(parent) = self.nodes[current.0].parent {
            current = parent;
        }
        current
    }

    /// XPath string-value: the concatenated text of all descendant leaves.
    pub fn string_value(&self, node: NodeId) -> String {
        if self.is_leaf(node) {
            return self.nodes[node.0].text.clone();
        }
        let mut out = String::new();
        for id in self.descendants_or_self(node) {
            if self.is_leaf(id) {
                out.push_str(&self.nodes[id.0].text);
            }
        }
        out
    }

    /// Sets a leaf value. Returns `false` when the stored value is identical.
    pub fn set_value(&mut self, node: NodeId, value: &str) -> ModelResult<bool> {
        if !self.is_leaf(node) {
            return Err(ModelError::NotALeaf {
                path: self.template_path(node),
            });
        }
        if self.nodes[node.0].text == value {
            return Ok(false);
        }
        trace!(node = node.0, value, "set_value");
        self.nodes[node.0].text = value.to_string();
        Ok(true)
    }

    // ---- traversal ----

    /// Subtree in document order, starting with `node`.
    pub fn descendants_or_self(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            for child in self.nodes[current.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Ancestors from the parent up to the top of the tree.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes[node.0].parent;
        while let Some(id) = current {
            out.push(id);
            current = self.nodes[id.0].parent;
        }
        out
    }

    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        node == ancestor || self.ancestors(node).contains(&ancestor)
    }

    /// Same-named siblings forming the run that contains `node`.
    pub fn same_name_siblings(&self, node: NodeId) -> Vec<NodeId> {
        let name = &self.nodes[node.0].name;
        match self.nodes[node.0].parent {
            Some(parent) => self.nodes[parent.0]
                .children
                .iter()
                .copied()
                .filter(|c| self.nodes[c.0].name == *name)
                .collect(),
            None => vec![node],
        }
    }

    /// 1-based position among same-named siblings.
    pub fn position(&self, node: NodeId) -> usize {
        self.same_name_siblings(node)
            .iter()
            .position(|n| *n == node)
            .map(|p| p + 1)
            .unwrap_or(1)
    }

    pub fn child_index(&self, node: NodeId) -> Option<usize> {
        let parent = self.nodes[node.0].parent?;
        self.nodes[parent.0].children.iter().position(|c| *c == node)
    }

    /// Sort key that orders nodes by document order across instances.
    pub fn order_key(&self, node: NodeId) -> Vec<usize> {
        let mut key = Vec::new();
        let mut current = node;
        while let Some(parent) = self.nodes[current.0].parent {
            key.push(
                self.nodes[parent.0]
                    .children
                    .iter()
                    .position(|c| *c == current)
                    .unwrap_or(0),
            );
            current = parent;
        }
        let rank = if current == self.root {
            0
        } else {
            self.secondary
                .values()
                .position(|r| *r == current)
                .map(|p| p + 1)
                .unwrap_or(usize::MAX)
        };
        key.push(rank);
        key.reverse();
        key
    }

    // ---- paths ----

    /// Name path without positions, e.g. `/data/rep/q`.
    pub fn template_path(&self, node: NodeId) -> String {
        let mut names = vec![self.nodes[node.0].name.to_string()];
        for ancestor in self.ancestors(node) {
            names.push(self.nodes[ancestor.0].name.to_string());
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// All primary-instance nodes at a template path, in document order.
    pub fn nodes_at_path(&self, path: &str) -> Vec<NodeId> {
        let mut segments = path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(QName::parse);
        let Some(first) = segments.next() else {
            return Vec::new();
        };
        if !self.name(self.root).matches(&first) {
            return Vec::new();
        }
        let mut current = vec![self.root];
        for segment in segments {
            current = current
                .iter()
                .flat_map(|n| self.nodes[n.0].children.iter().copied())
                .filter(|c| self.nodes[c.0].name.matches(&segment))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    pub fn get_node(&self, path: &str, index: usize) -> Option<NodeId> {
        self.nodes_at_path(path).get(index).copied()
    }

    /// 0-based index among all nodes sharing this node's template path.
    pub fn index_of(&self, node: NodeId) -> usize {
        self.nodes_at_path(&self.template_path(node))
            .iter()
            .position(|n| *n == node)
            .unwrap_or(0)
    }

    // ---- identity ----

    fn meta(&self) -> Option<NodeId> {
        self.children(self.root)
            .iter()
            .copied()
            .find(|c| self.name(*c).local == "meta")
    }

    /// Child of `/*/meta` with the given local name.
    pub fn meta_node(&self, local: &str) -> Option<NodeId> {
        let meta = self.meta()?;
        self.children(meta)
            .iter()
            .copied()
            .find(|c| self.name(*c).local == local)
    }

    pub(crate) fn meta_nodes(&self, local: &str) -> Vec<NodeId> {
        self.children(self.root)
            .iter()
            .filter(|c| self.name(**c).local == "meta")
            .flat_map(|m| self.children(*m).iter().copied())
            .filter(|c| self.name(*c).local == local)
            .collect()
    }

    /// Creates `/*/meta/<local>` if absent, reusing the meta element's prefix.
    pub(crate) fn ensure_meta_node(&mut self, local: &str) -> NodeId {
        if let Some(existing) = self.meta_node(local) {
            return existing;
        }
        let meta = match self.meta() {
            Some(meta) => meta,
            None => {
                let meta = self.create_element(QName::new("meta"));
                let root = self.root;
                self.append_child(root, meta);
                meta
            }
        };
        let prefix = self.name(meta).prefix.clone();
        let name = QName {
            prefix,
            local: local.to_string(),
        };
        let node = self.create_element(name);
        self.append_child(meta, node);
        node
    }

    pub fn instance_id(&self) -> Option<String> {
        self.meta_node("instanceID")
            .map(|n| self.text(n).to_string())
    }

    pub fn deprecated_id(&self) -> Option<String> {
        self.meta_node("deprecatedID")
            .map(|n| self.text(n).to_string())
    }

    pub fn instance_name(&self) -> Option<String> {
        self.meta_node("instanceName")
            .map(|n| self.text(n).to_string())
            .filter(|s| !s.is_empty())
    }

    /// Serializes the primary instance without any relevance filtering.
    pub fn to_xml(&self) -> String {
        xml::write(self, self.root, &|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        Document::from_xml(
            r#"<data><a> x </a><rep><q>1</q></rep><rep><q>2</q></rep><meta><instanceID/></meta></data>"#,
        )
        .unwrap()
    }

    #[test]
    fn test_default_instance_is_trimmed() {
        let doc = sample();
        let a = doc.get_node("/data/a", 0).unwrap();
        assert_eq!(doc.text(a), "x");
    }

    #[test]
    fn test_set_value_reports_change() {
        let mut doc = sample();
        let a = doc.get_node("/data/a", 0).unwrap();
        assert_eq!(doc.set_value(a, "x"), Ok(false));
        assert_eq!(doc.set_value(a, " y "), Ok(true));
        assert_eq!(doc.text(a), " y ");
    }

    #[test]
    fn test_set_value_on_group_fails() {
        let mut doc = sample();
        let rep = doc.get_node("/data/rep", 0).unwrap();
        assert!(matches!(
            doc.set_value(rep, "v"),
            Err(ModelError::NotALeaf { .. })
        ));
    }

    #[test]
    fn test_paths_and_indices() {
        let doc = sample();
        let q2 = doc.get_node("/data/rep/q", 1).unwrap();
        assert_eq!(doc.text(q2), "2");
        assert_eq!(doc.template_path(q2), "/data/rep/q");
        assert_eq!(doc.index_of(q2), 1);
        let rep2 = doc.parent(q2).unwrap();
        assert_eq!(doc.position(rep2), 2);
        assert!(doc.get_node("/data/rep/q", 2).is_none());
        assert!(doc.get_node("/other/rep", 0).is_none());
    }

    #[test]
    fn test_string_value_concatenates_leaves() {
        let doc = sample();
        assert_eq!(doc.string_value(doc.root()), "x12");
    }

    #[test]
    fn test_remove_subtree_detaches() {
        let mut doc = sample();
        let rep = doc.get_node("/data/rep", 0).unwrap();
        let q = doc.children(rep)[0];
        doc.remove_subtree(rep);
        assert!(doc.is_removed(q));
        assert!(!doc.is_attached(rep));
        assert_eq!(doc.nodes_at_path("/data/rep").len(), 1);
    }

    #[test]
    fn test_order_key_follows_document_order() {
        let doc = sample();
        let a = doc.get_node("/data/a", 0).unwrap();
        let q1 = doc.get_node("/data/rep/q", 0).unwrap();
        let q2 = doc.get_node("/data/rep/q", 1).unwrap();
        assert!(doc.order_key(a) < doc.order_key(q1));
        assert!(doc.order_key(q1) < doc.order_key(q2));
    }

    #[test]
    fn test_meta_nodes() {
        let mut doc = sample();
        assert_eq!(doc.instance_id().as_deref(), Some(""));
        assert!(doc.deprecated_id().is_none());
        let dep = doc.ensure_meta_node("deprecatedID");
        doc.set_value(dep, "uuid:1").unwrap();
        assert_eq!(doc.deprecated_id().as_deref(), Some("uuid:1"));
    }
}
