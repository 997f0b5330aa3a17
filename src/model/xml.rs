//! XML reading and writing for instance documents.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::node::{Attribute, NodeId, QName};
use super::{template_attr, Document, ModelError, ModelResult};

/// Parses `source` into `doc` as a detached tree and returns its root.
///
/// With `trim` set, whitespace around text content is dropped. Text that sits
/// next to element children is never kept.
pub fn parse_detached(doc: &mut Document, source: &str, trim: bool) -> ModelResult<NodeId> {
    let mut reader = Reader::from_str(source);
    reader.trim_text(trim);

    let mut stack: Vec<NodeId> = Vec::new();
    let mut root: Option<NodeId> = None;

    loop {
        let position = reader.buffer_position();
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let id = element_from(doc, e, position)?;
                attach(doc, &stack, &mut root, id);
                stack.push(id);
            }
            Ok(Event::Empty(ref e)) => {
                let id = element_from(doc, e, position)?;
                attach(doc, &stack, &mut root, id);
            }
            Ok(Event::End(_)) => {
                if let Some(closed) = stack.pop() {
                    if !doc.is_leaf(closed) {
                        doc.set_text_raw(closed, String::new());
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if let Some(current) = stack.last().copied() {
                    let text = e.unescape().map_err(|err| xml_error(position, err))?;
                    let mut value = doc.text(current).to_string();
                    value.push_str(&text);
                    doc.set_text_raw(current, value);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = stack.last().copied() {
                    let raw = e.into_inner();
                    let mut value = doc.text(current).to_string();
                    value.push_str(&String::from_utf8_lossy(&raw));
                    doc.set_text_raw(current, value);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(xml_error(position, err)),
        }
    }

    root.ok_or(ModelError::EmptyDocument)
}

fn attach(doc: &mut Document, stack: &[NodeId], root: &mut Option<NodeId>, id: NodeId) {
    match stack.last() {
        Some(parent) => doc.append_child(*parent, id),
        None => {
            if root.is_none() {
                *root = Some(id);
            }
        }
    }
}

fn element_from(doc: &mut Document, start: &BytesStart, position: usize) -> ModelResult<NodeId> {
    let name = qname_from_bytes(start.name().as_ref());
    let id = doc.create_element(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|err| xml_error(position, err))?;
        let key = qname_from_bytes(attr.key.as_ref());
        let value = attr
            .unescape_value()
            .map_err(|err| xml_error(position, err))?;
        doc.set_attribute(id, key, value.into_owned());
    }
    Ok(id)
}

fn qname_from_bytes(raw: &[u8]) -> QName {
    QName::parse(&String::from_utf8_lossy(raw))
}

fn xml_error(position: usize, err: impl std::fmt::Display) -> ModelError {
    ModelError::Xml {
        position,
        message: err.to_string(),
    }
}

/// Writes the subtree at `node`. Nodes rejected by `include` are skipped with
/// their descendants, and unfilled repeat templates are always skipped.
pub fn write(doc: &Document, node: NodeId, include: &dyn Fn(NodeId) -> bool) -> String {
    let mut out = String::new();
    write_node(doc, node, include, true, &mut out);
    out
}

/// Writes the subtree at `node` as stored, templates included.
pub fn write_verbatim(doc: &Document, node: NodeId) -> String {
    let mut out = String::new();
    write_node(doc, node, &|_| true, false, &mut out);
    out
}

fn write_node(
    doc: &Document,
    node: NodeId,
    include: &dyn Fn(NodeId) -> bool,
    skip_templates: bool,
    out: &mut String,
) {
    if doc.is_removed(node) || !include(node) {
        return;
    }
    if skip_templates && doc.attribute(node, &template_attr()).is_some() {
        return;
    }
    let name = doc.name(node).to_string();
    out.push('<');
    out.push_str(&name);
    for Attribute { name, value } in doc.attributes(node) {
        out.push(' ');
        out.push_str(&name.to_string());
        out.push_str("=\"");
        out.push_str(&escape(value.as_str()));
        out.push('"');
    }

    let children = doc.children(node);
    if children.is_empty() && doc.text(node).is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    if children.is_empty() {
        out.push_str(&escape(doc.text(node)));
    } else {
        for child in children {
            write_node(doc, *child, include, skip_templates, out);
        }
    }
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_keeps_attributes_and_escapes() {
        let source = r#"<data xmlns:jr="http://openrosa.org/javarosa" id="f"><a>x &amp; y</a><b/></data>"#;
        let doc = Document::from_xml(source).unwrap();
        assert_eq!(doc.to_xml(), source);
    }

    #[test]
    fn test_templates_are_not_written() {
        let doc = Document::from_xml(
            r#"<data><rep jr:template=""><q/></rep><rep><q>1</q></rep></data>"#,
        )
        .unwrap();
        assert_eq!(doc.to_xml(), "<data><rep><q>1</q></rep></data>");
        assert_eq!(
            write_verbatim(&doc, doc.root()),
            r#"<data><rep jr:template=""><q/></rep><rep><q>1</q></rep></data>"#
        );
    }

    #[test]
    fn test_untrimmed_parse_keeps_leaf_whitespace() {
        let mut doc = Document::new(QName::new("scratch"));
        let root = parse_detached(&mut doc, "<r>\n  <a>  v </a>\n</r>", false).unwrap();
        let a = doc.children(root)[0];
        assert_eq!(doc.text(a), "  v ");
        assert_eq!(doc.text(root), "");
    }

    #[test]
    fn test_malformed_xml_is_reported() {
        let result = Document::from_xml("<data><a></b></data>");
        assert!(matches!(result, Err(ModelError::Xml { .. })));
    }

    #[test]
    fn test_cdata_is_text() {
        let doc = Document::from_xml("<data><a><![CDATA[<b>]]></a></data>").unwrap();
        let a = doc.get_node("/data/a", 0).unwrap();
        assert_eq!(doc.text(a), "<b>");
    }
}
