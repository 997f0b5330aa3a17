//! # Form Definitions
//!
//! Everything a [`Form`](crate::Form) needs besides the record: the default
//! primary instance, secondary instances, repeat series, bindings and
//! dynamic choice lists. Definitions are read from JSON or extracted from
//! an XForm document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::datatype::DataType;
use crate::error::{LoadError, LoadErrors};
use crate::model::{xml, Document, NodeId, QName};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RepeatDef {
    /// Template path of the series, e.g. `/data/household/person`.
    pub path: String,
    /// Expression for the number of instances to keep.
    #[serde(default)]
    pub count: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BindDef {
    pub nodeset: String,
    #[serde(default)]
    pub calculate: Option<String>,
    #[serde(default)]
    pub relevant: Option<String>,
    #[serde(default)]
    pub required: Option<String>,
    #[serde(default)]
    pub readonly: Option<String>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default, rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub constraint_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ItemsetDef {
    /// Template path of the select node.
    pub path: String,
    pub nodeset: String,
    #[serde(default = "default_value_ref")]
    pub value_ref: String,
    #[serde(default = "default_label_ref")]
    pub label_ref: String,
    /// Whether the node holds a space-separated list of values.
    #[serde(default)]
    pub multiple: bool,
}

fn default_value_ref() -> String {
    "name".to_string()
}

fn default_label_ref() -> String {
    "label".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FormDefinition {
    /// XML of the default primary instance.
    pub primary_instance: String,
    /// Secondary instance sources by id.
    #[serde(default)]
    pub secondary_instances: BTreeMap<String, String>,
    #[serde(default)]
    pub repeats: Vec<RepeatDef>,
    #[serde(default)]
    pub binds: Vec<BindDef>,
    #[serde(default)]
    pub itemsets: Vec<ItemsetDef>,
}

impl FormDefinition {
    pub fn from_json(source: &str) -> Result<Self, LoadErrors> {
        let definition: FormDefinition = serde_json::from_str(source)
            .map_err(|e| LoadError::InvalidDefinition(e.to_string()))?;
        definition.check()?;
        Ok(definition)
    }

    /// Extracts a definition from an XForm: the model's instances and binds,
    /// and the body's repeats and itemsets.
    #[instrument(level = "debug", skip(source))]
    pub fn from_xform(source: &str) -> Result<Self, LoadErrors> {
        let doc = Document::from_xml(source)
            .map_err(|e| LoadError::InvalidDefinition(format!("XForm: {}", e)))?;
        let all = doc.descendants_or_self(doc.root());
        let model = all
            .iter()
            .copied()
            .find(|n| doc.name(*n).local == "model")
            .ok_or_else(|| LoadError::InvalidDefinition("XForm has no model".into()))?;

        let mut definition = FormDefinition::default();
        // The first instance is the primary one; the rest are lookups.
        let instances = children_named(&doc, model, "instance");
        let (first, rest) = instances
            .split_first()
            .ok_or_else(|| LoadError::InvalidDefinition("XForm has no instance".into()))?;
        for instance in rest {
            if let Some(id) = doc.attribute(*instance, &QName::new("id")) {
                definition
                    .secondary_instances
                    .insert(id.to_string(), xml::write_verbatim(&doc, *instance));
            }
        }
        let primary = doc
            .children(*first)
            .first()
            .copied()
            .ok_or_else(|| LoadError::InvalidDefinition("primary instance is empty".into()))?;
        definition.primary_instance = xml::write_verbatim(&doc, primary);

        for bind in doc
            .descendants_or_self(model)
            .into_iter()
            .filter(|n| doc.name(*n).local == "bind")
        {
            let attr = |name: &str| doc.attribute(bind, &QName::new(name)).map(str::to_string);
            let Some(nodeset) = attr("nodeset").or_else(|| attr("ref")) else {
                continue;
            };
            definition.binds.push(BindDef {
                nodeset,
                calculate: attr("calculate"),
                relevant: attr("relevant"),
                required: attr("required"),
                readonly: attr("readonly"),
                constraint: attr("constraint"),
                data_type: attr("type")
                    .map(|t| DataType::from_xform(&t))
                    .unwrap_or_default(),
                constraint_message: doc
                    .attribute(bind, &QName::prefixed("jr", "constraintMsg"))
                    .map(str::to_string),
            });
        }

        for node in all.iter().copied() {
            match doc.name(node).local.as_str() {
                "repeat" => {
                    let Some(path) = body_ref(&doc, node) else {
                        continue;
                    };
                    let count = doc
                        .attribute(node, &QName::prefixed("jr", "count"))
                        .map(str::to_string);
                    definition.repeats.push(RepeatDef { path, count });
                }
                "itemset" => {
                    if let Some(itemset) = itemset_def(&doc, node) {
                        definition.itemsets.push(itemset);
                    }
                }
                _ => {}
            }
        }
        debug!(
            secondary = definition.secondary_instances.len(),
            repeats = definition.repeats.len(),
            binds = definition.binds.len(),
            itemsets = definition.itemsets.len(),
            "XForm definition extracted"
        );
        definition.check()?;
        Ok(definition)
    }

    /// Every path must be absolute.
    pub fn check(&self) -> Result<(), LoadErrors> {
        let mut errors = Vec::new();
        let paths = self
            .repeats
            .iter()
            .map(|r| ("repeat", &r.path))
            .chain(self.binds.iter().map(|b| ("bind", &b.nodeset)))
            .chain(self.itemsets.iter().map(|i| ("itemset", &i.path)));
        for (what, path) in paths {
            if !path.starts_with('/') {
                errors.push(LoadError::InvalidDefinition(format!(
                    "{} path '{}' is not absolute",
                    what, path
                )));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

fn children_named(doc: &Document, parent: NodeId, local: &str) -> Vec<NodeId> {
    doc.children(parent)
        .iter()
        .copied()
        .filter(|c| doc.name(*c).local == local)
        .collect()
}

/// The absolute data path a body control refers to, resolving relative
/// references against enclosing groups and repeats.
fn body_ref(doc: &Document, node: NodeId) -> Option<String> {
    let own = reference(doc, node)?;
    if own.starts_with('/') {
        return Some(own);
    }
    for ancestor in doc.ancestors(node) {
        if let Some(base) = reference(doc, ancestor) {
            let base = if base.starts_with('/') {
                base
            } else {
                body_ref(doc, ancestor)?
            };
            return Some(format!("{}/{}", base.trim_end_matches('/'), own));
        }
    }
    None
}

fn reference(doc: &Document, node: NodeId) -> Option<String> {
    doc.attribute(node, &QName::new("nodeset"))
        .or_else(|| doc.attribute(node, &QName::new("ref")))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

fn itemset_def(doc: &Document, itemset: NodeId) -> Option<ItemsetDef> {
    let select = doc.parent(itemset)?;
    let path = body_ref(doc, select)?;
    let nodeset = doc.attribute(itemset, &QName::new("nodeset"))?.to_string();
    let child_ref = |local: &str, default: fn() -> String| {
        children_named(doc, itemset, local)
            .first()
            .and_then(|c| doc.attribute(*c, &QName::new("ref")))
            .map(str::to_string)
            .unwrap_or_else(default)
    };
    Some(ItemsetDef {
        path,
        nodeset,
        value_ref: child_ref("value", default_value_ref),
        label_ref: child_ref("label", default_label_ref),
        multiple: doc.name(select).local == "select",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const XFORM: &str = r#"<h:html xmlns="http://www.w3.org/2002/xforms" xmlns:h="http://www.w3.org/1999/xhtml" xmlns:jr="http://openrosa.org/javarosa">
  <h:head>
    <model>
      <instance>
        <data id="households">
          <country/>
          <city/>
          <hh jr:template=""><name/><age/></hh>
          <meta><instanceID/></meta>
        </data>
      </instance>
      <instance id="cities">
        <root><item><name>ams</name><label>Amsterdam</label><country>nl</country></item></root>
      </instance>
      <bind nodeset="/data/hh/age" type="int" constraint=". &lt; 120" jr:constraintMsg="too old"/>
      <bind nodeset="/data/city" required="true()"/>
    </model>
  </h:head>
  <h:body>
    <select1 ref="/data/city">
      <itemset nodeset="instance('cities')/root/item[country = /data/country]">
        <value ref="name"/>
        <label ref="label"/>
      </itemset>
    </select1>
    <group ref="/data/hh">
      <repeat nodeset="/data/hh" jr:count="2"/>
    </group>
  </h:body>
</h:html>"#;

    #[test]
    fn test_from_xform() {
        let definition = FormDefinition::from_xform(XFORM).unwrap();
        assert!(definition.primary_instance.starts_with("<data id=\"households\">"));
        assert!(definition.primary_instance.contains("jr:template"));
        assert!(definition.secondary_instances["cities"].starts_with("<instance id=\"cities\">"));
        assert_eq!(
            definition.repeats,
            vec![RepeatDef {
                path: "/data/hh".into(),
                count: Some("2".into()),
            }]
        );
        assert_eq!(definition.binds.len(), 2);
        assert_eq!(definition.binds[0].data_type, DataType::Int);
        assert_eq!(definition.binds[0].constraint.as_deref(), Some(". < 120"));
        assert_eq!(definition.binds[0].constraint_message.as_deref(), Some("too old"));
        assert_eq!(
            definition.itemsets,
            vec![ItemsetDef {
                path: "/data/city".into(),
                nodeset: "instance('cities')/root/item[country = /data/country]".into(),
                value_ref: "name".into(),
                label_ref: "label".into(),
                multiple: false,
            }]
        );
    }

    #[test]
    fn test_relative_body_refs() {
        let source = r#"<h:html xmlns:h="x"><h:head><model><instance><data><g><r><s/></r></g></data></instance></model></h:head>
<h:body><group ref="/data/g"><repeat nodeset="r"><select ref="s"><itemset nodeset="/data/g"><value ref="v"/><label ref="l"/></itemset></select></repeat></group></h:body></h:html>"#;
        let definition = FormDefinition::from_xform(source).unwrap();
        assert_eq!(definition.repeats[0].path, "/data/g/r");
        assert_eq!(definition.itemsets[0].path, "/data/g/r/s");
        assert!(definition.itemsets[0].multiple);
    }

    #[test]
    fn test_from_json_defaults() {
        let definition = FormDefinition::from_json(
            r#"{
                "primary_instance": "<data><a/></data>",
                "binds": [{"nodeset": "/data/a", "calculate": "1 + 1", "type": "decimal"}],
                "itemsets": [{"path": "/data/a", "nodeset": "instance('x')/root/item"}]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.binds[0].data_type, DataType::Decimal);
        assert_eq!(definition.itemsets[0].value_ref, "name");
        assert!(definition.repeats.is_empty());
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        let errors = FormDefinition::from_json(
            r#"{"primary_instance": "<data/>", "repeats": [{"path": "rep"}], "binds": [{"nodeset": "a"}]}"#,
        )
        .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_missing_model() {
        let errors = FormDefinition::from_xform("<h:html xmlns:h=\"x\"/>").unwrap_err();
        assert!(matches!(
            errors.iter().next(),
            Some(LoadError::InvalidDefinition(_))
        ));
    }
}
