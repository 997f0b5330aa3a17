use std::collections::HashMap;

use tracing::warn;

use crate::datatype::DataType;
use crate::definition::BindDef;
use crate::expr::{parse_expression, Expr, ExprError};
use crate::resolver::PathResolver;

/// The derived property a binding computes for its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BindingKind {
    Relevant,
    Calculate,
    Required,
    Readonly,
    Constraint,
}

impl BindingKind {
    /// Result assumed when the binding is absent or cannot be evaluated.
    pub fn neutral(&self) -> bool {
        match self {
            BindingKind::Relevant | BindingKind::Constraint => true,
            BindingKind::Required | BindingKind::Readonly | BindingKind::Calculate => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct Binding {
    pub id: BindingId,
    /// Template path of the bound nodes.
    pub path: String,
    pub kind: BindingKind,
    pub source: String,
    /// Prepared expression, or the parse failure that makes the binding inert.
    pub expr: Result<Expr, ExprError>,
}

/// All bindings of a form, indexed by bound path.
#[derive(Debug, Clone, Default)]
pub struct BindingCatalogue {
    bindings: Vec<Binding>,
    by_path: HashMap<String, Vec<BindingId>>,
    data_types: HashMap<String, DataType>,
    constraint_messages: HashMap<String, String>,
}

impl BindingCatalogue {
    pub fn build(defs: &[BindDef], resolver: &PathResolver) -> Self {
        let mut catalogue = Self::default();
        for def in defs {
            let path = def.nodeset.trim_end_matches('/').to_string();
            let data_type = catalogue.data_types.entry(path.clone()).or_default();
            if def.data_type != DataType::String {
                *data_type = def.data_type;
            }
            if let Some(message) = &def.constraint_message {
                catalogue
                    .constraint_messages
                    .insert(path.clone(), message.clone());
            }
            let sources = [
                (BindingKind::Relevant, &def.relevant),
                (BindingKind::Calculate, &def.calculate),
                (BindingKind::Required, &def.required),
                (BindingKind::Readonly, &def.readonly),
                (BindingKind::Constraint, &def.constraint),
            ];
            for (kind, source) in sources {
                if let Some(source) = source {
                    catalogue.insert(&path, kind, source, resolver);
                }
            }
        }
        catalogue
    }

    fn insert(&mut self, path: &str, kind: BindingKind, source: &str, resolver: &PathResolver) {
        let expr = parse_expression(source).map(|e| resolver.prepare(e));
        if let Err(e) = &expr {
            warn!(path, %kind, error = %e, "binding expression does not parse; using neutral result");
        }
        let ids = self.by_path.entry(path.to_string()).or_default();
        // A later declaration for the same property replaces the earlier one.
        if let Some(existing) = ids.iter().find(|id| self.bindings[id.0].kind == kind) {
            let binding = &mut self.bindings[existing.0];
            binding.source = source.to_string();
            binding.expr = expr;
            return;
        }
        let id = BindingId(self.bindings.len());
        ids.push(id);
        self.bindings.push(Binding {
            id,
            path: path.to_string(),
            kind,
            source: source.to_string(),
            expr,
        });
    }

    pub fn get(&self, id: BindingId) -> &Binding {
        &self.bindings[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn for_path<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a Binding> + 'a {
        self.by_path
            .get(path)
            .into_iter()
            .flatten()
            .map(move |id| &self.bindings[id.0])
    }

    pub fn find(&self, path: &str, kind: BindingKind) -> Option<&Binding> {
        self.for_path(path).find(|b| b.kind == kind)
    }

    pub fn data_type(&self, path: &str) -> DataType {
        self.data_types.get(path).copied().unwrap_or_default()
    }

    pub fn constraint_message(&self, path: &str) -> Option<&str> {
        self.constraint_messages.get(path).map(|m| m.as_str())
    }

    /// Paths that carry a declaration, with or without expressions.
    pub fn declared_paths(&self) -> impl Iterator<Item = &str> {
        self.data_types.keys().map(|p| p.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(nodeset: &str) -> BindDef {
        BindDef {
            nodeset: nodeset.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_catalogue_indexes_every_property() {
        let defs = vec![
            BindDef {
                calculate: Some("1 + 1".into()),
                relevant: Some("/data/a = 'yes'".into()),
                data_type: DataType::Int,
                ..bind("/data/b")
            },
            BindDef {
                required: Some("true()".into()),
                constraint: Some(". > 3".into()),
                constraint_message: Some("too small".into()),
                ..bind("/data/c")
            },
        ];
        let catalogue = BindingCatalogue::build(&defs, &PathResolver::default());
        assert_eq!(catalogue.len(), 4);
        assert_eq!(catalogue.for_path("/data/b").count(), 2);
        assert!(catalogue.find("/data/b", BindingKind::Calculate).is_some());
        assert!(catalogue.find("/data/b", BindingKind::Required).is_none());
        assert_eq!(catalogue.data_type("/data/b"), DataType::Int);
        assert_eq!(catalogue.data_type("/data/zzz"), DataType::String);
        assert_eq!(catalogue.constraint_message("/data/c"), Some("too small"));
    }

    #[test]
    fn test_broken_expression_is_kept_inert() {
        let defs = vec![BindDef {
            calculate: Some("1 +".into()),
            ..bind("/data/b")
        }];
        let catalogue = BindingCatalogue::build(&defs, &PathResolver::default());
        let binding = catalogue.find("/data/b", BindingKind::Calculate).unwrap();
        assert!(binding.expr.is_err());
    }

    #[test]
    fn test_later_declaration_wins() {
        let defs = vec![
            BindDef {
                calculate: Some("1".into()),
                ..bind("/data/b")
            },
            BindDef {
                calculate: Some("2".into()),
                ..bind("/data/b")
            },
        ];
        let catalogue = BindingCatalogue::build(&defs, &PathResolver::default());
        assert_eq!(catalogue.len(), 1);
        assert_eq!(
            catalogue.find("/data/b", BindingKind::Calculate).unwrap().source,
            "2"
        );
    }

    #[test]
    fn test_neutral_results() {
        assert!(BindingKind::Relevant.neutral());
        assert!(!BindingKind::Readonly.neutral());
        assert_eq!(BindingKind::Readonly.to_string(), "readonly");
    }
}
