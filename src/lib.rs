//! # formcascade: Form Evaluation over Repeating Data
//!
//! formcascade keeps a data-collection form consistent while it is being
//! filled in. A form is a hierarchical document (the primary instance) plus
//! a set of bindings that derive calculated values, relevance, requiredness,
//! read-only state and validity from the answers, some of them inside
//! repeating groups.
//!
//! ## Components
//!
//! - Document model ([`model`]): element tree, template paths, XML in and
//!   out, merging a saved record into a fresh form
//! - Expressions ([`expr`]): XPath parser and evaluator reporting the nodes
//!   each evaluation read
//! - Path resolution ([`resolver`]): binds form-level expressions to the
//!   repeat instance they are evaluated for
//! - Repeats ([`repeat`]): templates, instance creation and removal, ordinals
//! - Cascade ([`cascade`]): dependency-aware re-evaluation after each change
//! - Choice lists ([`itemset`]): dynamic options for select questions
//! - Notification ([`event`]): change events for subscribers
//!
//! ## Processing Flow
//!
//! ```text
//! FormDefinition + record → Document → merge → repeats → cascade ⟲ → events
//! ```
//!
//! [`Form`] owns all of the above and is the usual entry point:
//!
//! ```rust,no_run
//! use formcascade::{Form, FormConfig, FormDefinition, SerializeOptions};
//!
//! let definition = FormDefinition::from_xform(include_str!("../tests/fixtures/household.xml"))?;
//! let mut form = Form::load(&definition, None, FormConfig::default())?;
//! form.set_value("/household/size", 0, "3")?;
//! println!("{}", form.serialize(SerializeOptions::default()));
//! # Ok::<(), formcascade::Error>(())
//! ```

pub mod cascade;
pub mod config;
pub mod datatype;
pub mod definition;
pub mod error;
pub mod event;
pub mod expr;
pub mod form;
pub mod itemset;
pub mod model;
pub mod repeat;
pub mod resolver;

// Re-exports
pub use config::FormConfig;
pub use datatype::DataType;
pub use definition::{BindDef, FormDefinition, ItemsetDef, RepeatDef};
pub use error::*;
pub use event::{ChangeEvent, ChangeKind, EventReceiver};
pub use expr::{ResultType, XPathValue};
pub use form::{Form, FormError, IssueKind, SerializeOptions, ValidationIssue};
pub use model::{Document, MergeOptions, NodeId};

#[cfg(test)]
mod tests {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    #[ctor::ctor]
    fn init_tests() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
