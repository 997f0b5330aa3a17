use std::fmt;

use thiserror::Error;

use crate::expr::ExprError;
use crate::form::FormError;
use crate::model::ModelError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),
    // load
    #[error("Load error: {0}")]
    Load(#[from] LoadErrors),
    #[error("Form error: {0}")]
    Form(#[from] FormError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}

/// Structural problem found while loading a definition or merging a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Different root nodes: expected '{expected}', found '{found}'")]
    DifferentRootNodes { expected: String, found: String },
    #[error("Schema must contain exactly one instanceID node, found {found}")]
    MissingInstanceId { found: usize },
    #[error("Record contains {count} instanceID nodes, expected one")]
    DuplicateInstanceId { count: usize },
    #[error("Malformed record: {0}")]
    MalformedRecord(String),
    #[error("Malformed instance: {0}")]
    MalformedInstance(String),
    #[error("Invalid form definition: {0}")]
    InvalidDefinition(String),
}

/// Every problem found by one load attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct LoadErrors(pub Vec<LoadError>);

impl LoadErrors {
    pub fn single(error: LoadError) -> Self {
        Self(vec![error])
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LoadErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl From<Vec<LoadError>> for LoadErrors {
    fn from(errors: Vec<LoadError>) -> Self {
        Self(errors)
    }
}

impl From<LoadError> for LoadErrors {
    fn from(error: LoadError) -> Self {
        Self::single(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_errors_display_joins_all() {
        let errors = LoadErrors(vec![
            LoadError::DifferentRootNodes {
                expected: "data".into(),
                found: "other".into(),
            },
            LoadError::DuplicateInstanceId { count: 2 },
        ]);
        assert_eq!(
            errors.to_string(),
            "Different root nodes: expected 'data', found 'other'; Record contains 2 instanceID nodes, expected one"
        );
    }

    #[test]
    fn test_error_from_load_errors() {
        let err: Error = LoadErrors::single(LoadError::MalformedRecord("eof".into())).into();
        assert!(matches!(err, Error::Load(_)));
        assert!(err.to_string().starts_with("Load error: Malformed record"));
    }
}
