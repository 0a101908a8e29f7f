use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type CrmResult<T> = Result<T, CrmError>;

/// A single rule-tree diagnostic, tagged with where in the tree it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Rule validation failed with {} error(s): {}", .0.len(), join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid campaign transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Campaign {0} has already been started")]
    AlreadyStarted(String),

    #[error("Malformed rule tree reached the resolver: {0}")]
    MalformedRuleTree(String),

    #[error("Vendor error: {0}")]
    Vendor(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Dispatch loop error: {0}")]
    DispatchLoop(String),

    #[error("Invalid delivery receipt: {0}")]
    InvalidReceipt(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CrmError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CrmError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// The path-tagged diagnostics, if this is a validation failure.
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        match self {
            CrmError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
