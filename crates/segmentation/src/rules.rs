//! Rule tree types.
//!
//! [`RuleNode`] is the closed set of node shapes. [`ValidatedRuleTree`] can
//! only be obtained through validation (from raw JSON, the builder, or a
//! stored canonical tree), so the resolver never sees an unchecked tree.

use crm_core::types::{Comparator, Field, Predicate};
use crm_core::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleNode {
    Simple {
        field: Field,
        comparator: Comparator,
        value: f64,
    },
    And {
        conditions: Vec<RuleNode>,
    },
    Or {
        conditions: Vec<RuleNode>,
    },
    /// Generic nesting wrapper; its children combine by intersection.
    Complex {
        conditions: Vec<RuleNode>,
    },
}

impl RuleNode {
    pub fn simple(field: Field, comparator: Comparator, value: f64) -> Self {
        RuleNode::Simple {
            field,
            comparator,
            value,
        }
    }

    pub fn and(conditions: Vec<RuleNode>) -> Self {
        RuleNode::And { conditions }
    }

    pub fn or(conditions: Vec<RuleNode>) -> Self {
        RuleNode::Or { conditions }
    }

    pub fn complex(conditions: Vec<RuleNode>) -> Self {
        RuleNode::Complex { conditions }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleNode::Simple { .. } => "simple",
            RuleNode::And { .. } => "and",
            RuleNode::Or { .. } => "or",
            RuleNode::Complex { .. } => "complex",
        }
    }

    /// Number of simple predicates in the subtree.
    pub fn predicate_count(&self) -> usize {
        match self {
            RuleNode::Simple { .. } => 1,
            RuleNode::And { conditions }
            | RuleNode::Or { conditions }
            | RuleNode::Complex { conditions } => {
                conditions.iter().map(RuleNode::predicate_count).sum()
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            RuleNode::Simple { .. } => 1,
            RuleNode::And { conditions }
            | RuleNode::Or { conditions }
            | RuleNode::Complex { conditions } => {
                1 + conditions.iter().map(RuleNode::depth).max().unwrap_or(0)
            }
        }
    }
}

impl fmt::Display for RuleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (joiner, conditions) = match self {
            RuleNode::Simple {
                field,
                comparator,
                value,
            } => return write!(f, "{}", Predicate::new(*field, *comparator, *value)),
            RuleNode::And { conditions } | RuleNode::Complex { conditions } => (" AND ", conditions),
            RuleNode::Or { conditions } => (" OR ", conditions),
        };
        f.write_str("(")?;
        for (i, c) in conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(joiner)?;
            }
            write!(f, "{c}")?;
        }
        f.write_str(")")
    }
}

/// A rule tree that passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RuleNode", into = "RuleNode")]
pub struct ValidatedRuleTree {
    root: RuleNode,
}

impl ValidatedRuleTree {
    pub(crate) fn new_unchecked(root: RuleNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &RuleNode {
        &self.root
    }

    pub fn into_inner(self) -> RuleNode {
        self.root
    }
}

impl fmt::Display for ValidatedRuleTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

impl From<ValidatedRuleTree> for RuleNode {
    fn from(tree: ValidatedRuleTree) -> Self {
        tree.root
    }
}

/// Structural validation of an already-typed tree.
impl TryFrom<RuleNode> for ValidatedRuleTree {
    type Error = ValidationErrors;

    fn try_from(root: RuleNode) -> Result<Self, Self::Error> {
        let mut errors = Vec::new();
        crate::validator::check_structure(&root, "rules", &mut errors);
        if errors.is_empty() {
            Ok(Self::new_unchecked(root))
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

/// Every diagnostic collected while validating one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn into_inner(self) -> Vec<ValidationError> {
        self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for crm_core::CrmError {
    fn from(errors: ValidationErrors) -> Self {
        crm_core::CrmError::Validation(errors.0)
    }
}
