//! Rule builder: fluent API for constructing rule trees in code.

use chrono::{DateTime, Utc};
use crm_core::types::{Comparator, Field};

use crate::rules::{RuleNode, ValidatedRuleTree, ValidationErrors};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    And,
    Or,
    Complex,
}

pub struct RuleBuilder {
    kind: GroupKind,
    conditions: Vec<RuleNode>,
}

impl RuleBuilder {
    pub fn and() -> Self {
        Self::with_kind(GroupKind::And)
    }

    pub fn or() -> Self {
        Self::with_kind(GroupKind::Or)
    }

    pub fn complex() -> Self {
        Self::with_kind(GroupKind::Complex)
    }

    fn with_kind(kind: GroupKind) -> Self {
        Self {
            kind,
            conditions: Vec::new(),
        }
    }

    pub fn condition(mut self, field: Field, comparator: Comparator, value: f64) -> Self {
        self.conditions
            .push(RuleNode::simple(field, comparator, value));
        self
    }

    pub fn gt(self, field: Field, value: f64) -> Self {
        self.condition(field, Comparator::Gt, value)
    }

    pub fn gte(self, field: Field, value: f64) -> Self {
        self.condition(field, Comparator::Gte, value)
    }

    pub fn lt(self, field: Field, value: f64) -> Self {
        self.condition(field, Comparator::Lt, value)
    }

    pub fn lte(self, field: Field, value: f64) -> Self {
        self.condition(field, Comparator::Lte, value)
    }

    pub fn eq(self, field: Field, value: f64) -> Self {
        self.condition(field, Comparator::Eq, value)
    }

    /// Customers whose last order is older than `cutoff`.
    pub fn last_ordered_before(self, cutoff: DateTime<Utc>) -> Self {
        self.condition(
            Field::LastOrderDate,
            Comparator::Lt,
            cutoff.timestamp_millis() as f64,
        )
    }

    pub fn last_ordered_since(self, cutoff: DateTime<Utc>) -> Self {
        self.condition(
            Field::LastOrderDate,
            Comparator::Gte,
            cutoff.timestamp_millis() as f64,
        )
    }

    pub fn group(mut self, nested: RuleBuilder) -> Self {
        self.conditions.push(nested.node());
        self
    }

    pub fn node(self) -> RuleNode {
        match self.kind {
            GroupKind::And => RuleNode::and(self.conditions),
            GroupKind::Or => RuleNode::or(self.conditions),
            GroupKind::Complex => RuleNode::complex(self.conditions),
        }
    }

    pub fn build(self) -> Result<ValidatedRuleTree, ValidationErrors> {
        ValidatedRuleTree::try_from(self.node())
    }
}
