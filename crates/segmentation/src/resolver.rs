//! Audience resolver: compiles a validated rule tree into a customer set.
//!
//! Post-order evaluation: every simple node is one predicate query against
//! the customer repository, AND/COMPLEX intersect their children and OR
//! unions them. Results are sets, so resolution is order-independent.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crm_core::store::CustomerRepository;
use crm_core::types::{CustomerId, Predicate};
use crm_core::{CrmError, CrmResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::rules::{RuleNode, ValidatedRuleTree};

/// Descriptive aggregates over a resolved audience.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceStats {
    pub count: u64,
    pub average_spend: f64,
    pub average_orders: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    pub customer_ids: BTreeSet<CustomerId>,
    pub stats: AudienceStats,
}

impl Audience {
    pub fn len(&self) -> usize {
        self.customer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
    }
}

#[derive(Clone)]
pub struct AudienceResolver {
    customers: Arc<dyn CustomerRepository>,
}

impl AudienceResolver {
    pub fn new(customers: Arc<dyn CustomerRepository>) -> Self {
        Self { customers }
    }

    pub fn resolve(&self, tree: &ValidatedRuleTree) -> CrmResult<Audience> {
        let ids = self.evaluate(tree.root(), "rules")?;
        let stats = self.summarize(&ids)?;
        debug!(
            rules = %tree,
            count = stats.count,
            average_spend = stats.average_spend,
            "Resolved audience"
        );
        Ok(Audience {
            customer_ids: ids.into_iter().collect(),
            stats,
        })
    }

    fn evaluate(&self, node: &RuleNode, path: &str) -> CrmResult<HashSet<CustomerId>> {
        match node {
            RuleNode::Simple {
                field,
                comparator,
                value,
            } => self
                .customers
                .query_by_predicate(&Predicate::new(*field, *comparator, *value)),
            RuleNode::And { conditions } => {
                require_children(node, conditions, 2, path)?;
                self.intersect(conditions, path)
            }
            RuleNode::Or { conditions } => {
                require_children(node, conditions, 2, path)?;
                self.union(conditions, path)
            }
            RuleNode::Complex { conditions } => {
                require_children(node, conditions, 1, path)?;
                self.intersect(conditions, path)
            }
        }
    }

    fn intersect(&self, children: &[RuleNode], path: &str) -> CrmResult<HashSet<CustomerId>> {
        let mut acc: Option<HashSet<CustomerId>> = None;
        for (i, child) in children.iter().enumerate() {
            let set = self.evaluate(child, &format!("{path}.conditions[{i}]"))?;
            acc = Some(match acc {
                None => set,
                Some(mut prev) => {
                    prev.retain(|id| set.contains(id));
                    prev
                }
            });
        }
        Ok(acc.unwrap_or_default())
    }

    fn union(&self, children: &[RuleNode], path: &str) -> CrmResult<HashSet<CustomerId>> {
        let mut acc = HashSet::new();
        for (i, child) in children.iter().enumerate() {
            acc.extend(self.evaluate(child, &format!("{path}.conditions[{i}]"))?);
        }
        Ok(acc)
    }

    fn summarize(&self, ids: &HashSet<CustomerId>) -> CrmResult<AudienceStats> {
        if ids.is_empty() {
            return Ok(AudienceStats::default());
        }
        let mut sorted: Vec<CustomerId> = ids.iter().cloned().collect();
        sorted.sort();
        let projections = self.customers.get_many(&sorted)?;
        let fetched = projections.len() as f64;
        let (spend, orders) = projections.iter().fold((0.0, 0.0), |(s, o), c| {
            (s + c.total_spend, o + c.total_orders as f64)
        });
        Ok(AudienceStats {
            count: ids.len() as u64,
            average_spend: if fetched > 0.0 { spend / fetched } else { 0.0 },
            average_orders: if fetched > 0.0 { orders / fetched } else { 0.0 },
        })
    }
}

/// Malformed combinators are a contract violation and fail loudly instead
/// of resolving to an empty audience.
fn require_children(node: &RuleNode, children: &[RuleNode], min: usize, path: &str) -> CrmResult<()> {
    if children.len() < min {
        return Err(CrmError::MalformedRuleTree(format!(
            "{path}: {} node has {} condition(s), needs at least {min}",
            node.kind(),
            children.len()
        )));
    }
    Ok(())
}
