//! Segments: named, persisted snapshots of a rule tree and its audience.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crm_core::types::CustomerId;
use crm_core::{CrmError, CrmResult, ValidationError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::resolver::{Audience, AudienceResolver, AudienceStats};
use crate::rules::ValidatedRuleTree;
use crate::validator::validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub rules: ValidatedRuleTree,
    /// Human-readable rendering of `rules`.
    pub condition_string: String,
    pub customer_ids: BTreeSet<CustomerId>,
    pub stats: AudienceStats,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    pub fn audience_size(&self) -> u64 {
        self.customer_ids.len() as u64
    }

    /// Replaces the stored audience wholesale.
    fn apply(&mut self, rules: ValidatedRuleTree, audience: Audience, at: DateTime<Utc>) {
        self.condition_string = rules.to_string();
        self.rules = rules;
        self.customer_ids = audience.customer_ids;
        self.stats = audience.stats;
        self.updated_at = at;
    }
}

/// Result of a dry-run resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceSummary {
    pub condition_string: String,
    #[serde(flatten)]
    pub stats: AudienceStats,
}

pub trait SegmentStore: Send + Sync {
    fn create(&self, segment: Segment) -> CrmResult<()>;

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Segment>>;

    /// Overwrites an existing segment. Fails with NotFound if it was deleted.
    fn replace(&self, segment: Segment) -> CrmResult<()>;

    /// Segments created by `created_by`, newest first.
    fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Segment>>;

    fn delete(&self, id: &Uuid) -> CrmResult<bool>;
}

#[derive(Default)]
pub struct InMemorySegmentStore {
    segments: DashMap<Uuid, Segment>,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn create(&self, segment: Segment) -> CrmResult<()> {
        if self.segments.contains_key(&segment.id) {
            return Err(CrmError::Conflict(format!(
                "segment {} already exists",
                segment.id
            )));
        }
        self.segments.insert(segment.id, segment);
        Ok(())
    }

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Segment>> {
        Ok(self.segments.get(id).map(|s| s.value().clone()))
    }

    fn replace(&self, segment: Segment) -> CrmResult<()> {
        match self.segments.get_mut(&segment.id) {
            Some(mut entry) => {
                *entry = segment;
                Ok(())
            }
            None => Err(CrmError::not_found("Segment", segment.id)),
        }
    }

    fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Segment>> {
        let mut out: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| s.created_by == created_by)
            .map(|s| s.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    fn delete(&self, id: &Uuid) -> CrmResult<bool> {
        Ok(self.segments.remove(id).is_some())
    }
}

/// Validates, resolves and persists segments.
#[derive(Clone)]
pub struct SegmentService {
    resolver: AudienceResolver,
    segments: Arc<dyn SegmentStore>,
}

impl SegmentService {
    pub fn new(resolver: AudienceResolver, segments: Arc<dyn SegmentStore>) -> Self {
        Self { resolver, segments }
    }

    pub fn store(&self) -> Arc<dyn SegmentStore> {
        Arc::clone(&self.segments)
    }

    pub fn preview(&self, raw: &Value) -> CrmResult<AudienceSummary> {
        let rules = validate(raw)?;
        let audience = self.resolver.resolve(&rules)?;
        Ok(AudienceSummary {
            condition_string: rules.to_string(),
            stats: audience.stats,
        })
    }

    pub fn create_segment(&self, name: &str, raw: &Value, created_by: &str) -> CrmResult<Segment> {
        let name = name.trim();
        let mut errors = Vec::new();
        if name.is_empty() {
            errors.push(ValidationError::new("name", "Segment name is required"));
        }
        let rules = match validate(raw) {
            Ok(rules) => Some(rules),
            Err(e) => {
                errors.extend(e.into_inner());
                None
            }
        };
        let rules = match rules {
            Some(rules) if errors.is_empty() => rules,
            _ => return Err(CrmError::Validation(errors)),
        };
        self.create_from_rules(name, rules, created_by)
    }

    /// Persists a segment from an already validated tree.
    pub fn create_from_rules(
        &self,
        name: &str,
        rules: ValidatedRuleTree,
        created_by: &str,
    ) -> CrmResult<Segment> {
        if name.trim().is_empty() {
            return Err(CrmError::Validation(vec![ValidationError::new(
                "name",
                "Segment name is required",
            )]));
        }
        let audience = self.resolver.resolve(&rules)?;
        let now = Utc::now();
        let segment = Segment {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            condition_string: rules.to_string(),
            rules,
            customer_ids: audience.customer_ids,
            stats: audience.stats,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.segments.create(segment.clone())?;
        metrics::counter!("segmentation.segments_created").increment(1);
        info!(
            segment_id = %segment.id,
            name = %segment.name,
            audience = segment.audience_size(),
            "Segment created"
        );
        Ok(segment)
    }

    pub fn update_rules(&self, segment_id: &Uuid, raw: &Value) -> CrmResult<Segment> {
        let rules = validate(raw)?;
        let mut segment = self.get(segment_id)?;
        let audience = self.resolver.resolve(&rules)?;
        segment.apply(rules, audience, Utc::now());
        self.segments.replace(segment.clone())?;
        info!(
            segment_id = %segment.id,
            audience = segment.audience_size(),
            "Segment rules replaced"
        );
        Ok(segment)
    }

    /// Re-resolves the stored tree against the current repository.
    pub fn refresh(&self, segment_id: &Uuid) -> CrmResult<Segment> {
        let mut segment = self.get(segment_id)?;
        let previous = segment.audience_size();
        let rules = segment.rules.clone();
        let audience = self.resolver.resolve(&rules)?;
        segment.apply(rules, audience, Utc::now());
        self.segments.replace(segment.clone())?;
        info!(
            segment_id = %segment.id,
            previous,
            current = segment.audience_size(),
            "Segment refreshed"
        );
        Ok(segment)
    }

    pub fn get(&self, segment_id: &Uuid) -> CrmResult<Segment> {
        self.segments
            .find_by_id(segment_id)?
            .ok_or_else(|| CrmError::not_found("Segment", segment_id))
    }

    pub fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Segment>> {
        self.segments.list_by_creator(created_by)
    }

    pub fn delete(&self, segment_id: &Uuid) -> CrmResult<()> {
        if self.segments.delete(segment_id)? {
            Ok(())
        } else {
            Err(CrmError::not_found("Segment", segment_id))
        }
    }
}
