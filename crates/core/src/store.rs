//! Persistence contracts the engine is written against.
//!
//! The engine never picks a storage technology. Each trait is the minimal
//! surface it needs: predicate queries over customers, create/find/bulk
//! insert/bulk update for campaigns and messages, and atomic counter
//! increments by id.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::CrmResult;
use crate::lifecycle::{MessageTransition, SendOutcome};
use crate::types::{
    Campaign, CampaignStatus, Customer, CustomerId, DeliveryReceipt, Message, MessageStatus,
    Predicate, StatsDelta,
};

pub trait CustomerRepository: Send + Sync {
    /// Identifiers of every customer matching a single attribute predicate.
    fn query_by_predicate(&self, predicate: &Predicate) -> CrmResult<HashSet<CustomerId>>;

    fn get_attributes(&self, id: &str) -> CrmResult<Option<Customer>>;

    /// Bulk projection fetch. Unknown ids are skipped.
    fn get_many(&self, ids: &[CustomerId]) -> CrmResult<Vec<Customer>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(customer) = self.get_attributes(id)? {
                out.push(customer);
            }
        }
        Ok(out)
    }
}

pub trait CampaignStore: Send + Sync {
    fn create(&self, campaign: Campaign) -> CrmResult<()>;

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Campaign>>;

    /// Campaigns created by `created_by`, newest first.
    fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Campaign>>;

    /// Moves a DRAFT campaign to RUNNING, fixing `stats.total`, as one
    /// atomic step. A second call for the same id fails with `AlreadyStarted`.
    fn begin(&self, id: &Uuid, total: u64, at: DateTime<Utc>) -> CrmResult<Campaign>;

    /// Atomic increment of the aggregate counters.
    fn increment(&self, id: &Uuid, delta: StatsDelta) -> CrmResult<()>;

    /// Moves a RUNNING campaign to a terminal status.
    fn finish(
        &self,
        id: &Uuid,
        status: CampaignStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> CrmResult<Campaign>;
}

/// Result of a bulk receipt update.
#[derive(Debug, Clone, Default)]
pub struct ReceiptApplication {
    pub transitions: Vec<MessageTransition>,
    pub unknown: Vec<Uuid>,
}

impl ReceiptApplication {
    /// Counter deltas grouped per campaign.
    pub fn deltas_by_campaign(&self) -> HashMap<Uuid, StatsDelta> {
        let mut deltas: HashMap<Uuid, StatsDelta> = HashMap::new();
        for t in &self.transitions {
            let delta = t.stats_delta();
            if !delta.is_empty() {
                *deltas.entry(t.campaign_id).or_default() += delta;
            }
        }
        deltas
    }
}

pub trait MessageStore: Send + Sync {
    /// Inserts all messages or none. One message per (campaign, customer).
    fn bulk_insert(&self, messages: Vec<Message>) -> CrmResult<()>;

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Message>>;

    fn list_by_campaign(&self, campaign_id: &Uuid) -> CrmResult<Vec<Message>>;

    /// Records a vendor send attempt. Returns the transition if one happened.
    fn record_send(&self, id: &Uuid, outcome: &SendOutcome) -> CrmResult<Option<MessageTransition>>;

    /// Applies a batch of receipts in one operation, all or nothing.
    fn bulk_apply_receipts(&self, receipts: &[DeliveryReceipt]) -> CrmResult<ReceiptApplication>;

    fn count_by_status(&self, campaign_id: &Uuid) -> CrmResult<HashMap<MessageStatus, u64>> {
        let mut counts = HashMap::new();
        for message in self.list_by_campaign(campaign_id)? {
            *counts.entry(message.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
