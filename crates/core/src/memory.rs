//! In-process stores backed by `DashMap`, used by the engine binary and tests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CrmError, CrmResult};
use crate::lifecycle::{apply_receipt, MessageTransition, SendOutcome};
use crate::store::{CampaignStore, CustomerRepository, MessageStore, ReceiptApplication};
use crate::types::{
    Campaign, CampaignStatus, Customer, CustomerId, DeliveryReceipt, Message, MessageStatus,
    Predicate, StatsDelta,
};

// ─── Customers ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCustomerRepository {
    customers: DashMap<CustomerId, Customer>,
}

impl InMemoryCustomerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customers(customers: impl IntoIterator<Item = Customer>) -> Self {
        let repo = Self::new();
        for c in customers {
            repo.upsert(c);
        }
        repo
    }

    pub fn upsert(&self, customer: Customer) {
        self.customers.insert(customer.id.clone(), customer);
    }

    pub fn remove(&self, id: &str) -> Option<Customer> {
        self.customers.remove(id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }
}

impl CustomerRepository for InMemoryCustomerRepository {
    fn query_by_predicate(&self, predicate: &Predicate) -> CrmResult<HashSet<CustomerId>> {
        let matched: HashSet<CustomerId> = self
            .customers
            .iter()
            .filter(|c| predicate.matches(c.value()))
            .map(|c| c.key().clone())
            .collect();
        debug!(predicate = %predicate, matched = matched.len(), "Customer predicate query");
        Ok(matched)
    }

    fn get_attributes(&self, id: &str) -> CrmResult<Option<Customer>> {
        Ok(self.customers.get(id).map(|c| c.clone()))
    }
}

// ─── Campaigns ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn create(&self, campaign: Campaign) -> CrmResult<()> {
        if self.campaigns.contains_key(&campaign.id) {
            return Err(CrmError::Conflict(format!(
                "campaign {} already exists",
                campaign.id
            )));
        }
        self.campaigns.insert(campaign.id, campaign);
        Ok(())
    }

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Campaign>> {
        Ok(self.campaigns.get(id).map(|c| c.clone()))
    }

    fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Campaign>> {
        let mut out: Vec<Campaign> = self
            .campaigns
            .iter()
            .filter(|c| c.created_by == created_by)
            .map(|c| c.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    fn begin(&self, id: &Uuid, total: u64, at: DateTime<Utc>) -> CrmResult<Campaign> {
        // The shard lock held by get_mut makes check-and-set atomic.
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| CrmError::not_found("Campaign", id))?;
        entry.status.check_transition(CampaignStatus::Running, id)?;
        entry.status = CampaignStatus::Running;
        entry.started_at = Some(at);
        entry.audience_size = total;
        entry.stats.total = total;
        Ok(entry.clone())
    }

    fn increment(&self, id: &Uuid, delta: StatsDelta) -> CrmResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| CrmError::not_found("Campaign", id))?;
        entry.stats.sent += delta.sent;
        entry.stats.failed += delta.failed;
        entry.stats.delivered += delta.delivered;
        if entry.stats.attempted() > entry.stats.total {
            warn!(
                campaign_id = %id,
                sent = entry.stats.sent,
                failed = entry.stats.failed,
                total = entry.stats.total,
                "Campaign counters exceed audience size"
            );
        }
        Ok(())
    }

    fn finish(
        &self,
        id: &Uuid,
        status: CampaignStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> CrmResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| CrmError::not_found("Campaign", id))?;
        if !status.is_terminal() {
            return Err(CrmError::InvalidTransition {
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }
        entry.status.check_transition(status, id)?;
        entry.status = status;
        entry.completed_at = Some(at);
        entry.failure_reason = reason;
        Ok(entry.clone())
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: DashMap<Uuid, Message>,
    by_recipient: DashMap<(Uuid, CustomerId), Uuid>,
    writes: Mutex<()>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn bulk_insert(&self, messages: Vec<Message>) -> CrmResult<()> {
        let _guard = self.writes.lock();

        let mut seen: HashSet<(Uuid, &str)> = HashSet::with_capacity(messages.len());
        for m in &messages {
            let key = (m.campaign_id, m.customer_id.as_str());
            if !seen.insert(key)
                || self
                    .by_recipient
                    .contains_key(&(m.campaign_id, m.customer_id.clone()))
            {
                return Err(CrmError::Conflict(format!(
                    "message for customer {} in campaign {} already exists",
                    m.customer_id, m.campaign_id
                )));
            }
            if self.messages.contains_key(&m.message_id) {
                return Err(CrmError::Conflict(format!(
                    "message id {} already exists",
                    m.message_id
                )));
            }
        }

        let count = messages.len();
        for m in messages {
            self.by_recipient
                .insert((m.campaign_id, m.customer_id.clone()), m.message_id);
            self.messages.insert(m.message_id, m);
        }
        debug!(count, "Bulk inserted messages");
        Ok(())
    }

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Message>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    fn list_by_campaign(&self, campaign_id: &Uuid) -> CrmResult<Vec<Message>> {
        let mut out: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.campaign_id == *campaign_id)
            .map(|m| m.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    fn record_send(&self, id: &Uuid, outcome: &SendOutcome) -> CrmResult<Option<MessageTransition>> {
        let mut entry = self
            .messages
            .get_mut(id)
            .ok_or_else(|| CrmError::not_found("Message", id))?;
        Ok(outcome.apply(&mut entry))
    }

    fn bulk_apply_receipts(&self, receipts: &[DeliveryReceipt]) -> CrmResult<ReceiptApplication> {
        let _guard = self.writes.lock();
        let mut result = ReceiptApplication::default();
        for receipt in receipts {
            match self.messages.get_mut(&receipt.message_id) {
                Some(mut message) => {
                    if let Some(t) = apply_receipt(&mut message, receipt) {
                        result.transitions.push(t);
                    }
                }
                None => result.unknown.push(receipt.message_id),
            }
        }
        Ok(result)
    }
}

/// Counts of messages per status, with every status present.
pub fn status_counts(messages: &[Message]) -> HashMap<MessageStatus, u64> {
    let mut counts: HashMap<MessageStatus, u64> = [
        MessageStatus::Pending,
        MessageStatus::Sent,
        MessageStatus::Failed,
        MessageStatus::Delivered,
    ]
    .into_iter()
    .map(|s| (s, 0))
    .collect();
    for m in messages {
        *counts.entry(m.status).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comparator, Field, ReceiptStatus};

    fn campaign_store_with_draft() -> (InMemoryCampaignStore, Uuid) {
        let store = InMemoryCampaignStore::new();
        let campaign = Campaign::draft("Winback", Uuid::new_v4(), "Hi {{name}}", "ops@example.com");
        let id = campaign.id;
        store.create(campaign).unwrap();
        (store, id)
    }

    #[test]
    fn test_predicate_query() {
        let repo = InMemoryCustomerRepository::with_customers([
            Customer::new("c1", "A", "a@x.io").with_spend(1500.0, 2),
            Customer::new("c2", "B", "b@x.io").with_spend(500.0, 1),
        ]);
        let ids = repo
            .query_by_predicate(&Predicate::new(Field::TotalSpend, Comparator::Gt, 1000.0))
            .unwrap();
        assert_eq!(ids, HashSet::from(["c1".to_string()]));
        assert_eq!(repo.get_many(&["c2".into(), "nope".into()]).unwrap().len(), 1);
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let (store, id) = campaign_store_with_draft();
        let running = store.begin(&id, 3, Utc::now()).unwrap();
        assert_eq!(running.status, CampaignStatus::Running);
        assert_eq!(running.stats.total, 3);

        let err = store.begin(&id, 5, Utc::now()).unwrap_err();
        assert!(matches!(err, CrmError::AlreadyStarted(_)));
        assert_eq!(store.find_by_id(&id).unwrap().unwrap().stats.total, 3);
    }

    #[test]
    fn test_finish_requires_running() {
        let (store, id) = campaign_store_with_draft();
        assert!(store
            .finish(&id, CampaignStatus::Completed, Utc::now(), None)
            .is_err());
        store.begin(&id, 1, Utc::now()).unwrap();
        store
            .finish(&id, CampaignStatus::Completed, Utc::now(), None)
            .unwrap();
        assert!(store
            .finish(&id, CampaignStatus::Failed, Utc::now(), Some("late".into()))
            .is_err());
    }

    #[test]
    fn test_bulk_insert_rejects_duplicate_recipient() {
        let store = InMemoryMessageStore::new();
        let campaign_id = Uuid::new_v4();
        store
            .bulk_insert(vec![Message::pending(campaign_id, "c1", "a".into())])
            .unwrap();

        let err = store
            .bulk_insert(vec![
                Message::pending(campaign_id, "c2", "b".into()),
                Message::pending(campaign_id, "c1", "c".into()),
            ])
            .unwrap_err();
        assert!(matches!(err, CrmError::Conflict(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bulk_apply_reports_unknown_ids() {
        let store = InMemoryMessageStore::new();
        let msg = Message::pending(Uuid::new_v4(), "c1", "a".into());
        let id = msg.message_id;
        store.bulk_insert(vec![msg]).unwrap();

        let stray = Uuid::new_v4();
        let result = store
            .bulk_apply_receipts(&[
                DeliveryReceipt::new(id, ReceiptStatus::Delivered),
                DeliveryReceipt::new(stray, ReceiptStatus::Delivered),
            ])
            .unwrap();
        assert_eq!(result.transitions.len(), 1);
        assert_eq!(result.unknown, vec![stray]);
        assert_eq!(
            store.find_by_id(&id).unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn test_status_counts_include_every_status() {
        let counts = status_counts(&[]);
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 0));
    }
}
