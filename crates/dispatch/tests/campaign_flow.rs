use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::lifecycle::{MessageTransition, SendOutcome};
use crm_core::memory::{InMemoryCampaignStore, InMemoryCustomerRepository, InMemoryMessageStore};
use crm_core::store::{CampaignStore, MessageStore, ReceiptApplication};
use crm_core::types::{
    Campaign, CampaignStatus, Customer, DeliveryReceipt, Field, Message, MessageStatus, StatsDelta,
};
use crm_core::{CrmError, CrmResult};
use crm_dispatch::{
    CampaignDispatcher, CampaignService, DispatchSettings, NewCampaign, OutboundMessage, VendorAck,
    VendorClient, VendorError,
};
use crm_dispatch::vendor::AckStatus;
use crm_segmentation::{AudienceResolver, InMemorySegmentStore, RuleBuilder, SegmentService};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct ScriptedVendor {
    reject: HashSet<String>,
    panic_on: Option<String>,
    latency: Duration,
    calls: Mutex<Vec<OutboundMessage>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedVendor {
    fn rejecting(ids: &[&str]) -> Self {
        Self {
            reject: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<OutboundMessage> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl VendorClient for ScriptedVendor {
    async fn send(&self, message: &OutboundMessage) -> Result<VendorAck, VendorError> {
        self.calls.lock().push(message.clone());
        if self.panic_on.as_deref() == Some(message.customer_id.as_str()) {
            panic!("vendor exploded");
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.reject.contains(&message.customer_id) {
            return Err(VendorError::Rejected("invalid recipient".into()));
        }
        Ok(VendorAck {
            vendor_message_id: format!("v-{}", message.message_id),
            status: AckStatus::Accepted,
            timestamp: Utc::now(),
        })
    }
}

/// Message store whose send recording starts failing after `healthy` calls.
struct FlakyMessageStore {
    inner: InMemoryMessageStore,
    healthy: usize,
    calls: AtomicUsize,
}

impl MessageStore for FlakyMessageStore {
    fn bulk_insert(&self, messages: Vec<Message>) -> CrmResult<()> {
        self.inner.bulk_insert(messages)
    }

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Message>> {
        self.inner.find_by_id(id)
    }

    fn list_by_campaign(&self, campaign_id: &Uuid) -> CrmResult<Vec<Message>> {
        self.inner.list_by_campaign(campaign_id)
    }

    fn record_send(
        &self,
        id: &Uuid,
        outcome: &SendOutcome,
    ) -> CrmResult<Option<MessageTransition>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy {
            return Err(CrmError::Persistence("message table unavailable".into()));
        }
        self.inner.record_send(id, outcome)
    }

    fn bulk_apply_receipts(&self, receipts: &[DeliveryReceipt]) -> CrmResult<ReceiptApplication> {
        self.inner.bulk_apply_receipts(receipts)
    }
}

/// Campaign store whose `finish` fails for the first `failures` calls.
struct StickyFinishStore {
    inner: InMemoryCampaignStore,
    failures: usize,
    finish_calls: AtomicUsize,
}

impl StickyFinishStore {
    fn failing(failures: usize) -> Self {
        Self {
            inner: InMemoryCampaignStore::new(),
            failures,
            finish_calls: AtomicUsize::new(0),
        }
    }
}

impl CampaignStore for StickyFinishStore {
    fn create(&self, campaign: Campaign) -> CrmResult<()> {
        self.inner.create(campaign)
    }

    fn find_by_id(&self, id: &Uuid) -> CrmResult<Option<Campaign>> {
        self.inner.find_by_id(id)
    }

    fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Campaign>> {
        self.inner.list_by_creator(created_by)
    }

    fn begin(&self, id: &Uuid, total: u64, at: DateTime<Utc>) -> CrmResult<Campaign> {
        self.inner.begin(id, total, at)
    }

    fn increment(&self, id: &Uuid, delta: StatsDelta) -> CrmResult<()> {
        self.inner.increment(id, delta)
    }

    fn finish(
        &self,
        id: &Uuid,
        status: CampaignStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> CrmResult<Campaign> {
        if self.finish_calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CrmError::Persistence("write timeout".into()));
        }
        self.inner.finish(id, status, at, reason)
    }
}

struct Harness {
    customers: Arc<InMemoryCustomerRepository>,
    campaigns: Arc<dyn CampaignStore>,
    messages: Arc<dyn MessageStore>,
    segments: SegmentService,
    service: CampaignService,
}

fn customers() -> Vec<Customer> {
    vec![
        Customer::new("C1", "Ada Lovelace", "ada@example.com").with_spend(1200.0, 4),
        Customer::new("C2", "Grace Hopper", "grace@example.com").with_spend(300.0, 1),
        Customer::new("C3", "Alan Turing", "alan@example.com").with_spend(80.0, 2),
    ]
}

fn settings() -> DispatchSettings {
    DispatchSettings {
        batch_size: 50,
        batch_delay: Duration::ZERO,
        send_concurrency: 1,
        send_timeout: Duration::from_secs(5),
    }
}

fn harness(
    vendor: Arc<dyn VendorClient>,
    messages: Arc<dyn MessageStore>,
    settings: DispatchSettings,
    customers: Vec<Customer>,
) -> Harness {
    harness_on(Arc::new(InMemoryCampaignStore::new()), vendor, messages, settings, customers)
}

fn harness_on(
    campaigns: Arc<dyn CampaignStore>,
    vendor: Arc<dyn VendorClient>,
    messages: Arc<dyn MessageStore>,
    settings: DispatchSettings,
    customers: Vec<Customer>,
) -> Harness {
    let repo = Arc::new(InMemoryCustomerRepository::with_customers(customers));
    let segment_store = Arc::new(InMemorySegmentStore::new());
    let segments = SegmentService::new(AudienceResolver::new(repo.clone()), segment_store.clone());
    let dispatcher = CampaignDispatcher::new(
        campaigns.clone(),
        segment_store.clone(),
        repo.clone(),
        messages.clone(),
        vendor,
        settings,
    );
    let service = CampaignService::new(campaigns.clone(), segment_store, messages.clone(), dispatcher);
    Harness {
        customers: repo,
        campaigns,
        messages,
        segments,
        service,
    }
}

fn everyone(h: &Harness) -> Uuid {
    let rules = RuleBuilder::complex().gte(Field::TotalSpend, 0.0).build().unwrap();
    h.segments.create_from_rules("Everyone", rules, "ops").unwrap().id
}

fn new_campaign(segment_id: Uuid, template: &str) -> NewCampaign {
    NewCampaign {
        name: "Spring promo".into(),
        segment_id,
        message_template: template.into(),
        created_by: "ops".into(),
    }
}

#[tokio::test]
async fn test_start_creates_pending_messages_before_any_send() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let segment_id = everyone(&h);
    let draft = h
        .service
        .create_campaign(new_campaign(segment_id, "Hi {{first_name}}, you spent {{total_spend}}"))
        .unwrap();
    assert_eq!(draft.status, CampaignStatus::Draft);

    let running = h.service.start(&draft.id).unwrap();
    assert_eq!(running.status, CampaignStatus::Running);
    assert_eq!(running.stats.total, 3);
    assert!(running.started_at.is_some());

    let messages = h.messages.list_by_campaign(&draft.id).unwrap();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().all(|m| m.status == MessageStatus::Pending));
    assert!(vendor.calls().is_empty());

    let done = h.service.dispatcher().wait(&draft.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.stats.sent, 3);
    assert_eq!(done.stats.failed, 0);
    assert!(done.completed_at.is_some());

    let bodies: HashSet<String> = vendor.calls().into_iter().map(|c| c.body).collect();
    assert!(bodies.contains("Hi Ada, you spent 1200"));
    assert!(bodies.contains("Hi Alan, you spent 80"));
}

#[tokio::test]
async fn test_vendor_correlates_on_message_id() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();
    h.service.dispatcher().wait(&campaign.id).await.unwrap();

    for call in vendor.calls() {
        let message = h.messages.find_by_id(&call.message_id).unwrap().unwrap();
        assert_eq!(message.customer_id, call.customer_id);
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.delivery_attempts, 1);
        assert!(message.sent_at.is_some());
    }
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let err = h.service.start(&campaign.id).unwrap_err();
    assert!(matches!(err, CrmError::AlreadyStarted(_)));

    h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(vendor.calls().len(), 3);
    assert_eq!(h.messages.list_by_campaign(&campaign.id).unwrap().len(), 3);

    let err = h.service.start(&campaign.id).unwrap_err();
    assert!(matches!(err, CrmError::AlreadyStarted(_)));
    assert_eq!(
        h.service.get(&campaign.id).unwrap().status,
        CampaignStatus::Completed
    );
}

#[tokio::test]
async fn test_vendor_rejections_count_as_failed_and_campaign_completes() {
    let vendor = Arc::new(ScriptedVendor::rejecting(&["C2"]));
    let h = harness(vendor, Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();
    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();

    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.stats.sent, 2);
    assert_eq!(done.stats.failed, 1);
    assert_eq!(done.stats.sent + done.stats.failed, done.stats.total);

    let failed: Vec<_> = h
        .messages
        .list_by_campaign(&campaign.id)
        .unwrap()
        .into_iter()
        .filter(|m| m.status == MessageStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].customer_id, "C2");
    assert_eq!(failed[0].delivery_attempts, 1);
    let response = failed[0].vendor_response.as_ref().unwrap();
    assert_eq!(response["kind"], "rejected");
    assert!(failed[0].sent_at.is_none());

    let report = h.service.report(&campaign.id).unwrap();
    assert_eq!(report.message_counts[&MessageStatus::Sent], 2);
    assert_eq!(report.message_counts[&MessageStatus::Failed], 1);
    assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_slow_vendor_times_out_per_message() {
    let vendor = Arc::new(ScriptedVendor {
        latency: Duration::from_millis(200),
        ..Default::default()
    });
    let settings = DispatchSettings {
        send_timeout: Duration::from_millis(20),
        ..settings()
    };
    let h = harness(vendor, Arc::new(InMemoryMessageStore::new()), settings, customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();
    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();

    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.stats.failed, 3);
    let message = &h.messages.list_by_campaign(&campaign.id).unwrap()[0];
    assert_eq!(message.vendor_response.as_ref().unwrap()["kind"], "timeout");
}

#[tokio::test]
async fn test_missing_customer_fails_without_vendor_call() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h
        .service
        .create_campaign(new_campaign(everyone(&h), "Hi {{first_name}} ({{customer_id}})"))
        .unwrap();
    h.customers.remove("C3");

    h.service.start(&campaign.id).unwrap();
    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.stats.total, 3);
    assert_eq!(done.stats.sent, 2);
    assert_eq!(done.stats.failed, 1);
    assert!(vendor.calls().iter().all(|c| c.customer_id != "C3"));

    let orphan = h
        .messages
        .list_by_campaign(&campaign.id)
        .unwrap()
        .into_iter()
        .find(|m| m.customer_id == "C3")
        .unwrap();
    assert_eq!(orphan.status, MessageStatus::Failed);
    assert_eq!(orphan.body, "Hi {{first_name}} (C3)");
    assert_eq!(orphan.vendor_response.unwrap()["error"], "customer not found");
}

#[tokio::test]
async fn test_batches_are_paced_and_concurrency_bounded() {
    let vendor = Arc::new(ScriptedVendor {
        latency: Duration::from_millis(5),
        ..Default::default()
    });
    let many: Vec<Customer> = (0..5)
        .map(|i| Customer::new(format!("B{i}"), "Bo", "bo@example.com").with_spend(10.0, 1))
        .collect();
    let settings = DispatchSettings {
        batch_size: 2,
        batch_delay: Duration::from_millis(50),
        send_concurrency: 2,
        ..settings()
    };
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings, many);
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let started = std::time::Instant::now();
    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(done.stats.sent, 5);
    assert!(vendor.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_vendor_panic_marks_campaign_failed() {
    let vendor = Arc::new(ScriptedVendor {
        panic_on: Some("C2".into()),
        ..Default::default()
    });
    let h = harness(vendor, Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("vendor exploded"));
    assert!(done.stats.sent + done.stats.failed <= done.stats.total);
}

#[tokio::test]
async fn test_storage_failure_mid_dispatch_marks_campaign_failed() {
    let vendor = Arc::new(ScriptedVendor::default());
    let messages = Arc::new(FlakyMessageStore {
        inner: InMemoryMessageStore::new(),
        healthy: 1,
        calls: AtomicUsize::new(0),
    });
    let h = harness(vendor, messages, settings(), customers());
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("message table unavailable"));
    assert_eq!(done.stats.sent, 1);

    let stored = h.campaigns.find_by_id(&campaign.id).unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Failed);
}

#[tokio::test]
async fn test_create_campaign_validation() {
    let h = harness(
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let err = h
        .service
        .create_campaign(NewCampaign {
            name: " ".into(),
            segment_id: Uuid::new_v4(),
            message_template: "".into(),
            created_by: "ops".into(),
        })
        .unwrap_err();
    let paths: Vec<_> = err
        .validation_errors()
        .unwrap()
        .iter()
        .map(|e| e.path.clone())
        .collect();
    assert_eq!(paths, vec!["name", "messageTemplate"]);

    let err = h
        .service
        .create_campaign(new_campaign(Uuid::new_v4(), "Hello"))
        .unwrap_err();
    assert!(matches!(err, CrmError::NotFound { entity: "Segment", .. }));
}

#[tokio::test]
async fn test_start_unknown_campaign_is_not_found() {
    let h = harness(
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let err = h.service.start(&Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, CrmError::NotFound { entity: "Campaign", .. }));
}

#[tokio::test]
async fn test_segment_deleted_before_start_is_not_found() {
    let h = harness(
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let segment_id = everyone(&h);
    let campaign = h.service.create_campaign(new_campaign(segment_id, "Hello")).unwrap();
    h.segments.delete(&segment_id).unwrap();

    let err = h.service.start(&campaign.id).unwrap_err();
    assert!(matches!(err, CrmError::NotFound { entity: "Segment", .. }));
    assert_eq!(h.service.get(&campaign.id).unwrap().status, CampaignStatus::Draft);
}

#[tokio::test]
async fn test_list_by_creator_newest_first() {
    let h = harness(
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let segment_id = everyone(&h);
    let first = h.service.create_campaign(new_campaign(segment_id, "One")).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.service.create_campaign(new_campaign(segment_id, "Two")).unwrap();

    let ids: Vec<_> = h
        .service
        .list_by_creator("ops")
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(h.service.list_by_creator("nobody").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_starts_have_one_winner() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let campaign = h.service.create_campaign(new_campaign(everyone(&h), "Hello")).unwrap();

    let gate = Arc::new(tokio::sync::Barrier::new(2));
    let racers: Vec<_> = (0..2)
        .map(|_| {
            let service = h.service.clone();
            let gate = gate.clone();
            let id = campaign.id;
            tokio::spawn(async move {
                gate.wait().await;
                service.start(&id)
            })
        })
        .collect();

    let mut won = 0;
    let mut rejected = 0;
    for racer in racers {
        match racer.await.unwrap() {
            Ok(running) => {
                assert_eq!(running.status, CampaignStatus::Running);
                won += 1;
            }
            Err(CrmError::AlreadyStarted(_)) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((won, rejected), (1, 1));

    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.stats.sent, 3);
    assert_eq!(h.messages.list_by_campaign(&campaign.id).unwrap().len(), 3);
    assert_eq!(vendor.calls().len(), 3);
}

#[tokio::test]
async fn test_empty_audience_completes_immediately() {
    let vendor = Arc::new(ScriptedVendor::default());
    let h = harness(vendor.clone(), Arc::new(InMemoryMessageStore::new()), settings(), customers());
    let rules = RuleBuilder::complex().gt(Field::TotalSpend, 1_000_000.0).build().unwrap();
    let segment = h.segments.create_from_rules("Nobody", rules, "ops").unwrap();
    assert_eq!(segment.audience_size(), 0);

    let running = h.service.launch(new_campaign(segment.id, "Hello")).unwrap();
    assert_eq!(running.stats.total, 0);

    let done = h.service.dispatcher().wait(&running.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.stats.sent + done.stats.failed, 0);
    assert!(done.completed_at.is_some());
    assert!(vendor.calls().is_empty());
    assert!(h.messages.list_by_campaign(&running.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_finished_campaigns_release_their_tasks() {
    let h = harness(
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let segment_id = everyone(&h);
    let ids: Vec<Uuid> = (0..20)
        .map(|_| h.service.launch(new_campaign(segment_id, "Hello")).unwrap().id)
        .collect();

    for _ in 0..100 {
        if h.service.dispatcher().active().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.service.dispatcher().active().is_empty());
    for id in &ids {
        assert_eq!(h.service.get(id).unwrap().status, CampaignStatus::Completed);
        let done = h.service.dispatcher().wait(id).await.unwrap();
        assert_eq!(done.stats.sent, 3);
    }
}

#[tokio::test]
async fn test_transient_finish_error_is_retried() {
    let campaigns = Arc::new(StickyFinishStore::failing(1));
    let h = harness_on(
        campaigns.clone(),
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(campaigns.finish_calls.load(Ordering::SeqCst), 2);
    let stored = h.campaigns.find_by_id(&campaign.id).unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn test_unrecordable_completion_falls_back_to_failed() {
    let campaigns = Arc::new(StickyFinishStore::failing(3));
    let h = harness_on(
        campaigns,
        Arc::new(ScriptedVendor::default()),
        Arc::new(InMemoryMessageStore::new()),
        settings(),
        customers(),
    );
    let campaign = h.service.launch(new_campaign(everyone(&h), "Hello")).unwrap();

    let done = h.service.dispatcher().wait(&campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("write timeout"));
    assert_eq!(done.stats.sent, 3);
    let stored = h.campaigns.find_by_id(&campaign.id).unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Failed);
}
