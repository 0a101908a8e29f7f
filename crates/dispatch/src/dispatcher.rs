//! Campaign dispatcher: turns a segment's audience into personalized
//! messages and drives them through the vendor in paced batches.
//!
//! `start_campaign` returns once the campaign is RUNNING and every Message
//! row exists in PENDING. Sending happens on a supervised background task:
//! the supervisor awaits the worker and moves the campaign to COMPLETED, or
//! to FAILED if the worker returned an error or panicked. Recording that
//! outcome is retried with backoff and falls back to FAILED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crm_core::config::DispatchConfig;
use crm_core::lifecycle::SendOutcome;
use crm_core::store::{CampaignStore, CustomerRepository, MessageStore};
use crm_core::templates::{personalize, render_with};
use crm_core::types::{Campaign, CampaignStatus, Customer, CustomerId, Message};
use crm_core::{CrmError, CrmResult};
use crm_segmentation::SegmentStore;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::vendor::{OutboundMessage, VendorClient, VendorError};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_BACKOFF: Duration = Duration::from_millis(25);

/// Batch pacing and vendor call limits.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub send_concurrency: usize,
    pub send_timeout: Duration,
}

impl From<&DispatchConfig> for DispatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            send_concurrency: config.send_concurrency.max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

/// One message as the worker sees it.
#[derive(Debug, Clone)]
struct PlannedSend {
    message_id: Uuid,
    customer_id: CustomerId,
    body: String,
    customer_found: bool,
}

struct DispatcherInner {
    campaigns: Arc<dyn CampaignStore>,
    segments: Arc<dyn SegmentStore>,
    customers: Arc<dyn CustomerRepository>,
    messages: Arc<dyn MessageStore>,
    vendor: Arc<dyn VendorClient>,
    settings: DispatchSettings,
}

#[derive(Clone)]
pub struct CampaignDispatcher {
    inner: Arc<DispatcherInner>,
    handles: Arc<DashMap<Uuid, JoinHandle<CrmResult<Campaign>>>>,
}

impl CampaignDispatcher {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        segments: Arc<dyn SegmentStore>,
        customers: Arc<dyn CustomerRepository>,
        messages: Arc<dyn MessageStore>,
        vendor: Arc<dyn VendorClient>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                campaigns,
                segments,
                customers,
                messages,
                vendor,
                settings,
            }),
            handles: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.inner.settings
    }

    /// Moves the campaign to RUNNING, creates its messages and schedules
    /// delivery. Must be called from within a tokio runtime.
    pub fn start_campaign(&self, campaign_id: &Uuid) -> CrmResult<Campaign> {
        let inner = &self.inner;
        let campaign = inner
            .campaigns
            .find_by_id(campaign_id)?
            .ok_or_else(|| CrmError::not_found("Campaign", campaign_id))?;
        let segment = inner
            .segments
            .find_by_id(&campaign.segment_id)?
            .ok_or_else(|| CrmError::not_found("Segment", campaign.segment_id))?;

        let audience: Vec<CustomerId> = segment.customer_ids.iter().cloned().collect();
        let running = inner
            .campaigns
            .begin(campaign_id, audience.len() as u64, Utc::now())?;
        info!(
            campaign_id = %campaign_id,
            segment_id = %segment.id,
            total = running.stats.total,
            "Campaign running"
        );

        let plan = match inner.create_messages(&running, &audience) {
            Ok(plan) => plan,
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Message creation failed");
                inner.conclude(campaign_id, Err(e.to_string()))?;
                return Err(e);
            }
        };

        let worker_inner = Arc::clone(inner);
        let id = *campaign_id;
        let worker = tokio::spawn(async move { worker_inner.send_all(id, plan).await });

        // The supervisor drops its own entry once the outcome is recorded. It
        // waits for `registered` so the removal cannot precede the insert.
        let (registered, is_registered) = oneshot::channel::<()>();
        let supervisor_inner = Arc::clone(inner);
        let handles = Arc::clone(&self.handles);
        let supervisor = tokio::spawn(async move {
            let result = match worker.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join) => Err(panic_reason(join)),
            };
            let concluded = supervisor_inner.settle(&id, result).await;
            let _ = is_registered.await;
            handles.remove(&id);
            concluded
        });
        self.handles.insert(id, supervisor);
        let _ = registered.send(());

        Ok(running)
    }

    /// Waits for the dispatch task of `campaign_id` and returns the campaign
    /// in its terminal state. A campaign whose task already finished, or that
    /// never ran, is returned as currently stored.
    pub async fn wait(&self, campaign_id: &Uuid) -> CrmResult<Campaign> {
        match self.handles.remove(campaign_id) {
            Some((_, handle)) => handle
                .await
                .map_err(|e| CrmError::DispatchLoop(panic_reason(e)))?,
            None => self
                .inner
                .campaigns
                .find_by_id(campaign_id)?
                .ok_or_else(|| CrmError::not_found("Campaign", campaign_id)),
        }
    }

    /// Campaigns whose dispatch task has not yet recorded its outcome.
    pub fn active(&self) -> Vec<Uuid> {
        self.handles.iter().map(|h| *h.key()).collect()
    }
}

impl DispatcherInner {
    /// Renders every message and writes them in a single bulk insert.
    fn create_messages(&self, campaign: &Campaign, audience: &[CustomerId]) -> CrmResult<Vec<PlannedSend>> {
        let found: HashMap<CustomerId, Customer> = self
            .customers
            .get_many(audience)?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut rows = Vec::with_capacity(audience.len());
        let mut plan = Vec::with_capacity(audience.len());
        for customer_id in audience {
            let customer = found.get(customer_id);
            let body = match customer {
                Some(c) => personalize(&campaign.message_template, c),
                None => render_with(&campaign.message_template, |name| {
                    matches!(name, "id" | "customer_id").then(|| customer_id.clone())
                }),
            };
            let message = Message::pending(campaign.id, customer_id.clone(), body);
            plan.push(PlannedSend {
                message_id: message.message_id,
                customer_id: customer_id.clone(),
                body: message.body.clone(),
                customer_found: customer.is_some(),
            });
            rows.push(message);
        }

        let missing = plan.iter().filter(|p| !p.customer_found).count();
        if missing > 0 {
            warn!(campaign_id = %campaign.id, missing, "Audience members missing from repository");
        }
        self.messages.bulk_insert(rows)?;
        debug!(campaign_id = %campaign.id, count = plan.len(), "Messages created");
        Ok(plan)
    }

    async fn send_all(&self, campaign_id: Uuid, plan: Vec<PlannedSend>) -> CrmResult<()> {
        let batches = plan.len().div_ceil(self.settings.batch_size);
        for (index, batch) in plan.chunks(self.settings.batch_size).enumerate() {
            if index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let sends: Vec<_> = batch
                .iter()
                .map(|planned| self.deliver(campaign_id, planned))
                .collect();
            let results: Vec<CrmResult<()>> = stream::iter(sends)
                .buffer_unordered(self.settings.send_concurrency)
                .collect()
                .await;
            for result in results {
                result?;
            }

            info!(
                campaign_id = %campaign_id,
                batch = index + 1,
                batches,
                size = batch.len(),
                "Batch sent"
            );
        }
        Ok(())
    }

    async fn deliver(&self, campaign_id: Uuid, planned: &PlannedSend) -> CrmResult<()> {
        let outcome = if planned.customer_found {
            let outbound = OutboundMessage {
                message_id: planned.message_id,
                customer_id: planned.customer_id.clone(),
                body: planned.body.clone(),
            };
            let timeout_ms = self.settings.send_timeout.as_millis() as u64;
            match tokio::time::timeout(self.settings.send_timeout, self.vendor.send(&outbound)).await {
                Ok(Ok(ack)) => SendOutcome::Sent {
                    response: serde_json::to_value(&ack)?,
                    at: Utc::now(),
                },
                Ok(Err(e)) => vendor_failure(&e),
                Err(_) => vendor_failure(&VendorError::Timeout(timeout_ms)),
            }
        } else {
            SendOutcome::Failed {
                response: json!({ "error": "customer not found" }),
                attempts: 0,
            }
        };

        if let SendOutcome::Failed { response, .. } = &outcome {
            debug!(
                campaign_id = %campaign_id,
                message_id = %planned.message_id,
                response = %response,
                "Message failed"
            );
        }

        if let Some(transition) = self.messages.record_send(&planned.message_id, &outcome)? {
            let delta = transition.stats_delta();
            if !delta.is_empty() {
                self.campaigns.increment(&campaign_id, delta)?;
            }
            metrics::counter!("dispatch.messages_sent").increment(delta.sent);
            metrics::counter!("dispatch.messages_failed").increment(delta.failed);
        }
        Ok(())
    }

    /// Records the dispatch outcome, retrying transient store errors. When a
    /// COMPLETED outcome cannot be written the campaign is marked FAILED.
    async fn settle(&self, campaign_id: &Uuid, result: Result<(), String>) -> CrmResult<Campaign> {
        let mut outcome = result;
        let mut backoff = FINISH_BACKOFF;
        let mut attempt = 1;
        loop {
            let err = match self.conclude(campaign_id, outcome.clone()) {
                Ok(campaign) => return Ok(campaign),
                Err(e) => e,
            };
            error!(
                campaign_id = %campaign_id,
                attempt,
                error = %err,
                "Failed to record campaign outcome"
            );
            if matches!(
                err,
                CrmError::NotFound { .. } | CrmError::InvalidTransition { .. } | CrmError::AlreadyStarted(_)
            ) {
                return Err(err);
            }
            if attempt >= FINISH_ATTEMPTS {
                if outcome.is_err() {
                    return Err(err);
                }
                outcome = Err(format!("campaign outcome could not be recorded: {err}"));
                attempt = 0;
            }
            tokio::time::sleep(backoff).await;
            backoff *= 2;
            attempt += 1;
        }
    }

    /// Moves a RUNNING campaign to its terminal state.
    fn conclude(&self, campaign_id: &Uuid, result: Result<(), String>) -> CrmResult<Campaign> {
        match result {
            Ok(()) => {
                let campaign =
                    self.campaigns
                        .finish(campaign_id, CampaignStatus::Completed, Utc::now(), None)?;
                metrics::counter!("dispatch.campaigns_completed").increment(1);
                info!(
                    campaign_id = %campaign_id,
                    total = campaign.stats.total,
                    sent = campaign.stats.sent,
                    failed = campaign.stats.failed,
                    "Campaign completed"
                );
                Ok(campaign)
            }
            Err(reason) => {
                error!(campaign_id = %campaign_id, reason = %reason, "Campaign dispatch failed");
                let campaign = self.campaigns.finish(
                    campaign_id,
                    CampaignStatus::Failed,
                    Utc::now(),
                    Some(reason),
                )?;
                metrics::counter!("dispatch.campaigns_failed").increment(1);
                Ok(campaign)
            }
        }
    }
}

fn vendor_failure(error: &VendorError) -> SendOutcome {
    SendOutcome::Failed {
        response: json!({ "error": error.to_string(), "kind": error.kind() }),
        attempts: 1,
    }
}

fn panic_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("dispatch task aborted: {err}");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("dispatch task panicked: {detail}")
}
