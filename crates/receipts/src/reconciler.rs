//! Delivery receipt reconciler.
//!
//! Receipts are queued on arrival and applied to message state in bulk,
//! at most `batch_size` per flush, either when the queue reaches the batch
//! threshold or on the flush interval. A failed bulk update puts the whole
//! batch back at the head of the queue, and threshold flushes pause until the
//! next interval tick. Campaign counter deltas are grouped per campaign and
//! kept until their increment succeeds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crm_core::config::ReceiptConfig;
use crm_core::receipt_sink::ReceiptSink;
use crm_core::store::{CampaignStore, MessageStore};
use crm_core::types::{DeliveryReceipt, StatsDelta};
use crm_core::{CrmError, CrmResult};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl From<&ReceiptConfig> for ReconcilerSettings {
    fn from(config: &ReceiptConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ReceiptConfig::default())
    }
}

/// What a single flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Receipts covered by the bulk update.
    pub applied: usize,
    /// Messages whose status changed.
    pub transitions: usize,
    /// Receipts for message ids the store does not know.
    pub unknown: usize,
    /// Campaigns whose counters were incremented.
    pub campaigns_updated: usize,
    /// Campaigns whose increment is still outstanding.
    pub deferred_campaigns: usize,
}

pub struct DeliveryReconciler {
    messages: Arc<dyn MessageStore>,
    campaigns: Arc<dyn CampaignStore>,
    settings: ReconcilerSettings,
    queue: Mutex<VecDeque<DeliveryReceipt>>,
    pending_deltas: Mutex<HashMap<Uuid, StatsDelta>>,
    flushing: Mutex<()>,
    wake: Notify,
    running: AtomicBool,
}

impl DeliveryReconciler {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        campaigns: Arc<dyn CampaignStore>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            messages,
            campaigns,
            settings,
            queue: Mutex::new(VecDeque::new()),
            pending_deltas: Mutex::new(HashMap::new()),
            flushing: Mutex::new(()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> ReconcilerSettings {
        self.settings
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of the queued receipts, head first.
    pub fn queued(&self) -> Vec<DeliveryReceipt> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn deferred_campaigns(&self) -> usize {
        self.pending_deltas.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0 && self.deferred_campaigns() == 0
    }

    /// Queues a receipt, waking the flush loop once the threshold is reached.
    pub fn enqueue(&self, receipt: DeliveryReceipt) {
        let len = {
            let mut queue = self.queue.lock();
            queue.push_back(receipt);
            queue.len()
        };
        metrics::counter!("receipts.queued").increment(1);
        if len >= self.settings.batch_size {
            self.wake.notify_one();
        }
    }

    /// Parses and queues a raw receipt payload.
    pub fn ingest(&self, raw: &Value) -> CrmResult<()> {
        let receipt = DeliveryReceipt::from_json(raw)?;
        self.enqueue(receipt);
        Ok(())
    }

    /// Applies up to `batch_size` receipts from the head of the queue in one
    /// bulk update.
    ///
    /// On a storage error the batch is requeued ahead of any receipts that
    /// arrived meanwhile and the error is returned.
    pub fn flush(&self) -> CrmResult<FlushOutcome> {
        let _flushing = self.flushing.lock();
        let mut outcome = FlushOutcome::default();

        let batch: Vec<DeliveryReceipt> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(self.settings.batch_size);
            queue.drain(..take).collect()
        };
        if !batch.is_empty() {
            match self.messages.bulk_apply_receipts(&batch) {
                Ok(applied) => {
                    outcome.applied = batch.len();
                    outcome.transitions = applied.transitions.len();
                    outcome.unknown = applied.unknown.len();
                    for id in &applied.unknown {
                        warn!(message_id = %id, "Receipt for unknown message ignored");
                    }
                    metrics::counter!("receipts.flushed").increment(batch.len() as u64);
                    metrics::counter!("receipts.ignored").increment(applied.unknown.len() as u64);

                    let mut pending = self.pending_deltas.lock();
                    for (campaign_id, delta) in applied.deltas_by_campaign() {
                        *pending.entry(campaign_id).or_default() += delta;
                    }
                }
                Err(e) => {
                    let count = batch.len();
                    self.requeue(batch);
                    metrics::counter!("receipts.requeued").increment(count as u64);
                    warn!(count, error = %e, "Receipt flush failed, batch requeued");
                    return Err(e);
                }
            }
        }

        let (updated, deferred) = self.push_deltas();
        outcome.campaigns_updated = updated;
        outcome.deferred_campaigns = deferred;

        if outcome.applied > 0 || updated > 0 {
            debug!(
                applied = outcome.applied,
                transitions = outcome.transitions,
                unknown = outcome.unknown,
                campaigns = updated,
                "Receipts flushed"
            );
        }
        Ok(outcome)
    }

    fn requeue(&self, batch: Vec<DeliveryReceipt>) {
        let mut queue = self.queue.lock();
        for receipt in batch.into_iter().rev() {
            queue.push_front(receipt);
        }
    }

    /// One increment per campaign. Failed increments stay pending.
    fn push_deltas(&self) -> (usize, usize) {
        let mut pending = self.pending_deltas.lock();
        let mut updated = 0;
        pending.retain(|campaign_id, delta| {
            match self.campaigns.increment(campaign_id, *delta) {
                Ok(()) => {
                    updated += 1;
                    false
                }
                Err(CrmError::NotFound { .. }) => {
                    warn!(campaign_id = %campaign_id, "Counter delta for unknown campaign dropped");
                    false
                }
                Err(e) => {
                    warn!(campaign_id = %campaign_id, error = %e, "Campaign increment deferred");
                    true
                }
            }
        });
        (updated, pending.len())
    }

    /// Flushes one batch, logging a failure. Returns whether it succeeded.
    fn flush_logged(&self, trigger: &'static str) -> bool {
        match self.flush() {
            Ok(_) => {
                if self.queue_len() >= self.settings.batch_size {
                    self.wake.notify_one();
                }
                true
            }
            Err(e) => {
                error!(trigger, error = %e, "Reconciler flush failed");
                false
            }
        }
    }

    /// Flushes batch by batch until the queue is empty or a flush fails.
    fn drain_logged(&self, trigger: &'static str) {
        while !self.is_idle() {
            if !self.flush_logged(trigger) || self.queue_len() == 0 {
                break;
            }
        }
    }

    /// Spawns the flush loop. Only one loop may run per reconciler.
    pub fn start(self: &Arc<Self>) -> CrmResult<ReconcilerHandle> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CrmError::Conflict("receipt reconciler already running".into()));
        }
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _running = RunningGuard(Arc::clone(&this));
            let mut interval = tokio::time::interval(this.settings.flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            info!(
                batch_size = this.settings.batch_size,
                flush_interval_ms = this.settings.flush_interval.as_millis() as u64,
                "Receipt reconciler started"
            );

            // Set after a failed flush; threshold wakeups wait for the next tick.
            let mut backing_off = false;
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = this.wake.notified() => {
                        if !backing_off && this.queue_len() >= this.settings.batch_size {
                            backing_off = !this.flush_logged("threshold");
                        }
                    }
                    _ = interval.tick() => {
                        if !this.is_idle() {
                            backing_off = !this.flush_logged("interval");
                        } else {
                            backing_off = false;
                        }
                    }
                }
            }

            this.drain_logged("shutdown");
            info!(pending = this.queue_len(), "Receipt reconciler stopped");
        });
        Ok(ReconcilerHandle {
            shutdown: Some(shutdown),
            task,
        })
    }
}

/// Clears the running flag when the flush loop exits, including by panic.
struct RunningGuard(Arc<DeliveryReconciler>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl ReceiptSink for DeliveryReconciler {
    fn submit(&self, receipt: DeliveryReceipt) -> CrmResult<()> {
        self.enqueue(receipt);
        Ok(())
    }
}

/// Owner of a running flush loop.
pub struct ReconcilerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stops the loop after a final flush.
    pub async fn stop(mut self) -> CrmResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| CrmError::Internal(anyhow::anyhow!("reconciler task failed: {e}")))
    }
}
