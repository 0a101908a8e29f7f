//! Receipt ingress seam: anything that accepts delivery receipts.
//!
//! The simulated vendor pushes its out-of-band callbacks through an
//! `Arc<dyn ReceiptSink>`; the reconciler is the production implementation.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::CrmResult;
use crate::types::DeliveryReceipt;

pub trait ReceiptSink: Send + Sync {
    fn submit(&self, receipt: DeliveryReceipt) -> CrmResult<()>;
}

/// Drops every receipt.
pub struct NoOpReceiptSink;

impl ReceiptSink for NoOpReceiptSink {
    fn submit(&self, _receipt: DeliveryReceipt) -> CrmResult<()> {
        Ok(())
    }
}

pub fn noop_sink() -> Arc<dyn ReceiptSink> {
    Arc::new(NoOpReceiptSink)
}

/// In-memory sink that captures receipts for testing.
#[derive(Default)]
pub struct CaptureReceiptSink {
    receipts: Mutex<Vec<DeliveryReceipt>>,
}

impl CaptureReceiptSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receipts(&self) -> Vec<DeliveryReceipt> {
        self.receipts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.receipts.lock().len()
    }
}

impl ReceiptSink for CaptureReceiptSink {
    fn submit(&self, receipt: DeliveryReceipt) -> CrmResult<()> {
        self.receipts.lock().push(receipt);
        Ok(())
    }
}
