//! Message vendor interface and the simulated vendor used for local runs.
//!
//! A vendor accepts one rendered message at a time and acknowledges it
//! synchronously. Delivery outcomes arrive later, out of band, through a
//! [`ReceiptSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crm_core::config::VendorConfig;
use crm_core::receipt_sink::ReceiptSink;
use crm_core::types::{CustomerId, DeliveryReceipt, ReceiptStatus};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// What the vendor is handed for a single send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Our Message identifier; receipts are correlated on it.
    pub message_id: Uuid,
    pub customer_id: CustomerId,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorAck {
    pub vendor_message_id: String,
    pub status: AckStatus,
    pub timestamp: DateTime<Utc>,
}

/// Per-message send failure. Recorded on the Message, never escalated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VendorError {
    #[error("vendor rejected message: {0}")]
    Rejected(String),

    #[error("vendor did not answer within {0} ms")]
    Timeout(u64),

    #[error("vendor unavailable: {0}")]
    Unavailable(String),
}

impl VendorError {
    pub fn kind(&self) -> &'static str {
        match self {
            VendorError::Rejected(_) => "rejected",
            VendorError::Timeout(_) => "timeout",
            VendorError::Unavailable(_) => "unavailable",
        }
    }
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<VendorAck, VendorError>;
}

/// Stand-in vendor with random latency and a configurable success rate.
/// Accepted messages produce a DELIVERED receipt after a random delay.
pub struct SimulatedVendor {
    config: VendorConfig,
    receipts: Arc<dyn ReceiptSink>,
}

impl SimulatedVendor {
    pub const NAME: &'static str = "dummy-vendor";

    pub fn new(config: VendorConfig, receipts: Arc<dyn ReceiptSink>) -> Self {
        Self { config, receipts }
    }

    fn pick_ms(low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }

    fn schedule_receipt(&self, message_id: Uuid) {
        let delay = Self::pick_ms(
            self.config.receipt_delay_min_ms,
            self.config.receipt_delay_max_ms,
        );
        let sink = Arc::clone(&self.receipts);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let receipt = DeliveryReceipt::new(message_id, ReceiptStatus::Delivered)
                .with_metadata(json!({ "deliveryAttempt": 1, "vendor": SimulatedVendor::NAME }));
            if let Err(e) = sink.submit(receipt) {
                warn!(message_id = %message_id, error = %e, "Receipt callback rejected");
            }
        });
    }
}

#[async_trait]
impl VendorClient for SimulatedVendor {
    async fn send(&self, message: &OutboundMessage) -> Result<VendorAck, VendorError> {
        let latency = Self::pick_ms(self.config.min_latency_ms, self.config.max_latency_ms);
        tokio::time::sleep(Duration::from_millis(latency)).await;

        let roll: f64 = rand::thread_rng().gen();
        if roll >= self.config.success_rate {
            debug!(message_id = %message.message_id, "Simulated vendor rejected message");
            return Err(VendorError::Rejected("simulated delivery failure".to_string()));
        }

        self.schedule_receipt(message.message_id);
        Ok(VendorAck {
            vendor_message_id: format!("vendor_{}", Uuid::new_v4().simple()),
            status: AckStatus::Accepted,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_core::receipt_sink::CaptureReceiptSink;

    fn config(success_rate: f64) -> VendorConfig {
        VendorConfig {
            success_rate,
            min_latency_ms: 0,
            max_latency_ms: 0,
            receipt_delay_min_ms: 5,
            receipt_delay_max_ms: 5,
        }
    }

    fn outbound() -> OutboundMessage {
        OutboundMessage {
            message_id: Uuid::new_v4(),
            customer_id: "C1".into(),
            body: "Hi".into(),
        }
    }

    #[tokio::test]
    async fn test_accepted_send_delivers_receipt_later() {
        let sink = Arc::new(CaptureReceiptSink::new());
        let vendor = SimulatedVendor::new(config(1.0), sink.clone());
        let msg = outbound();

        let ack = vendor.send(&msg).await.unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);
        assert!(ack.vendor_message_id.starts_with("vendor_"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let receipts = sink.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].message_id, msg.message_id);
        assert_eq!(receipts[0].status, ReceiptStatus::Delivered);
        assert_eq!(receipts[0].metadata["vendor"], "dummy-vendor");
        assert_eq!(receipts[0].metadata["deliveryAttempt"], 1);
    }

    #[tokio::test]
    async fn test_rejection_sends_no_receipt() {
        let sink = Arc::new(CaptureReceiptSink::new());
        let vendor = SimulatedVendor::new(config(0.0), sink.clone());

        let err = vendor.send(&outbound()).await.unwrap_err();
        assert_eq!(err.kind(), "rejected");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_pick_ms_handles_degenerate_range() {
        assert_eq!(SimulatedVendor::pick_ms(7, 7), 7);
        assert_eq!(SimulatedVendor::pick_ms(9, 3), 9);
        let v = SimulatedVendor::pick_ms(1, 4);
        assert!((1..=4).contains(&v));
    }
}
