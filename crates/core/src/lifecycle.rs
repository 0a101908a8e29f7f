//! Campaign and message lifecycle tables.
//!
//! Both state machines are monotonic: campaigns move DRAFT → RUNNING →
//! {COMPLETED, FAILED}; messages move PENDING → {SENT, FAILED} and SENT may
//! later become DELIVERED. Nothing leaves a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrmError, CrmResult};
use crate::types::{CampaignStatus, DeliveryReceipt, Message, MessageStatus, StatsDelta};

/// A single permitted campaign transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: &'static str,
}

pub const CAMPAIGN_TRANSITIONS: [CampaignTransition; 3] = [
    CampaignTransition {
        from: CampaignStatus::Draft,
        to: CampaignStatus::Running,
        trigger: "dispatch_started",
    },
    CampaignTransition {
        from: CampaignStatus::Running,
        to: CampaignStatus::Completed,
        trigger: "all_batches_attempted",
    },
    CampaignTransition {
        from: CampaignStatus::Running,
        to: CampaignStatus::Failed,
        trigger: "dispatch_loop_error",
    },
];

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }

    pub fn can_transition(&self, to: CampaignStatus) -> bool {
        CAMPAIGN_TRANSITIONS
            .iter()
            .any(|t| t.from == *self && t.to == to)
    }

    /// Checks a transition, mapping a second start to `AlreadyStarted`.
    pub fn check_transition(&self, to: CampaignStatus, campaign_id: &Uuid) -> CrmResult<()> {
        if self.can_transition(to) {
            return Ok(());
        }
        if to == CampaignStatus::Running {
            return Err(CrmError::AlreadyStarted(campaign_id.to_string()));
        }
        Err(CrmError::InvalidTransition {
            from: self.to_string(),
            to: to.to_string(),
        })
    }
}

impl MessageStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageStatus::Pending)
    }

    /// PENDING → DELIVERED covers a receipt that overtakes the send ack.
    pub fn can_transition(&self, to: MessageStatus) -> bool {
        matches!(
            (*self, to),
            (MessageStatus::Pending, MessageStatus::Sent)
                | (MessageStatus::Pending, MessageStatus::Failed)
                | (MessageStatus::Pending, MessageStatus::Delivered)
                | (MessageStatus::Sent, MessageStatus::Delivered)
        )
    }
}

/// A message status change that actually happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTransition {
    pub message_id: Uuid,
    pub campaign_id: Uuid,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

impl MessageTransition {
    /// Counter movement implied by this transition. A message enters
    /// `sent + failed` at most once.
    pub fn stats_delta(&self) -> StatsDelta {
        match (self.from, self.to) {
            (MessageStatus::Pending, MessageStatus::Sent) => StatsDelta::sent(1),
            (MessageStatus::Pending, MessageStatus::Failed) => StatsDelta::failed(1),
            (MessageStatus::Pending, MessageStatus::Delivered) => StatsDelta {
                sent: 1,
                failed: 0,
                delivered: 1,
            },
            (MessageStatus::Sent, MessageStatus::Delivered) => StatsDelta {
                delivered: 1,
                ..Default::default()
            },
            _ => StatsDelta::default(),
        }
    }
}

/// Outcome of one vendor send attempt, recorded by the dispatcher.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent {
        response: serde_json::Value,
        at: DateTime<Utc>,
    },
    Failed {
        response: serde_json::Value,
        attempts: u32,
    },
}

impl SendOutcome {
    /// Applies the outcome to a message. Only a PENDING message moves; the
    /// returned transition is `None` when a receipt got there first.
    pub fn apply(&self, message: &mut Message) -> Option<MessageTransition> {
        let target = match self {
            SendOutcome::Sent { .. } => MessageStatus::Sent,
            SendOutcome::Failed { .. } => MessageStatus::Failed,
        };
        if !message.status.is_pending() {
            return None;
        }
        let from = message.status;
        match self {
            SendOutcome::Sent { response, at } => {
                message.delivery_attempts = message.delivery_attempts.max(1);
                message.vendor_response = Some(response.clone());
                message.sent_at = Some(*at);
            }
            SendOutcome::Failed { response, attempts } => {
                message.delivery_attempts = *attempts;
                message.vendor_response = Some(response.clone());
            }
        }
        message.status = target;
        message.updated_at = Utc::now();
        Some(MessageTransition {
            message_id: message.message_id,
            campaign_id: message.campaign_id,
            from,
            to: target,
        })
    }
}

/// Applies a delivery receipt to a message. The status only moves along a
/// permitted edge, and a receipt that moves nothing leaves the message
/// untouched. The one exception is a FAILED receipt for a SENT message: its
/// payload is kept under `vendorResponse.deliveryStatus` without a status change.
pub fn apply_receipt(message: &mut Message, receipt: &DeliveryReceipt) -> Option<MessageTransition> {
    let target = receipt.status.target();
    if !message.status.can_transition(target) {
        if message.status == MessageStatus::Sent && target == MessageStatus::Failed {
            record_delivery_status(message, receipt);
        }
        return None;
    }
    record_delivery_status(message, receipt);
    let from = message.status;
    message.status = target;
    match target {
        MessageStatus::Delivered => {
            message.delivered_at = Some(receipt.timestamp);
            message.sent_at.get_or_insert(receipt.timestamp);
            message.delivery_attempts = message.delivery_attempts.max(1);
        }
        MessageStatus::Sent => {
            message.sent_at.get_or_insert(receipt.timestamp);
            message.delivery_attempts = message.delivery_attempts.max(1);
        }
        MessageStatus::Failed => {
            message.delivery_attempts = message.delivery_attempts.max(1);
        }
        MessageStatus::Pending => {}
    }
    Some(MessageTransition {
        message_id: message.message_id,
        campaign_id: message.campaign_id,
        from,
        to: target,
    })
}

fn record_delivery_status(message: &mut Message, receipt: &DeliveryReceipt) {
    let payload = serde_json::to_value(receipt).unwrap_or(serde_json::Value::Null);
    match message.vendor_response.as_mut() {
        Some(serde_json::Value::Object(map)) => {
            map.insert("deliveryStatus".to_string(), payload);
        }
        _ => {
            message.vendor_response = Some(serde_json::json!({ "deliveryStatus": payload }));
        }
    }
    message.updated_at = Utc::now();
}
