//! Campaign service: creation, launch and reporting on top of the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crm_core::memory::status_counts;
use crm_core::store::{CampaignStore, MessageStore};
use crm_core::templates::placeholders;
use crm_core::types::{Campaign, CampaignStats, CampaignStatus, Customer, MessageStatus};
use crm_core::{CrmError, CrmResult, ValidationError};
use crm_segmentation::SegmentStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::CampaignDispatcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub name: String,
    pub segment_id: Uuid,
    pub message_template: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignReport {
    pub campaign_id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub total: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: CampaignStats,
    pub message_counts: HashMap<MessageStatus, u64>,
    /// `sent / total`, 0 when the audience is empty.
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone)]
pub struct CampaignService {
    campaigns: Arc<dyn CampaignStore>,
    segments: Arc<dyn SegmentStore>,
    messages: Arc<dyn MessageStore>,
    dispatcher: CampaignDispatcher,
}

impl CampaignService {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        segments: Arc<dyn SegmentStore>,
        messages: Arc<dyn MessageStore>,
        dispatcher: CampaignDispatcher,
    ) -> Self {
        Self {
            campaigns,
            segments,
            messages,
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &CampaignDispatcher {
        &self.dispatcher
    }

    /// Persists a DRAFT campaign against an existing segment.
    pub fn create_campaign(&self, request: NewCampaign) -> CrmResult<Campaign> {
        let mut errors = Vec::new();
        if request.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "Campaign name is required"));
        }
        if request.message_template.trim().is_empty() {
            errors.push(ValidationError::new(
                "messageTemplate",
                "Message template is required",
            ));
        }
        if request.created_by.trim().is_empty() {
            errors.push(ValidationError::new("createdBy", "Creator is required"));
        }
        if !errors.is_empty() {
            return Err(CrmError::Validation(errors));
        }

        if self.segments.find_by_id(&request.segment_id)?.is_none() {
            return Err(CrmError::not_found("Segment", request.segment_id));
        }

        let unknown: Vec<String> = placeholders(&request.message_template)
            .into_iter()
            .filter(|p| !Customer::ATTRIBUTES.contains(&p.as_str()))
            .collect();
        if !unknown.is_empty() {
            warn!(
                placeholders = ?unknown,
                "Template references unknown fields; they will be sent verbatim"
            );
        }

        let campaign = Campaign::draft(
            request.name.trim(),
            request.segment_id,
            request.message_template,
            request.created_by,
        );
        self.campaigns.create(campaign.clone())?;
        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(campaign)
    }

    /// Creates the campaign and starts dispatch immediately.
    pub fn launch(&self, request: NewCampaign) -> CrmResult<Campaign> {
        let campaign = self.create_campaign(request)?;
        self.dispatcher.start_campaign(&campaign.id)
    }

    pub fn start(&self, campaign_id: &Uuid) -> CrmResult<Campaign> {
        self.dispatcher.start_campaign(campaign_id)
    }

    pub fn get(&self, campaign_id: &Uuid) -> CrmResult<Campaign> {
        self.campaigns
            .find_by_id(campaign_id)?
            .ok_or_else(|| CrmError::not_found("Campaign", campaign_id))
    }

    pub fn list_by_creator(&self, created_by: &str) -> CrmResult<Vec<Campaign>> {
        self.campaigns.list_by_creator(created_by)
    }

    pub fn report(&self, campaign_id: &Uuid) -> CrmResult<CampaignReport> {
        let campaign = self.get(campaign_id)?;
        let messages = self.messages.list_by_campaign(campaign_id)?;
        let success_rate = if campaign.stats.total == 0 {
            0.0
        } else {
            campaign.stats.sent as f64 / campaign.stats.total as f64
        };
        Ok(CampaignReport {
            campaign_id: campaign.id,
            name: campaign.name,
            status: campaign.status,
            total: campaign.stats.total,
            started_at: campaign.started_at,
            completed_at: campaign.completed_at,
            stats: campaign.stats,
            message_counts: status_counts(&messages),
            success_rate,
            failure_reason: campaign.failure_reason,
        })
    }
}
