use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use uuid::Uuid;

use crate::error::{CrmError, CrmResult};

pub type CustomerId = String;

/// Customer attributes that segment rules may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TotalSpend,
    Visits,
    TotalOrders,
    AvgOrderValue,
    LastOrderDate,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::TotalSpend,
        Field::Visits,
        Field::TotalOrders,
        Field::AvgOrderValue,
        Field::LastOrderDate,
    ];

    /// Parses a canonical field name or one of the legacy aliases
    /// (`spend`, `orders`, `average_order`, `last_active`).
    pub fn parse(name: &str) -> Option<Field> {
        match name {
            "total_spend" | "spend" => Some(Field::TotalSpend),
            "visits" => Some(Field::Visits),
            "total_orders" | "orders" => Some(Field::TotalOrders),
            "avg_order_value" | "average_order" => Some(Field::AvgOrderValue),
            "last_order_date" | "last_active" => Some(Field::LastOrderDate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TotalSpend => "total_spend",
            Field::Visits => "visits",
            Field::TotalOrders => "total_orders",
            Field::AvgOrderValue => "avg_order_value",
            Field::LastOrderDate => "last_order_date",
        }
    }

    /// Date-typed fields compare as epoch milliseconds.
    pub fn is_date(&self) -> bool {
        matches!(self, Field::LastOrderDate)
    }

    /// The customer's numeric value for this field. `None` only for a missing
    /// `last_order_date`, which matches no predicate.
    pub fn value_of(&self, customer: &Customer) -> Option<f64> {
        match self {
            Field::TotalSpend => Some(customer.total_spend),
            Field::Visits => Some(customer.visits as f64),
            Field::TotalOrders => Some(customer.total_orders as f64),
            Field::AvgOrderValue => Some(customer.avg_order_value()),
            Field::LastOrderDate => customer
                .last_order_date
                .map(|d| d.timestamp_millis() as f64),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

impl Comparator {
    pub fn parse(name: &str) -> Option<Comparator> {
        match name {
            "gt" => Some(Comparator::Gt),
            "lt" => Some(Comparator::Lt),
            "gte" => Some(Comparator::Gte),
            "lte" => Some(Comparator::Lte),
            "eq" => Some(Comparator::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Gt => "gt",
            Comparator::Lt => "lt",
            Comparator::Gte => "gte",
            Comparator::Lte => "lte",
            Comparator::Eq => "eq",
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Gte => ">=",
            Comparator::Lte => "<=",
            Comparator::Eq => "=",
        }
    }

    pub fn matches(&self, actual: f64, expected: f64) -> bool {
        match self {
            Comparator::Gt => actual > expected,
            Comparator::Lt => actual < expected,
            Comparator::Gte => actual >= expected,
            Comparator::Lte => actual <= expected,
            Comparator::Eq => actual == expected,
        }
    }
}

/// One attribute-range predicate issued against the customer repository.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub comparator: Comparator,
    pub value: f64,
}

impl Predicate {
    pub fn new(field: Field, comparator: Comparator, value: f64) -> Self {
        Self {
            field,
            comparator,
            value,
        }
    }

    pub fn matches(&self, customer: &Customer) -> bool {
        self.field
            .value_of(customer)
            .map(|actual| self.comparator.matches(actual, self.value))
            .unwrap_or(false)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_date() {
            let date = DateTime::<Utc>::from_timestamp_millis(self.value as i64)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| self.value.to_string());
            write!(f, "{} {} {}", self.field, self.comparator.symbol(), date)
        } else {
            write!(f, "{} {} {}", self.field, self.comparator.symbol(), self.value)
        }
    }
}

/// Read-only snapshot of a customer as held by the customer repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub total_spend: f64,
    #[serde(default)]
    pub total_orders: u64,
    #[serde(default)]
    pub visits: u64,
    #[serde(default)]
    pub last_order_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Customer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            phone: None,
            location: None,
            total_spend: 0.0,
            total_orders: 0,
            visits: 0,
            last_order_date: None,
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }

    /// Negative or non-finite spend is stored as zero.
    pub fn with_spend(mut self, total_spend: f64, total_orders: u64) -> Self {
        self.total_spend = if total_spend.is_finite() {
            total_spend.max(0.0)
        } else {
            0.0
        };
        self.total_orders = total_orders;
        self
    }

    pub fn with_visits(mut self, visits: u64) -> Self {
        self.visits = visits;
        self
    }

    pub fn with_last_order(mut self, at: DateTime<Utc>) -> Self {
        self.last_order_date = Some(at);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn avg_order_value(&self) -> f64 {
        if self.total_orders == 0 {
            0.0
        } else {
            self.total_spend / self.total_orders as f64
        }
    }

    /// Attribute names understood by [`Customer::attribute`].
    pub const ATTRIBUTES: &'static [&'static str] = &[
        "id",
        "customer_id",
        "name",
        "first_name",
        "email",
        "phone",
        "location",
        "total_spend",
        "total_orders",
        "visits",
        "avg_order_value",
        "last_order_date",
        "created_at",
        "tags",
    ];

    /// String form of a named attribute, for template personalization.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "id" | "customer_id" => Some(self.id.clone()),
            "name" => Some(self.name.clone()),
            "first_name" => self.name.split_whitespace().next().map(str::to_string),
            "email" => Some(self.email.clone()),
            "phone" => self.phone.clone(),
            "location" => self.location.clone(),
            "total_spend" => Some(format_amount(self.total_spend)),
            "total_orders" => Some(self.total_orders.to_string()),
            "visits" => Some(self.visits.to_string()),
            "avg_order_value" => Some(format_amount(self.avg_order_value())),
            "last_order_date" => self
                .last_order_date
                .map(|d| d.format("%Y-%m-%d").to_string()),
            "created_at" => Some(self.created_at.format("%Y-%m-%d").to_string()),
            "tags" if !self.tags.is_empty() => Some(self.tags.join(", ")),
            _ => None,
        }
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

// ─── Campaigns ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignStatus::Draft => "DRAFT",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Aggregate counters. `sent` counts messages that reached SENT or DELIVERED,
/// `delivered` the subset confirmed by a receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
}

impl CampaignStats {
    pub fn attempted(&self) -> u64 {
        self.sent + self.failed
    }
}

/// Increment applied atomically to a campaign's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub sent: u64,
    pub failed: u64,
    pub delivered: u64,
}

impl StatsDelta {
    pub fn sent(n: u64) -> Self {
        Self {
            sent: n,
            ..Default::default()
        }
    }

    pub fn failed(n: u64) -> Self {
        Self {
            failed: n,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sent == 0 && self.failed == 0 && self.delivered == 0
    }
}

impl AddAssign for StatsDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.failed += rhs.failed;
        self.delivered += rhs.delivered;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub segment_id: Uuid,
    pub message_template: String,
    pub status: CampaignStatus,
    /// Audience size captured when the campaign entered RUNNING.
    pub audience_size: u64,
    pub stats: CampaignStats,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn draft(
        name: impl Into<String>,
        segment_id: Uuid,
        message_template: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            segment_id,
            message_template: message_template.into(),
            status: CampaignStatus::Draft,
            audience_size: 0,
            stats: CampaignStats::default(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Delivered => "DELIVERED",
        };
        f.write_str(s)
    }
}

/// Communication log entry: one per (campaign, customer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub campaign_id: Uuid,
    pub customer_id: CustomerId,
    pub body: String,
    pub status: MessageStatus,
    pub delivery_attempts: u32,
    pub vendor_response: Option<serde_json::Value>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn pending(campaign_id: Uuid, customer_id: impl Into<String>, body: String) -> Self {
        let now = Utc::now();
        Self {
            message_id: Uuid::new_v4(),
            campaign_id,
            customer_id: customer_id.into(),
            body,
            status: MessageStatus::Pending,
            delivery_attempts: 0,
            vendor_response: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Delivery receipts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
}

impl ReceiptStatus {
    pub fn parse(value: &str) -> Option<ReceiptStatus> {
        match value.to_ascii_uppercase().as_str() {
            "SENT" => Some(ReceiptStatus::Sent),
            "DELIVERED" => Some(ReceiptStatus::Delivered),
            "FAILED" => Some(ReceiptStatus::Failed),
            _ => None,
        }
    }

    pub fn target(&self) -> MessageStatus {
        match self {
            ReceiptStatus::Sent => MessageStatus::Sent,
            ReceiptStatus::Delivered => MessageStatus::Delivered,
            ReceiptStatus::Failed => MessageStatus::Failed,
        }
    }
}

/// Asynchronous delivery outcome reported by the vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub status: ReceiptStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DeliveryReceipt {
    pub fn new(message_id: Uuid, status: ReceiptStatus) -> Self {
        Self {
            message_id,
            status,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parses an inbound receipt payload. `messageId` and a recognised
    /// `status` are required; a missing `timestamp` becomes the ingest time.
    pub fn from_json(raw: &serde_json::Value) -> CrmResult<Self> {
        let message_id = raw
            .get("messageId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CrmError::InvalidReceipt("missing messageId".to_string()))?;
        let message_id = Uuid::parse_str(message_id)
            .map_err(|e| CrmError::InvalidReceipt(format!("bad messageId {message_id}: {e}")))?;

        let status = raw
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CrmError::InvalidReceipt("missing status".to_string()))?;
        let status = ReceiptStatus::parse(status)
            .ok_or_else(|| CrmError::InvalidReceipt(format!("unknown status {status}")))?;

        let timestamp = match raw.get("timestamp").and_then(|v| v.as_str()) {
            Some(ts) => parse_timestamp(ts)
                .ok_or_else(|| CrmError::InvalidReceipt(format!("bad timestamp {ts}")))?,
            None => Utc::now(),
        };

        Ok(Self {
            message_id,
            status,
            timestamp,
            metadata: raw.get("metadata").cloned().unwrap_or(serde_json::Value::Null),
        })
    }
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
