use serde::Deserialize;

/// Root engine configuration. Loaded from an optional TOML file and from
/// environment variables with the prefix `CRM_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub receipts: ReceiptConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
}

/// Campaign dispatch pacing. `batch_delay_ms` is backpressure against the
/// message vendor and is applied between every pair of batches.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Vendor calls in flight at once within a single batch.
    #[serde(default = "default_send_concurrency")]
    pub send_concurrency: usize,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptConfig {
    #[serde(default = "default_receipt_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

/// Behaviour of the simulated message vendor.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_receipt_delay_min_ms")]
    pub receipt_delay_min_ms: u64,
    #[serde(default = "default_receipt_delay_max_ms")]
    pub receipt_delay_max_ms: u64,
}

fn default_node_id() -> String {
    "crm-01".to_string()
}
fn default_dispatch_batch_size() -> usize {
    50
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_send_concurrency() -> usize {
    1
}
fn default_send_timeout_ms() -> u64 {
    10_000
}
fn default_receipt_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_success_rate() -> f64 {
    0.9
}
fn default_min_latency_ms() -> u64 {
    100
}
fn default_max_latency_ms() -> u64 {
    500
}
fn default_receipt_delay_min_ms() -> u64 {
    1000
}
fn default_receipt_delay_max_ms() -> u64 {
    3000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_dispatch_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            send_concurrency: default_send_concurrency(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            batch_size: default_receipt_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            success_rate: default_success_rate(),
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            receipt_delay_min_ms: default_receipt_delay_min_ms(),
            receipt_delay_max_ms: default_receipt_delay_max_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            dispatch: DispatchConfig::default(),
            receipts: ReceiptConfig::default(),
            vendor: VendorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (which take precedence).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CRM_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.batch_delay_ms, 1000);
        assert_eq!(config.dispatch.send_concurrency, 1);
        assert_eq!(config.receipts.batch_size, 100);
        assert_eq!(config.receipts.flush_interval_ms, 5000);
        assert!((config.vendor.success_rate - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_section_falls_back_to_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "dispatch": { "batch_size": 10 }
        }))
        .unwrap();
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.dispatch.batch_delay_ms, 1000);
        assert_eq!(config.receipts.batch_size, 100);
        assert_eq!(config.node_id, "crm-01");
    }
}
