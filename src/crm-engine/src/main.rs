//! CRM engine: audience segmentation and campaign dispatch.
//!
//! Entry point for a local run: seeds an in-memory customer base, resolves a
//! segment, launches a campaign through the simulated vendor and reconciles
//! the delivery receipts it sends back.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use crm_core::config::AppConfig;
use crm_core::memory::{InMemoryCampaignStore, InMemoryCustomerRepository, InMemoryMessageStore};
use crm_core::types::{Customer, Field};
use crm_dispatch::{CampaignDispatcher, CampaignService, DispatchSettings, NewCampaign, SimulatedVendor};
use crm_receipts::{DeliveryReconciler, ReconcilerSettings};
use crm_segmentation::{AudienceResolver, InMemorySegmentStore, RuleBuilder, SegmentService};
use rand::Rng;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "crm-engine")]
#[command(about = "Audience segmentation and campaign dispatch engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "CRM_ENGINE_CONFIG")]
    config: Option<String>,

    /// Number of demo customers to seed
    #[arg(long, default_value_t = 200)]
    customers: usize,

    /// Messages per dispatch batch (overrides config)
    #[arg(long, env = "CRM_ENGINE__DISPATCH__BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Pause between batches in milliseconds (overrides config)
    #[arg(long, env = "CRM_ENGINE__DISPATCH__BATCH_DELAY_MS")]
    batch_delay_ms: Option<u64>,

    /// JSON rule tree defining the segment
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Campaign message template
    #[arg(long, default_value = "Hi {{first_name}}, here is 10% off your next order!")]
    template: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "crm_engine=info,crm_dispatch=info,crm_receipts=info,crm_segmentation=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(size) = cli.batch_size {
        config.dispatch.batch_size = size;
    }
    if let Some(delay) = cli.batch_delay_ms {
        config.dispatch.batch_delay_ms = delay;
    }

    info!(
        node_id = %config.node_id,
        batch_size = config.dispatch.batch_size,
        batch_delay_ms = config.dispatch.batch_delay_ms,
        receipt_batch_size = config.receipts.batch_size,
        "Configuration loaded"
    );

    let customers = Arc::new(InMemoryCustomerRepository::with_customers(seed_customers(
        cli.customers,
    )));
    let campaigns = Arc::new(InMemoryCampaignStore::new());
    let messages = Arc::new(InMemoryMessageStore::new());
    let segment_store = Arc::new(InMemorySegmentStore::new());

    let reconciler = Arc::new(DeliveryReconciler::new(
        messages.clone(),
        campaigns.clone(),
        ReconcilerSettings::from(&config.receipts),
    ));
    let reconciler_handle = reconciler.start()?;

    let vendor = Arc::new(SimulatedVendor::new(config.vendor.clone(), reconciler.clone()));
    let dispatcher = CampaignDispatcher::new(
        campaigns.clone(),
        segment_store.clone(),
        customers.clone(),
        messages.clone(),
        vendor,
        DispatchSettings::from(&config.dispatch),
    );
    let segments = SegmentService::new(AudienceResolver::new(customers.clone()), segment_store.clone());
    let service = CampaignService::new(campaigns, segment_store, messages, dispatcher);

    let segment = match &cli.rules {
        Some(path) => {
            let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            segments.create_segment("Custom segment", &raw, &config.node_id)?
        }
        None => {
            let rules = RuleBuilder::or()
                .gt(Field::TotalSpend, 1000.0)
                .group(
                    RuleBuilder::and()
                        .gte(Field::Visits, 5.0)
                        .last_ordered_before(Utc::now() - Duration::days(90)),
                )
                .build()?;
            segments.create_from_rules("High value or lapsed regulars", rules, &config.node_id)?
        }
    };
    info!(
        segment_id = %segment.id,
        rules = %segment.condition_string,
        audience = segment.audience_size(),
        average_spend = segment.stats.average_spend,
        "Segment ready"
    );

    let campaign = service.launch(NewCampaign {
        name: "Demo campaign".into(),
        segment_id: segment.id,
        message_template: cli.template,
        created_by: config.node_id.clone(),
    })?;
    let finished = service.dispatcher().wait(&campaign.id).await?;

    // Let the last receipts arrive before the final flush.
    tokio::time::sleep(std::time::Duration::from_millis(
        config.vendor.receipt_delay_max_ms + 100,
    ))
    .await;
    reconciler_handle.stop().await?;

    let report = service.report(&finished.id)?;
    info!(
        campaign_id = %report.campaign_id,
        status = %report.status,
        total = report.total,
        sent = report.stats.sent,
        failed = report.stats.failed,
        delivered = report.stats.delivered,
        success_rate = report.success_rate,
        "Campaign report"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn seed_customers(count: usize) -> Vec<Customer> {
    const CITIES: [&str; 5] = ["Austin", "Berlin", "Lagos", "Pune", "Osaka"];
    let mut rng = rand::thread_rng();
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let orders: u64 = rng.gen_range(0..12);
            let spend = if orders == 0 {
                0.0
            } else {
                (rng.gen_range(20.0..400.0) * orders as f64 * 100.0_f64).round() / 100.0
            };
            let mut customer = Customer::new(
                format!("cust-{i:05}"),
                format!("Customer {i}"),
                format!("customer{i}@example.com"),
            )
            .with_spend(spend, orders)
            .with_visits(rng.gen_range(0..30))
            .with_location(CITIES[i % CITIES.len()]);
            if orders > 0 {
                customer = customer.with_last_order(now - Duration::days(rng.gen_range(0..365)));
            }
            customer
        })
        .collect()
}
