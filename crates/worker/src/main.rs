#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Fitledger Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription expiry sweep (daily at 03:00 UTC)
//! - Billing invariant checks (daily at 03:30 UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use fitledger_billing::{
    BillingEmailService, ExpirySweep, InvariantChecker, PgBillingStore, PlanCatalog,
};
use fitledger_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use jobs::{
    cron_from_env, run_expiry_sweep, run_invariant_checks, DEFAULT_EXPIRY_SWEEP_CRON,
    DEFAULT_INVARIANT_CHECK_CRON,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Fitledger Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    // The sweep only needs the store and email; no gateway credentials here
    let sweep = Arc::new(ExpirySweep::new(
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(PlanCatalog::load_from_env()?),
        Arc::new(BillingEmailService::from_env()?),
    ));
    let checker = Arc::new(InvariantChecker::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Downgrade lapsed subscriptions
    let sweep_cron = cron_from_env("EXPIRY_SWEEP_CRON", DEFAULT_EXPIRY_SWEEP_CRON);
    let sweep_job = sweep.clone();
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let sweep = sweep_job.clone();
            Box::pin(async move {
                run_expiry_sweep(&sweep).await;
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Subscription expiry sweep");

    // Job 2: Consistency checks over the billing tables
    let invariant_cron = cron_from_env("INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CHECK_CRON);
    let checker_job = checker.clone();
    scheduler
        .add(Job::new_async(invariant_cron.as_str(), move |_uuid, _l| {
            let checker = checker_job.clone();
            Box::pin(async move {
                run_invariant_checks(&checker).await;
            })
        })?)
        .await?;
    info!(cron = %invariant_cron, "Scheduled: Billing invariant checks");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Fitledger Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
