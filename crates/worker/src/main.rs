// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kram Reconciliation Worker
//!
//! Runs the periodic repair sweeps over the payment tables:
//! - Orphaned-attempt expiry (every minute)
//! - Stale-attempt reconciliation against the provider (every 5 minutes)
//! - Stored-event drain, store-mode deployments only (every minute)
//! - Needs-review backlog report (hourly)
//!
//! Live webhook deliveries are applied by the storefront service through
//! the same engine; this binary only repairs what delivery missed.

mod provider_client;

use std::sync::Arc;
use std::time::Duration;

use kram_reconcile::{
    InventoryLedger, PgInventoryLedger, ProviderApi, ProviderInvoiceState, ReconcileConfig,
    ReconcileError, ReconcileResult, Reconciler,
};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use provider_client::AcquirerClient;

/// Stand-in used when no provider credentials are configured; the
/// stale-attempt job is not scheduled in that case, so this only ever
/// answers if someone drives the sweep by hand.
struct UnconfiguredProvider;

#[async_trait::async_trait]
impl ProviderApi for UnconfiguredProvider {
    async fn invoice_status(&self, _invoice_ref: &str) -> ReconcileResult<ProviderInvoiceState> {
        Err(ReconcileError::Provider(
            "no provider credentials configured".to_string(),
        ))
    }
}

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Kram reconciliation worker");

    let pool = create_db_pool().await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations applied");

    let config = ReconcileConfig::from_env()?;
    info!(mode = %config.mode, "Reconcile configuration loaded");

    let (provider, provider_configured): (Arc<dyn ProviderApi>, bool) =
        match AcquirerClient::from_env() {
            Ok(client) => (Arc::new(client), true),
            Err(e) => {
                warn!(
                    error = %e,
                    "Provider credentials missing - stale-attempt reconciliation disabled"
                );
                (Arc::new(UnconfiguredProvider), false)
            }
        };

    let ledger: Arc<dyn InventoryLedger> = Arc::new(PgInventoryLedger::new(pool.clone()));
    let reconciler = Arc::new(Reconciler::new(pool.clone(), config, provider, ledger));

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let worker_id = format!("{hostname}-{}", Uuid::new_v4());
    info!(worker_id = %worker_id, "Worker identity assigned");

    let scheduler = JobScheduler::new().await?;
    let mut jobs_scheduled = 0usize;

    // Orphaned attempts hold reserved stock with no webhook ever coming;
    // expire them quickly.
    let orphan_reconciler = reconciler.clone();
    let orphan_worker = worker_id.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let reconciler = orphan_reconciler.clone();
            let worker = orphan_worker.clone();
            Box::pin(async move {
                if let Err(e) = reconciler.orphans.run(&worker).await {
                    error!(error = %e, "Orphan-attempt sweep failed");
                }
            })
        })?)
        .await?;
    jobs_scheduled += 1;
    info!("Scheduled: orphan-attempt expiry (every minute)");

    // Stale attempts are re-checked against the provider directly.
    if provider_configured {
        let stale_reconciler = reconciler.clone();
        let stale_worker = worker_id.clone();
        scheduler
            .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
                let reconciler = stale_reconciler.clone();
                let worker = stale_worker.clone();
                Box::pin(async move {
                    if let Err(e) = reconciler.stale.run(&worker).await {
                        error!(error = %e, "Stale-attempt sweep failed");
                    }
                })
            })?)
            .await?;
        jobs_scheduled += 1;
        info!("Scheduled: stale-attempt reconciliation (every 5 minutes)");
    }

    // Store-mode deployments buffer deliveries; drain them continuously.
    if reconciler.drainer.is_some() {
        let drain_reconciler = reconciler.clone();
        let drain_worker = worker_id.clone();
        scheduler
            .add(Job::new_async("30 * * * * *", move |_uuid, _l| {
                let reconciler = drain_reconciler.clone();
                let worker = drain_worker.clone();
                Box::pin(async move {
                    if let Some(drainer) = &reconciler.drainer {
                        if let Err(e) = drainer.run(&worker).await {
                            error!(error = %e, "Stored-event drain failed");
                        }
                    }
                })
            })?)
            .await?;
        jobs_scheduled += 1;
        info!("Scheduled: stored-event drain (every minute)");
    }

    // Operator signal only; applies no state.
    let report_reconciler = reconciler.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let reconciler = report_reconciler.clone();
            Box::pin(async move {
                if let Err(e) = reconciler.reporter.run().await {
                    error!(error = %e, "Needs-review report failed");
                }
            })
        })?)
        .await?;
    jobs_scheduled += 1;
    info!("Scheduled: needs-review backlog report (hourly)");

    // Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    jobs_scheduled += 1;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "Kram reconciliation worker started successfully with {} scheduled jobs",
        jobs_scheduled
    );

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
