#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SiteLoft Billing Worker
//!
//! Handles scheduled billing maintenance jobs:
//! - Processed event retention prune (daily at 3:00 AM UTC)
//! - Billing invariant sweep (daily at 4:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

mod retention;

use std::time::Duration;

use siteloft_billing::{IdempotencyGuard, InvariantCheckSummary, InvariantChecker};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(3)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log the outcome of an invariant sweep
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        healthy = summary.healthy,
        "Invariant sweep complete"
    );

    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            tenants = violation.tenant_ids.len(),
            description = %violation.description,
            "Billing invariant violated"
        );
    }
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

    info!("Starting SiteLoft billing worker");

    // Create database pool
    let pool = create_db_pool().await?;

    let guard = IdempotencyGuard::new(pool.clone());
    let checker = InvariantChecker::new(pool.clone());

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Prune processed events past the retention window (daily at 3:00 AM UTC)
    let prune_guard = guard.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let guard = prune_guard.clone();
            Box::pin(async move {
                let retention_days = retention::retention_days_from_env();
                retention::prune_processed_events(&guard, retention_days).await;
            })
        })?)
        .await?;
    info!("Scheduled: Processed event prune (daily at 3:00 AM UTC)");

    // Job 2: Billing invariant sweep (daily at 4:00 AM UTC)
    let sweep_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = sweep_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (daily at 4:00 AM UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("SiteLoft billing worker started with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
