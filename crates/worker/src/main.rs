// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Fintrack Background Worker
//!
//! Handles scheduled billing jobs:
//! - Apply due downgrades and cancellations (hourly)
//! - Grace period warnings and expirations (daily at 9:00 AM UTC)
//! - Billing invariant sweep (daily at 4:30 AM UTC)
//!
//! Run exactly one worker per database; the jobs take no distributed lock.

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use fintrack_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::WorkerConfig;

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

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

    info!("Starting Fintrack Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_db_pool(&config.database_url).await?;
    let billing = Arc::new(BillingService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Apply scheduled downgrades and cancellations that are due
    let apply_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.apply_scheduled_changes_cron.as_str(),
            move |_uuid, _l| {
                let billing = apply_billing.clone();
                Box::pin(async move {
                    jobs::apply_scheduled_changes(&billing.scheduled, OffsetDateTime::now_utc())
                        .await;
                })
            },
        )?)
        .await?;
    info!(
        cron = %config.apply_scheduled_changes_cron,
        "Scheduled: Apply due plan changes"
    );

    // Job 2: Warn about and expire grace periods
    let grace_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.grace_period_cron.as_str(), move |_uuid, _l| {
            let billing = grace_billing.clone();
            Box::pin(async move {
                jobs::process_grace_periods(&billing.scheduled, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!(cron = %config.grace_period_cron, "Scheduled: Grace period processing");

    // Job 3: Billing invariant sweep
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(
            config.invariant_check_cron.as_str(),
            move |_uuid, _l| {
                let billing = invariant_billing.clone();
                Box::pin(async move {
                    jobs::check_invariants(&billing.invariants, OffsetDateTime::now_utc()).await;
                })
            },
        )?)
        .await?;
    info!(cron = %config.invariant_check_cron, "Scheduled: Billing invariant checks");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Fintrack Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    let mut scheduler = scheduler;
    scheduler.shutdown().await?;

    Ok(())
}
