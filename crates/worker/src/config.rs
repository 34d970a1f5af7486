//! Worker configuration

use std::env;

use anyhow::Context;

pub const DEFAULT_APPLY_CRON: &str = "0 5 * * * *";
pub const DEFAULT_GRACE_CRON: &str = "0 0 9 * * *";
pub const DEFAULT_INVARIANT_CRON: &str = "0 30 4 * * *";

/// Cron expressions use the six-field form (seconds first), evaluated in UTC.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Hourly by default, five minutes past the hour
    pub apply_scheduled_changes_cron: String,
    /// Daily at 09:00 UTC by default
    pub grace_period_cron: String,
    pub invariant_check_cron: String,
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            apply_scheduled_changes_cron: cron_var("APPLY_SCHEDULED_CHANGES_CRON", DEFAULT_APPLY_CRON),
            grace_period_cron: cron_var("GRACE_PERIOD_CRON", DEFAULT_GRACE_CRON),
            invariant_check_cron: cron_var("INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CRON),
        })
    }
}

fn cron_var(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
