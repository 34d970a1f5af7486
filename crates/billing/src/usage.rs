//! Period-bucketed usage counters for CONSUMABLE features
//!
//! Every (user, feature, period window) has at most one record, keyed by the
//! window start. A new window starts a new record; old records are kept as
//! history.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{FeatureType, LimitPeriod, LimitType, UsageRecord};
use crate::period::PeriodWindow;
use crate::store::BillingStore;

#[derive(Clone)]
pub struct UsageCounter {
    store: Arc<dyn BillingStore>,
}

impl UsageCounter {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get_current_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period: LimitPeriod,
    ) -> BillingResult<i64> {
        self.get_usage_at(user_id, feature_code, period, OffsetDateTime::now_utc())
            .await
    }

    /// Count in the `period` window containing `at`, 0 if nothing recorded yet.
    pub async fn get_usage_at(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period: LimitPeriod,
        at: OffsetDateTime,
    ) -> BillingResult<i64> {
        let window = PeriodWindow::containing(period, at)?;
        let record = self.store.get_usage(user_id, feature_code, window.start).await?;
        Ok(record.map(|r| r.count).unwrap_or(0))
    }

    pub async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period: LimitPeriod,
        amount: i64,
    ) -> BillingResult<i64> {
        self.increment_usage_at(user_id, feature_code, period, amount, OffsetDateTime::now_utc())
            .await
    }

    /// Atomically add `amount` to the window containing `at`. Returns the new count.
    pub async fn increment_usage_at(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period: LimitPeriod,
        amount: i64,
        at: OffsetDateTime,
    ) -> BillingResult<i64> {
        ensure_positive(amount)?;
        let window = PeriodWindow::containing(period, at)?;
        let count = self
            .store
            .increment_usage(user_id, feature_code, &window, amount)
            .await?;

        tracing::debug!(
            user_id = %user_id,
            feature_code = feature_code,
            period = %period,
            count = count,
            "Usage incremented"
        );
        Ok(count)
    }

    /// Administrative correction only. Clamps at zero.
    pub async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period: LimitPeriod,
        amount: i64,
    ) -> BillingResult<i64> {
        ensure_positive(amount)?;
        let window = PeriodWindow::containing(period, OffsetDateTime::now_utc())?;
        let count = self
            .store
            .decrement_usage(user_id, feature_code, &window, amount)
            .await?;

        tracing::info!(
            user_id = %user_id,
            feature_code = feature_code,
            period = %period,
            amount = amount,
            count = count,
            "Usage decremented by administrative correction"
        );
        Ok(count)
    }

    /// Every recorded window for a feature, newest first.
    pub async fn usage_history(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Vec<UsageRecord>> {
        self.store.list_usage_history(user_id, feature_code).await
    }
}

fn ensure_positive(amount: i64) -> BillingResult<()> {
    if amount <= 0 {
        return Err(BillingError::Internal(format!(
            "Usage amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

/// Per-feature usage on the user's current plan.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureUsage {
    pub feature_code: String,
    pub limit_type: LimitType,
    pub feature_type: Option<FeatureType>,
    pub limit: i64,
    pub current: i64,
    /// None when unlimited or not a count.
    pub remaining: Option<i64>,
    /// Only for CONSUMABLE features.
    pub period: Option<PeriodWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub user_id: Uuid,
    pub plan_code: String,
    pub features: Vec<FeatureUsage>,
}
