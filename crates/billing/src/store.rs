//! Storage traits the billing engine depends on.
//!
//! The Postgres backend lives in [`crate::postgres`]; an in-memory backend for
//! tests lives in [`crate::testing`]. Subscription writes are conditional on
//! [`Subscription::version`], which is how concurrent plan changes for the same
//! user are serialised.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Plan, PlanChangeLog, Subscription, UsageRecord};
use crate::period::PeriodWindow;

/// Position in the due-change listing. Orders by time first, then user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub scheduled_change_at: OffsetDateTime,
    pub user_id: Uuid,
}

impl DueCursor {
    pub fn of(subscription: &Subscription) -> Option<Self> {
        subscription.scheduled_change_at.map(|scheduled_change_at| Self {
            scheduled_change_at,
            user_id: subscription.user_id,
        })
    }
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    /// All plans (including inactive) with their features, ordered by sort_order.
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    async fn get_plan_by_code(&self, code: &str) -> BillingResult<Option<Plan>>;

    async fn get_plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    /// Every plan flagged as default. Exactly one is expected.
    async fn get_default_plans(&self) -> BillingResult<Vec<Plan>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Insert a new subscription. Returns false if the user already has one.
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool>;

    /// Persist `subscription` if its `version` still matches the stored row,
    /// appending `log` in the same unit of work.
    ///
    /// Returns the stored row with its bumped version, or
    /// `BillingError::ConcurrentModification` when another writer got there first.
    async fn save_subscription(
        &self,
        subscription: &Subscription,
        log: Option<&PlanChangeLog>,
    ) -> BillingResult<Subscription>;

    /// Subscriptions with `scheduled_plan_id` set and `scheduled_change_at <= now`,
    /// ordered by `(scheduled_change_at, user_id)` and starting strictly after
    /// `after` when a cursor is given.
    async fn list_due_scheduled_changes(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions with grace overages whose `grace_period_end` is in `(after, until]`.
    async fn list_grace_periods_ending(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions with grace overages whose `grace_period_end <= now`.
    async fn list_expired_grace_periods(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>>;

    /// Keyset pagination over all subscriptions ordered by user id.
    async fn list_subscriptions(
        &self,
        after_user_id: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<UsageRecord>>;

    /// Atomic increment-or-insert for the record of `window`. Returns the new count.
    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64>;

    /// Atomic decrement clamped at zero. Returns the new count (0 if no record).
    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64>;

    /// Every period record for a feature, newest first.
    async fn list_usage_history(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Vec<UsageRecord>>;
}

#[async_trait]
pub trait PlanChangeLogStore: Send + Sync {
    /// Newest first.
    async fn list_plan_changes(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<PlanChangeLog>>;
}

/// Everything the engine needs from persistence.
pub trait BillingStore: PlanStore + SubscriptionStore + UsageStore + PlanChangeLogStore {}

impl<T> BillingStore for T where T: PlanStore + SubscriptionStore + UsageStore + PlanChangeLogStore {}
