//! Plan change orchestration
//!
//! All user-initiated subscription mutations go through [`SubscriptionService`]:
//! preview, upgrade, downgrade, cancel, reactivate and cancel-scheduled.
//!
//! Each operation validates, then writes the subscription and its change log
//! entry in one conditional save keyed on the subscription version. A stale
//! read surfaces as `ConcurrentModification` and nothing is written. Emails
//! are sent after the save and never affect the outcome.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::email::{format_date, Notification, NotificationDispatcher};
use crate::error::{BillingError, BillingResult};
use crate::history::{clamp_limit, resolve_entries, PlanChangeEntry, PlanChangeLogBuilder};
use crate::models::{
    format_price, ChangeType, GraceOverages, Overage, Plan, Subscription, SubscriptionStatus,
    UserContact,
};
use crate::overage::OverageDetector;
use crate::plans::PlanCatalog;
use crate::proration::{calculate_proration, ProrationEstimate};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
}

/// Informational preview. Nothing is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangePreview {
    pub current_plan: String,
    pub target_plan: String,
    pub change: PlanChangeKind,
    /// Upgrades only.
    pub proration: Option<ProrationEstimate>,
    /// Downgrades only.
    pub overages: Vec<Overage>,
    /// Immediate for upgrades, the current period end for downgrades.
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    /// Provisional, set when some overage gets a grace period.
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub code: String,
    pub name: String,
    pub price_monthly_cents: i64,
    pub price: String,
    pub is_default: bool,
}

impl From<&Plan> for PlanSummary {
    fn from(plan: &Plan) -> Self {
        Self {
            code: plan.code.clone(),
            name: plan.name.clone(),
            price_monthly_cents: plan.price_monthly_cents,
            price: plan.formatted_monthly_price(),
            is_default: plan.is_default,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledChangeView {
    pub plan: PlanSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    pub is_cancellation: bool,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraceView {
    pub overages: GraceOverages,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
}

/// Dashboard view of a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOverview {
    pub user_id: Uuid,
    pub plan: PlanSummary,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub scheduled_change: Option<ScheduledChangeView>,
    pub grace_period: Option<GraceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeResult {
    pub change_type: ChangeType,
    pub from_plan: String,
    pub to_plan: String,
    /// Set when the change already took effect.
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
    /// Set when the change is deferred.
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_for: Option<OffsetDateTime>,
    pub proration: Option<ProrationEstimate>,
    pub overages: Vec<Overage>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub grace_period_end: Option<OffsetDateTime>,
    pub message: String,
    pub subscription: SubscriptionOverview,
}

/// Upgrade or downgrade from `current` to `target`, by sort order.
pub fn classify_change(current: &Plan, target: &Plan) -> BillingResult<PlanChangeKind> {
    if current.code == target.code || target.sort_order == current.sort_order {
        return Err(BillingError::AlreadyOnPlan(target.code.clone()));
    }
    if target.sort_order > current.sort_order {
        Ok(PlanChangeKind::Upgrade)
    } else {
        Ok(PlanChangeKind::Downgrade)
    }
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| at.to_string())
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    overages: OverageDetector,
    notifications: NotificationDispatcher,
    config: BillingConfig,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        overages: OverageDetector,
        notifications: NotificationDispatcher,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            overages,
            notifications,
            config,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    async fn load(&self, user_id: Uuid) -> BillingResult<(Subscription, Plan)> {
        let subscription = self
            .store
            .get_subscription(user_id)
            .await?
            .ok_or(BillingError::NoSubscription(user_id))?;
        let plan = self.catalog.get_by_id(subscription.plan_id).await?;
        Ok((subscription, plan))
    }

    /// Period end for a freshly started period on `plan`.
    fn period_end_for(&self, plan: &Plan, start: OffsetDateTime) -> Option<OffsetDateTime> {
        if plan.is_default {
            None
        } else {
            Some(start + Duration::days(self.config.billing_period_days))
        }
    }

    async fn overview_of(&self, subscription: &Subscription, plan: &Plan) -> BillingResult<SubscriptionOverview> {
        let scheduled_change = match (subscription.scheduled_plan_id, subscription.scheduled_change_at) {
            (Some(plan_id), Some(at)) => {
                let target = self.catalog.get_by_id(plan_id).await?;
                Some(ScheduledChangeView {
                    plan: PlanSummary::from(&target),
                    effective_at: at,
                    is_cancellation: subscription.is_cancellation_pending(),
                    cancel_reason: subscription.cancel_reason.clone(),
                })
            }
            _ => None,
        };

        let grace_period = match (&subscription.grace_overages, subscription.grace_period_end) {
            (Some(overages), Some(ends_at)) => Some(GraceView {
                overages: overages.clone(),
                ends_at,
            }),
            _ => None,
        };

        Ok(SubscriptionOverview {
            user_id: subscription.user_id,
            plan: PlanSummary::from(plan),
            status: subscription.status,
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            scheduled_change,
            grace_period,
        })
    }

    // =========================================================================
    // Provisioning and reads
    // =========================================================================

    /// Create the user's subscription on the default plan. Idempotent: an
    /// existing subscription is returned untouched.
    pub async fn provision_default(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let default_plan = self.catalog.default_plan().await?;
        let subscription = Subscription::new_default(user_id, default_plan.id, now);

        if self.store.insert_subscription(&subscription).await? {
            tracing::info!(
                user_id = %user_id,
                plan = %default_plan.code,
                "Provisioned default subscription"
            );
            return Ok(subscription);
        }

        self.store
            .get_subscription(user_id)
            .await?
            .ok_or(BillingError::NoSubscription(user_id))
    }

    pub async fn get_subscription_overview(&self, user_id: Uuid) -> BillingResult<SubscriptionOverview> {
        let (subscription, plan) = self.load(user_id).await?;
        self.overview_of(&subscription, &plan).await
    }

    /// Newest first. `limit` defaults to 50 and is capped at 200.
    pub async fn get_plan_history(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<PlanChangeEntry>> {
        let logs = self
            .store
            .list_plan_changes(user_id, clamp_limit(limit))
            .await?;
        Ok(resolve_entries(&self.catalog, logs).await)
    }

    // =========================================================================
    // Preview
    // =========================================================================

    pub async fn preview_plan_change(
        &self,
        user_id: Uuid,
        target_code: &str,
    ) -> BillingResult<PlanChangePreview> {
        self.preview_plan_change_at(user_id, target_code, OffsetDateTime::now_utc())
            .await
    }

    pub async fn preview_plan_change_at(
        &self,
        user_id: Uuid,
        target_code: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangePreview> {
        let (subscription, current) = self.load(user_id).await?;
        let target = self.catalog.get_by_code(target_code).await?;
        let change = classify_change(&current, &target)?;

        let preview = match change {
            PlanChangeKind::Upgrade => PlanChangePreview {
                current_plan: current.code.clone(),
                target_plan: target.code.clone(),
                change,
                proration: Some(self.proration(&subscription, &current, &target, now)),
                overages: Vec::new(),
                effective_at: now,
                grace_period_end: None,
            },
            PlanChangeKind::Downgrade => {
                let overages = self.overages.detect_overages(user_id, &target).await?;
                let effective_at = subscription.current_period_end.unwrap_or(now);
                let grace_period_end = self
                    .overages
                    .grace_for(&overages, effective_at)
                    .map(|(_, end)| end);
                PlanChangePreview {
                    current_plan: current.code.clone(),
                    target_plan: target.code.clone(),
                    change,
                    proration: None,
                    overages,
                    effective_at,
                    grace_period_end,
                }
            }
        };
        Ok(preview)
    }

    fn proration(
        &self,
        subscription: &Subscription,
        current: &Plan,
        target: &Plan,
        now: OffsetDateTime,
    ) -> ProrationEstimate {
        calculate_proration(
            current.price_monthly_cents,
            target.price_monthly_cents,
            subscription.current_period_start,
            subscription.current_period_end,
            now,
            self.config.billing_period_days,
        )
    }

    // =========================================================================
    // Upgrade
    // =========================================================================

    pub async fn upgrade_plan(
        &self,
        contact: &UserContact,
        target_code: &str,
    ) -> BillingResult<PlanChangeResult> {
        self.upgrade_plan_at(contact, target_code, OffsetDateTime::now_utc())
            .await
    }

    /// Applies immediately: new plan, fresh period, any pending change,
    /// cancellation or grace cleared, status ACTIVE.
    pub async fn upgrade_plan_at(
        &self,
        contact: &UserContact,
        target_code: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeResult> {
        let user_id = contact.user_id;
        let (mut subscription, current) = self.load(user_id).await?;
        let target = self.catalog.get_by_code(target_code).await?;

        if classify_change(&current, &target)? != PlanChangeKind::Upgrade {
            return Err(BillingError::NotAnUpgrade {
                current: current.code.clone(),
                target: target.code.clone(),
            });
        }

        let proration = self.proration(&subscription, &current, &target, now);
        let replaced_schedule = subscription.scheduled_plan_id;

        subscription.plan_id = target.id;
        subscription.status = SubscriptionStatus::Active;
        subscription.current_period_start = now;
        subscription.current_period_end = self.period_end_for(&target, now);
        subscription.clear_scheduled_change();
        subscription.clear_grace();

        let log = PlanChangeLogBuilder::new(user_id, ChangeType::Upgrade, now)
            .plans(current.id, target.id)
            .effective_at(now)
            .proration(proration.proration_amount_cents)
            .metadata(serde_json::json!({
                "days_remaining": proration.days_remaining,
                "credit_cents": proration.credit_cents,
                "charge_cents": proration.charge_cents,
                "replaced_scheduled_plan_id": replaced_schedule,
            }))
            .build();

        let saved = self.store.save_subscription(&subscription, Some(&log)).await?;

        tracing::info!(
            user_id = %user_id,
            from_plan = %current.code,
            to_plan = %target.code,
            proration_cents = proration.proration_amount_cents,
            "Subscription upgraded"
        );

        self.notifications
            .dispatch(
                contact,
                Notification::PlanUpgraded {
                    user_name: contact.name.clone(),
                    previous_plan: current.name.clone(),
                    new_plan: target.name.clone(),
                    price: target.formatted_monthly_price(),
                    next_billing_date: saved
                        .current_period_end
                        .map(format_date)
                        .unwrap_or_default(),
                    proration_amount: format_price(
                        proration.proration_amount_cents,
                        &target.price_currency,
                    ),
                },
            )
            .await;

        Ok(PlanChangeResult {
            change_type: ChangeType::Upgrade,
            from_plan: current.code.clone(),
            to_plan: target.code.clone(),
            effective_at: Some(now),
            scheduled_for: None,
            proration: Some(proration),
            overages: Vec::new(),
            grace_period_end: None,
            message: format!("Upgraded from {} to {}", current.name, target.name),
            subscription: self.overview_of(&saved, &target).await?,
        })
    }

    // =========================================================================
    // Downgrade
    // =========================================================================

    pub async fn downgrade_plan(
        &self,
        contact: &UserContact,
        target_code: &str,
    ) -> BillingResult<PlanChangeResult> {
        self.downgrade_plan_at(contact, target_code, OffsetDateTime::now_utc())
            .await
    }

    /// Schedules the change for the current period end (now for plans without
    /// one). The active plan is left alone until the scheduled job applies it.
    pub async fn downgrade_plan_at(
        &self,
        contact: &UserContact,
        target_code: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeResult> {
        let user_id = contact.user_id;
        let (mut subscription, current) = self.load(user_id).await?;
        let target = self.catalog.get_by_code(target_code).await?;

        if classify_change(&current, &target)? != PlanChangeKind::Downgrade {
            return Err(BillingError::NotADowngrade {
                current: current.code.clone(),
                target: target.code.clone(),
            });
        }

        if let (true, Some(at)) = (
            subscription.is_cancellation_pending(),
            subscription.scheduled_change_at,
        ) {
            return Err(BillingError::SubscriptionAlreadyCancelled {
                effective_at: timestamp(at),
            });
        }

        if let Some(existing) = subscription.scheduled_plan_id {
            if existing != target.id {
                tracing::warn!(
                    user_id = %user_id,
                    existing_scheduled_plan = %existing,
                    new_scheduled_plan = %target.code,
                    "Replacing existing scheduled downgrade"
                );
            }
        }

        let overages = self.overages.detect_overages(user_id, &target).await?;
        let scheduled_at = subscription.current_period_end.unwrap_or(now);
        let grace = self.overages.grace_for(&overages, scheduled_at);
        let grace_period_end = grace.as_ref().map(|(_, end)| *end);

        // A replaced downgrade's grace no longer applies; grace left by an
        // applied downgrade stays unless this one brings its own.
        let replaces_grace = subscription.has_provisional_grace();
        subscription.schedule_change(target.id, scheduled_at);
        if grace.is_some() || replaces_grace {
            subscription.set_grace(grace);
        }

        let log = PlanChangeLogBuilder::new(user_id, ChangeType::DowngradeScheduled, now)
            .plans(current.id, target.id)
            .scheduled_for(scheduled_at)
            .overages(&overages, grace_period_end)
            .build();

        let saved = self.store.save_subscription(&subscription, Some(&log)).await?;

        tracing::info!(
            user_id = %user_id,
            from_plan = %current.code,
            to_plan = %target.code,
            effective_date = %scheduled_at,
            overage_count = overages.len(),
            "Scheduled subscription downgrade for period end"
        );

        self.notifications
            .dispatch(
                contact,
                Notification::PlanDowngradeScheduled {
                    user_name: contact.name.clone(),
                    current_plan: current.name.clone(),
                    new_plan: target.name.clone(),
                    effective_date: format_date(scheduled_at),
                    overages: overages.clone(),
                    grace_period_end: grace_period_end.map(format_date).unwrap_or_default(),
                },
            )
            .await;

        Ok(PlanChangeResult {
            change_type: ChangeType::DowngradeScheduled,
            from_plan: current.code.clone(),
            to_plan: target.code.clone(),
            effective_at: None,
            scheduled_for: Some(scheduled_at),
            proration: None,
            overages,
            grace_period_end,
            message: format!(
                "Downgrade to {} scheduled for {}",
                target.name,
                format_date(scheduled_at)
            ),
            subscription: self.overview_of(&saved, &current).await?,
        })
    }

    // =========================================================================
    // Cancellation and reactivation
    // =========================================================================

    pub async fn cancel_subscription(
        &self,
        contact: &UserContact,
        reason: Option<String>,
    ) -> BillingResult<PlanChangeResult> {
        self.cancel_subscription_at(contact, reason, OffsetDateTime::now_utc())
            .await
    }

    /// A cancellation is a scheduled change to the default plan with
    /// `cancelled_at` set.
    pub async fn cancel_subscription_at(
        &self,
        contact: &UserContact,
        reason: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeResult> {
        let user_id = contact.user_id;
        let (mut subscription, current) = self.load(user_id).await?;
        let default_plan = self.catalog.default_plan().await?;

        if current.id == default_plan.id {
            return Err(BillingError::CannotCancelFreePlan(current.code.clone()));
        }
        if subscription.is_cancellation_pending() {
            let effective_at = subscription
                .scheduled_change_at
                .map(timestamp)
                .unwrap_or_default();
            return Err(BillingError::SubscriptionAlreadyCancelled { effective_at });
        }
        if subscription.has_scheduled_change() {
            tracing::warn!(
                user_id = %user_id,
                "Cancellation replaces a pending scheduled downgrade"
            );
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let scheduled_at = subscription.current_period_end.unwrap_or(now);

        if subscription.has_provisional_grace() {
            subscription.clear_grace();
        }
        subscription.schedule_change(default_plan.id, scheduled_at);
        subscription.cancelled_at = Some(now);
        subscription.cancel_reason = reason.clone();

        let log = PlanChangeLogBuilder::new(user_id, ChangeType::Cancellation, now)
            .plans(current.id, default_plan.id)
            .scheduled_for(scheduled_at)
            .reason(reason.clone())
            .build();

        let saved = self.store.save_subscription(&subscription, Some(&log)).await?;

        tracing::info!(
            user_id = %user_id,
            plan = %current.code,
            effective_date = %scheduled_at,
            "Subscription cancelled at period end"
        );

        self.notifications
            .dispatch(
                contact,
                Notification::SubscriptionCancelled {
                    user_name: contact.name.clone(),
                    plan: current.name.clone(),
                    effective_date: format_date(scheduled_at),
                    reason: reason.unwrap_or_default(),
                },
            )
            .await;

        Ok(PlanChangeResult {
            change_type: ChangeType::Cancellation,
            from_plan: current.code.clone(),
            to_plan: default_plan.code.clone(),
            effective_at: None,
            scheduled_for: Some(scheduled_at),
            proration: None,
            overages: Vec::new(),
            grace_period_end: None,
            message: format!(
                "{} stays active until {}",
                current.name,
                format_date(scheduled_at)
            ),
            subscription: self.overview_of(&saved, &current).await?,
        })
    }

    pub async fn reactivate_subscription(
        &self,
        contact: &UserContact,
    ) -> BillingResult<PlanChangeResult> {
        self.reactivate_subscription_at(contact, OffsetDateTime::now_utc())
            .await
    }

    /// Undo a pending cancellation. The current plan is kept.
    pub async fn reactivate_subscription_at(
        &self,
        contact: &UserContact,
        now: OffsetDateTime,
    ) -> BillingResult<PlanChangeResult> {
        let user_id = contact.user_id;
        let (mut subscription, current) = self.load(user_id).await?;

        if !subscription.is_cancellation_pending() {
            return Err(BillingError::NoPendingCancellation);
        }

        let cancelled_target = subscription.scheduled_plan_id;
        let cancelled_for = subscription.scheduled_change_at;
        if subscription.has_provisional_grace() {
            subscription.clear_grace();
        }
        subscription.clear_scheduled_change();

        let log = PlanChangeLogBuilder::new(user_id, ChangeType::Reactivation, now)
            .plans(current.id, current.id)
            .effective_at(now)
            .metadata(serde_json::json!({
                "cancelled_plan_id": cancelled_target,
                "cancelled_for": cancelled_for.map(|at| at.unix_timestamp()),
            }))
            .build();

        let saved = self.store.save_subscription(&subscription, Some(&log)).await?;

        tracing::info!(user_id = %user_id, plan = %current.code, "Subscription reactivated");

        Ok(PlanChangeResult {
            change_type: ChangeType::Reactivation,
            from_plan: current.code.clone(),
            to_plan: current.code.clone(),
            effective_at: Some(now),
            scheduled_for: None,
            proration: None,
            overages: Vec::new(),
            grace_period_end: None,
            message: format!("{} will renew as usual", current.name),
            subscription: self.overview_of(&saved, &current).await?,
        })
    }

    /// Drop a pending downgrade and the grace computed for it. Grace left by an
    /// applied downgrade stays. Cancellations must go through
    /// [`reactivate_subscription`](Self::reactivate_subscription).
    pub async fn cancel_scheduled_change(&self, user_id: Uuid) -> BillingResult<SubscriptionOverview> {
        let (mut subscription, current) = self.load(user_id).await?;

        if !subscription.has_scheduled_change() {
            return Err(BillingError::NoScheduledChange);
        }
        if let (true, Some(at)) = (
            subscription.is_cancellation_pending(),
            subscription.scheduled_change_at,
        ) {
            return Err(BillingError::SubscriptionAlreadyCancelled {
                effective_at: timestamp(at),
            });
        }

        let dropped = subscription.scheduled_plan_id;
        if subscription.has_provisional_grace() {
            subscription.clear_grace();
        }
        subscription.clear_scheduled_change();

        let saved = self.store.save_subscription(&subscription, None).await?;

        tracing::info!(
            user_id = %user_id,
            dropped_plan = ?dropped,
            "Cancelled scheduled downgrade"
        );

        self.overview_of(&saved, &current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;
    use crate::store::{PlanChangeLogStore, PlanStore, SubscriptionStore, UsageStore};
    use crate::testing::{seed_catalog, FixedResourceCounter, InMemoryBillingStore, RecordingNotifier};
    use time::macros::datetime;

    struct Harness {
        store: InMemoryBillingStore,
        counter: FixedResourceCounter,
        notifier: Arc<RecordingNotifier>,
        service: SubscriptionService,
        contact: UserContact,
    }

    fn harness() -> Harness {
        let store = InMemoryBillingStore::with_default_catalog();
        let counter = FixedResourceCounter::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let config = BillingConfig::default();
        let shared: Arc<dyn BillingStore> = Arc::new(store.clone());
        let service = SubscriptionService::new(
            shared.clone(),
            PlanCatalog::new(shared, &config),
            OverageDetector::new(Arc::new(counter.clone()), config.clone()),
            NotificationDispatcher::inline(notifier.clone(), config.notification_timeout),
            config,
        );
        let contact = UserContact {
            user_id: Uuid::new_v4(),
            email: "sam@example.com".into(),
            name: "Sam".into(),
        };
        Harness {
            store,
            counter,
            notifier,
            service,
            contact,
        }
    }

    /// Put the harness user on `code` with a period ending at `end`.
    fn place_on(h: &Harness, code: &str, start: OffsetDateTime, end: Option<OffsetDateTime>) {
        let plan = h.store.plan(code).unwrap();
        let mut sub = Subscription::new_default(h.contact.user_id, plan.id, start);
        sub.current_period_end = end;
        h.store.put_subscription(sub);
    }

    #[test]
    fn test_classify_change() {
        let plans = seed_catalog();
        assert_eq!(classify_change(&plans[0], &plans[2]).unwrap(), PlanChangeKind::Upgrade);
        assert_eq!(classify_change(&plans[2], &plans[1]).unwrap(), PlanChangeKind::Downgrade);
        assert_eq!(
            classify_change(&plans[1], &plans[1]).unwrap_err().code(),
            "ALREADY_ON_PLAN"
        );
    }

    #[tokio::test]
    async fn test_provision_default_is_idempotent() {
        let h = harness();
        let first = h.service.provision_default(h.contact.user_id).await.unwrap();
        let second = h.service.provision_default(h.contact.user_id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.current_period_end.is_none());
        assert_eq!(first.plan_id, h.store.plan("free").unwrap().id);
    }

    #[tokio::test]
    async fn test_missing_subscription() {
        let h = harness();
        let err = h
            .service
            .get_subscription_overview(Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_SUBSCRIPTION");
    }

    #[tokio::test]
    async fn test_upgrade_from_free_has_no_proration() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        place_on(&h, "free", now - Duration::days(40), None);

        let result = h.service.upgrade_plan_at(&h.contact, "pro", now).await.unwrap();
        assert_eq!(result.proration.unwrap().proration_amount_cents, 0);

        let sub = h.store.subscription(h.contact.user_id).unwrap();
        assert_eq!(sub.plan_id, h.store.plan("pro").unwrap().id);
        assert_eq!(sub.current_period_start, now);
        assert_eq!(sub.current_period_end, Some(now + Duration::days(30)));
        assert_eq!(h.notifier.count("plan-upgraded"), 1);

        let logs = h.store.change_logs(h.contact.user_id);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].change_type, ChangeType::Upgrade);
        assert_eq!(logs[0].effective_at, Some(now));
        assert!(logs[0].scheduled_for.is_none());
    }

    #[tokio::test]
    async fn test_upgrade_rejects_downgrade_target() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        place_on(&h, "premium", now, Some(now + Duration::days(30)));

        let err = h.service.upgrade_plan_at(&h.contact, "pro", now).await.unwrap_err();
        assert_eq!(err.code(), "NOT_AN_UPGRADE");
        assert!(h.store.change_logs(h.contact.user_id).is_empty());

        let err = h
            .service
            .upgrade_plan_at(&h.contact, "premium", now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_ON_PLAN");

        let err = h
            .service
            .upgrade_plan_at(&h.contact, "platinum", now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PLAN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_downgrade_rejects_upgrade_target() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        place_on(&h, "pro", now, Some(now + Duration::days(30)));

        let err = h
            .service
            .downgrade_plan_at(&h.contact, "premium", now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_A_DOWNGRADE");
    }

    #[tokio::test]
    async fn test_downgrade_without_period_end_is_due_now() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        place_on(&h, "pro", now - Duration::days(3), None);

        let result = h.service.downgrade_plan_at(&h.contact, "free", now).await.unwrap();
        assert_eq!(result.scheduled_for, Some(now));
        assert!(result.grace_period_end.is_none());

        let sent = h.notifier.sent();
        assert_eq!(sent[0].template, "plan-downgrade-scheduled");
        assert_eq!(sent[0].variables["grace_period_end"], "");
    }

    #[tokio::test]
    async fn test_downgrade_replaces_pending_downgrade() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        let end = now + Duration::days(20);
        place_on(&h, "premium", now - Duration::days(10), Some(end));

        h.service.downgrade_plan_at(&h.contact, "pro", now).await.unwrap();
        h.service.downgrade_plan_at(&h.contact, "free", now).await.unwrap();

        let sub = h.store.subscription(h.contact.user_id).unwrap();
        assert_eq!(sub.scheduled_plan_id, Some(h.store.plan("free").unwrap().id));
        assert_eq!(sub.scheduled_change_at, Some(end));
    }

    #[tokio::test]
    async fn test_cancel_and_reactivate() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        let end = now + Duration::days(20);
        place_on(&h, "pro", now - Duration::days(10), Some(end));

        let result = h
            .service
            .cancel_subscription_at(&h.contact, Some("  too pricey ".into()), now)
            .await
            .unwrap();
        assert_eq!(result.to_plan, "free");
        assert_eq!(result.scheduled_for, Some(end));

        let sub = h.store.subscription(h.contact.user_id).unwrap();
        assert_eq!(sub.cancelled_at, Some(now));
        assert_eq!(sub.cancel_reason.as_deref(), Some("too pricey"));
        assert_eq!(sub.scheduled_plan_id, Some(h.store.plan("free").unwrap().id));

        let err = h
            .service
            .cancel_subscription_at(&h.contact, None, now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SUBSCRIPTION_ALREADY_CANCELLED");

        let err = h.service.downgrade_plan_at(&h.contact, "free", now).await.unwrap_err();
        assert_eq!(err.code(), "SUBSCRIPTION_ALREADY_CANCELLED");

        let err = h
            .service
            .cancel_scheduled_change(h.contact.user_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SUBSCRIPTION_ALREADY_CANCELLED");

        h.service.reactivate_subscription_at(&h.contact, now).await.unwrap();
        let sub = h.store.subscription(h.contact.user_id).unwrap();
        assert!(sub.scheduled_plan_id.is_none());
        assert!(sub.scheduled_change_at.is_none());
        assert!(sub.cancelled_at.is_none());
        assert!(sub.cancel_reason.is_none());
        assert_eq!(sub.plan_id, h.store.plan("pro").unwrap().id);

        let types: Vec<ChangeType> = h
            .store
            .change_logs(h.contact.user_id)
            .into_iter()
            .map(|l| l.change_type)
            .collect();
        assert_eq!(types, vec![ChangeType::Cancellation, ChangeType::Reactivation]);
        assert_eq!(h.notifier.count("subscription-cancelled"), 1);
    }

    #[tokio::test]
    async fn test_cannot_cancel_free_plan() {
        let h = harness();
        h.service.provision_default(h.contact.user_id).await.unwrap();
        let err = h.service.cancel_subscription(&h.contact, None).await.unwrap_err();
        assert_eq!(err.code(), "CANNOT_CANCEL_FREE_PLAN");
    }

    #[tokio::test]
    async fn test_reactivate_requires_pending_cancellation() {
        let h = harness();
        let now = OffsetDateTime::now_utc();
        place_on(&h, "pro", now, Some(now + Duration::days(30)));
        h.service.downgrade_plan_at(&h.contact, "free", now).await.unwrap();

        let err = h.service.reactivate_subscription(&h.contact).await.unwrap_err();
        assert_eq!(err.code(), "NO_PENDING_CANCELLATION");
    }

    #[tokio::test]
    async fn test_cancel_scheduled_change_without_schedule() {
        let h = harness();
        h.service.provision_default(h.contact.user_id).await.unwrap();
        let err = h
            .service
            .cancel_scheduled_change(h.contact.user_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_SCHEDULED_CHANGE");
    }

    #[tokio::test]
    async fn test_preview_downgrade_reports_overages_without_writing() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        let end = now + Duration::days(20);
        place_on(&h, "pro", now - Duration::days(10), Some(end));
        h.counter.set(h.contact.user_id, ResourceKind::Accounts, 4);
        let before = h.store.subscription(h.contact.user_id).unwrap();

        let preview = h
            .service
            .preview_plan_change_at(h.contact.user_id, "free", now)
            .await
            .unwrap();
        assert_eq!(preview.change, PlanChangeKind::Downgrade);
        assert!(preview.proration.is_none());
        assert_eq!(preview.overages[0].overage, 2);
        assert_eq!(preview.effective_at, end);
        assert_eq!(preview.grace_period_end, Some(end + Duration::days(7)));

        assert_eq!(h.store.subscription(h.contact.user_id).unwrap(), before);
        assert!(h.store.change_logs(h.contact.user_id).is_empty());
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stale_write_is_concurrent_modification() {
        struct RacingStore {
            inner: InMemoryBillingStore,
        }

        #[async_trait::async_trait]
        impl PlanStore for RacingStore {
            async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
                self.inner.list_plans().await
            }
            async fn get_plan_by_code(&self, code: &str) -> BillingResult<Option<Plan>> {
                self.inner.get_plan_by_code(code).await
            }
            async fn get_plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
                self.inner.get_plan_by_id(plan_id).await
            }
            async fn get_default_plans(&self) -> BillingResult<Vec<Plan>> {
                self.inner.get_default_plans().await
            }
        }

        #[async_trait::async_trait]
        impl SubscriptionStore for RacingStore {
            async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
                let sub = self.inner.get_subscription(user_id).await;
                // Another writer lands between our read and our write.
                self.inner.bump_version(user_id);
                sub
            }
            async fn insert_subscription(&self, s: &Subscription) -> BillingResult<bool> {
                self.inner.insert_subscription(s).await
            }
            async fn save_subscription(
                &self,
                s: &Subscription,
                log: Option<&crate::models::PlanChangeLog>,
            ) -> BillingResult<Subscription> {
                self.inner.save_subscription(s, log).await
            }
            async fn list_due_scheduled_changes(
                &self,
                now: OffsetDateTime,
                after: Option<crate::store::DueCursor>,
                limit: i64,
            ) -> BillingResult<Vec<Subscription>> {
                self.inner.list_due_scheduled_changes(now, after, limit).await
            }
            async fn list_grace_periods_ending(
                &self,
                after: OffsetDateTime,
                until: OffsetDateTime,
            ) -> BillingResult<Vec<Subscription>> {
                self.inner.list_grace_periods_ending(after, until).await
            }
            async fn list_expired_grace_periods(
                &self,
                now: OffsetDateTime,
            ) -> BillingResult<Vec<Subscription>> {
                self.inner.list_expired_grace_periods(now).await
            }
            async fn list_subscriptions(
                &self,
                after: Option<Uuid>,
                limit: i64,
            ) -> BillingResult<Vec<Subscription>> {
                self.inner.list_subscriptions(after, limit).await
            }
        }

        #[async_trait::async_trait]
        impl UsageStore for RacingStore {
            async fn get_usage(
                &self,
                user_id: Uuid,
                feature_code: &str,
                period_start: OffsetDateTime,
            ) -> BillingResult<Option<crate::models::UsageRecord>> {
                self.inner.get_usage(user_id, feature_code, period_start).await
            }
            async fn increment_usage(
                &self,
                user_id: Uuid,
                feature_code: &str,
                window: &crate::period::PeriodWindow,
                amount: i64,
            ) -> BillingResult<i64> {
                self.inner.increment_usage(user_id, feature_code, window, amount).await
            }
            async fn decrement_usage(
                &self,
                user_id: Uuid,
                feature_code: &str,
                window: &crate::period::PeriodWindow,
                amount: i64,
            ) -> BillingResult<i64> {
                self.inner.decrement_usage(user_id, feature_code, window, amount).await
            }
            async fn list_usage_history(
                &self,
                user_id: Uuid,
                feature_code: &str,
            ) -> BillingResult<Vec<crate::models::UsageRecord>> {
                self.inner.list_usage_history(user_id, feature_code).await
            }
        }

        #[async_trait::async_trait]
        impl PlanChangeLogStore for RacingStore {
            async fn list_plan_changes(
                &self,
                user_id: Uuid,
                limit: i64,
            ) -> BillingResult<Vec<crate::models::PlanChangeLog>> {
                self.inner.list_plan_changes(user_id, limit).await
            }
        }

        let inner = InMemoryBillingStore::with_default_catalog();
        let config = BillingConfig::default();
        let store: Arc<dyn BillingStore> = Arc::new(RacingStore {
            inner: inner.clone(),
        });
        let service = SubscriptionService::new(
            store.clone(),
            PlanCatalog::new(store, &config),
            OverageDetector::new(Arc::new(FixedResourceCounter::new()), config.clone()),
            NotificationDispatcher::inline(
                Arc::new(RecordingNotifier::default()),
                config.notification_timeout,
            ),
            config,
        );

        let contact = UserContact {
            user_id: Uuid::new_v4(),
            email: "sam@example.com".into(),
            name: "Sam".into(),
        };
        let now = OffsetDateTime::now_utc();
        let free = inner.plan("free").unwrap();
        inner.put_subscription(Subscription::new_default(contact.user_id, free.id, now));

        let err = service.upgrade_plan_at(&contact, "pro", now).await.unwrap_err();
        assert_eq!(err.code(), "CONCURRENT_MODIFICATION");
        assert_eq!(inner.subscription(contact.user_id).unwrap().plan_id, free.id);
        assert!(inner.change_logs(contact.user_id).is_empty());
    }

    #[tokio::test]
    async fn test_history_is_newest_first_with_codes() {
        let h = harness();
        let now = datetime!(2026-03-10 12:00 UTC);
        place_on(&h, "free", now - Duration::days(1), None);

        h.service.upgrade_plan_at(&h.contact, "pro", now).await.unwrap();
        h.service
            .cancel_subscription_at(&h.contact, None, now + Duration::minutes(1))
            .await
            .unwrap();

        let history = h
            .service
            .get_plan_history(h.contact.user_id, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_type, ChangeType::Cancellation);
        assert_eq!(history[1].from_plan.as_deref(), Some("free"));
        assert_eq!(history[1].to_plan.as_deref(), Some("pro"));

        let page = h
            .service
            .get_plan_history(h.contact.user_id, Some(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }
}
