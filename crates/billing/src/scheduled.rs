//! Background processing of deferred plan changes
//!
//! Two jobs, both idempotent and both isolating failures per subscription:
//!
//! - [`ScheduledChangeProcessor::apply_due_changes`] applies downgrades and
//!   cancellations whose `scheduled_change_at` has passed (hourly).
//! - [`ScheduledChangeProcessor::process_grace_periods`] sends grace warnings
//!   and clears expired grace state (daily).

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::directory::UserDirectory;
use crate::email::{format_date, Notification, NotificationDispatcher};
use crate::error::{BillingError, BillingResult};
use crate::history::PlanChangeLogBuilder;
use crate::models::{ChangeType, Subscription, SubscriptionStatus};
use crate::overage::{overages_from_grace, OverageDetector};
use crate::plans::PlanCatalog;
use crate::proration::days_remaining;
use crate::store::{BillingStore, DueCursor};

/// Due changes are fetched in batches of this size.
pub const APPLY_BATCH_SIZE: i64 = 500;

/// Outcome for one due subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduledChangeResult {
    Applied {
        user_id: Uuid,
        from_plan: String,
        to_plan: String,
        is_cancellation: bool,
        grace_period_end: Option<i64>,
    },
    Skipped {
        user_id: Uuid,
        reason: String,
    },
    Error {
        user_id: Uuid,
        error: String,
    },
}

impl ScheduledChangeResult {
    pub fn user_id(&self) -> Uuid {
        match self {
            ScheduledChangeResult::Applied { user_id, .. }
            | ScheduledChangeResult::Skipped { user_id, .. }
            | ScheduledChangeResult::Error { user_id, .. } => *user_id,
        }
    }
}

/// Outcome for one subscription in grace.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GracePeriodResult {
    Warned { user_id: Uuid, days_remaining: i64 },
    Expired { user_id: Uuid },
    Skipped { user_id: Uuid, reason: String },
    Error { user_id: Uuid, error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub applied: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ApplySummary {
    pub fn from_results(results: &[ScheduledChangeResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result {
                ScheduledChangeResult::Applied { .. } => summary.applied += 1,
                ScheduledChangeResult::Skipped { .. } => summary.skipped += 1,
                ScheduledChangeResult::Error { .. } => summary.errors += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraceSummary {
    pub warned: usize,
    pub expired: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl GraceSummary {
    pub fn from_results(results: &[GracePeriodResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result {
                GracePeriodResult::Warned { .. } => summary.warned += 1,
                GracePeriodResult::Expired { .. } => summary.expired += 1,
                GracePeriodResult::Skipped { .. } => summary.skipped += 1,
                GracePeriodResult::Error { .. } => summary.errors += 1,
            }
        }
        summary
    }
}

#[derive(Clone)]
pub struct ScheduledChangeProcessor {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    overages: OverageDetector,
    directory: Arc<dyn UserDirectory>,
    notifications: NotificationDispatcher,
    config: BillingConfig,
    batch_size: i64,
}

impl ScheduledChangeProcessor {
    /// Notifications are always delivered inline so a run has finished its
    /// emails when it returns.
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        overages: OverageDetector,
        directory: Arc<dyn UserDirectory>,
        notifications: NotificationDispatcher,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            overages,
            directory,
            notifications: notifications.with_inline_delivery(),
            config,
            batch_size: APPLY_BATCH_SIZE,
        }
    }

    /// Page size for due changes, at least one.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    // =========================================================================
    // Apply due changes
    // =========================================================================

    /// Apply every change due at `now`. Only a failure to list due changes is
    /// returned as an error; per-subscription failures become
    /// [`ScheduledChangeResult::Error`] and the batch continues.
    pub async fn apply_due_changes(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<ScheduledChangeResult>> {
        let mut results = Vec::new();
        let mut cursor = None;

        loop {
            let due = self
                .store
                .list_due_scheduled_changes(now, cursor, self.batch_size)
                .await?;
            let full_batch = i64::try_from(due.len()).is_ok_and(|n| n >= self.batch_size);
            // Rows that fail stay due; paging past them keeps later rows reachable.
            cursor = due.last().and_then(DueCursor::of).or(cursor);

            for subscription in due {
                let user_id = subscription.user_id;
                let result = match self.apply_one(subscription, now).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(
                            user_id = %user_id,
                            error = %e,
                            "Failed to apply scheduled plan change"
                        );
                        ScheduledChangeResult::Error {
                            user_id,
                            error: e.to_string(),
                        }
                    }
                };
                results.push(result);
            }

            if !full_batch {
                break;
            }
        }

        // A row rescheduled during the run can be listed twice; keep its last outcome.
        dedup_by_user(&mut results);
        Ok(results)
    }

    async fn apply_one(
        &self,
        mut subscription: Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<ScheduledChangeResult> {
        let user_id = subscription.user_id;
        let Some(target_id) = subscription.scheduled_plan_id else {
            return Ok(ScheduledChangeResult::Skipped {
                user_id,
                reason: "no scheduled plan".to_string(),
            });
        };

        let current = self.catalog.get_by_id(subscription.plan_id).await?;
        let target = self.catalog.get_by_id(target_id).await?;
        let default_plan = self.catalog.default_plan().await?;
        let is_cancellation = target.id == default_plan.id;

        // Usage may have changed since the downgrade was requested.
        let overages = self.overages.detect_overages(user_id, &target).await?;
        let grace = self.overages.grace_for(&overages, now);
        let grace_period_end = grace.as_ref().map(|(_, end)| *end);

        let scheduled_for = subscription.scheduled_change_at;
        let cancel_reason = subscription.cancel_reason.clone();

        subscription.plan_id = target.id;
        subscription.status = SubscriptionStatus::Active;
        subscription.current_period_start = now;
        subscription.current_period_end = if target.is_default {
            None
        } else {
            Some(now + Duration::days(self.config.billing_period_days))
        };
        subscription.clear_scheduled_change();
        subscription.set_grace(grace);

        let change_type = if is_cancellation {
            ChangeType::CancellationApplied
        } else {
            ChangeType::DowngradeApplied
        };

        let log = PlanChangeLogBuilder::new(user_id, change_type, now)
            .plans(current.id, target.id)
            .effective_at(now)
            .reason(cancel_reason)
            .metadata(serde_json::json!({
                "scheduled_for": scheduled_for.map(|at| at.unix_timestamp()),
            }))
            .overages(&overages, grace_period_end)
            .build();

        self.store.save_subscription(&subscription, Some(&log)).await?;

        tracing::info!(
            user_id = %user_id,
            from_plan = %current.code,
            to_plan = %target.code,
            is_cancellation = is_cancellation,
            overage_count = overages.len(),
            "Applied scheduled plan change"
        );

        match self.directory.contact(user_id).await {
            Ok(Some(contact)) => {
                self.notifications
                    .dispatch(
                        &contact,
                        Notification::PlanDowngradeApplied {
                            user_name: contact.name.clone(),
                            previous_plan: current.name.clone(),
                            new_plan: target.name.clone(),
                            is_cancellation,
                            overages: overages.clone(),
                            grace_period_end: grace_period_end.map(format_date).unwrap_or_default(),
                        },
                    )
                    .await;
            }
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No contact for user, skipping plan change email");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to look up user contact");
            }
        }

        Ok(ScheduledChangeResult::Applied {
            user_id,
            from_plan: current.code,
            to_plan: target.code,
            is_cancellation,
            grace_period_end: grace_period_end.map(|end| end.unix_timestamp()),
        })
    }

    // =========================================================================
    // Grace periods
    // =========================================================================

    /// Warn users whose grace ends within the warning window and expire grace
    /// periods that have ended. Intended to run once a day.
    pub async fn process_grace_periods(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<GracePeriodResult>> {
        let mut results = Vec::new();

        let warning_until = now + Duration::days(self.config.grace_warning_days);
        for subscription in self
            .store
            .list_grace_periods_ending(now, warning_until)
            .await?
        {
            let user_id = subscription.user_id;
            let result = self
                .warn_one(&subscription, now)
                .await
                .unwrap_or_else(|e| grace_error(user_id, e));
            results.push(result);
        }

        for subscription in self.store.list_expired_grace_periods(now).await? {
            let user_id = subscription.user_id;
            let result = self
                .expire_one(subscription)
                .await
                .unwrap_or_else(|e| grace_error(user_id, e));
            results.push(result);
        }

        Ok(results)
    }

    async fn warn_one(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<GracePeriodResult> {
        let user_id = subscription.user_id;
        let (Some(grace), Some(end)) = (&subscription.grace_overages, subscription.grace_period_end)
        else {
            return Ok(GracePeriodResult::Skipped {
                user_id,
                reason: "no grace state".to_string(),
            });
        };

        let Some(contact) = self.directory.contact(user_id).await? else {
            tracing::warn!(user_id = %user_id, "No contact for user, skipping grace warning");
            return Ok(GracePeriodResult::Skipped {
                user_id,
                reason: "no contact".to_string(),
            });
        };

        let plan = self.catalog.get_by_id(subscription.plan_id).await?;
        let days = days_remaining(end, now);

        self.notifications
            .dispatch(
                &contact,
                Notification::GracePeriodWarning {
                    user_name: contact.name.clone(),
                    days_remaining: days,
                    grace_period_end: format_date(end),
                    overages: overages_from_grace(grace, &plan),
                },
            )
            .await;

        tracing::info!(user_id = %user_id, days_remaining = days, "Sent grace period warning");
        Ok(GracePeriodResult::Warned {
            user_id,
            days_remaining: days,
        })
    }

    async fn expire_one(&self, mut subscription: Subscription) -> BillingResult<GracePeriodResult> {
        let user_id = subscription.user_id;
        let Some(grace) = subscription.grace_overages.clone() else {
            return Ok(GracePeriodResult::Skipped {
                user_id,
                reason: "no grace state".to_string(),
            });
        };

        let plan = self.catalog.get_by_id(subscription.plan_id).await?;
        subscription.clear_grace();
        self.store.save_subscription(&subscription, None).await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan.code,
            features = grace.len(),
            "Grace period expired, limits now enforced"
        );

        match self.directory.contact(user_id).await {
            Ok(Some(contact)) => {
                self.notifications
                    .dispatch(
                        &contact,
                        Notification::GracePeriodExpired {
                            user_name: contact.name.clone(),
                            plan: plan.name.clone(),
                            overages: overages_from_grace(&grace, &plan),
                        },
                    )
                    .await;
            }
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No contact for user, skipping grace expiry email");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to look up user contact");
            }
        }

        Ok(GracePeriodResult::Expired { user_id })
    }
}

fn grace_error(user_id: Uuid, e: BillingError) -> GracePeriodResult {
    tracing::error!(user_id = %user_id, error = %e, "Failed to process grace period");
    GracePeriodResult::Error {
        user_id,
        error: e.to_string(),
    }
}

fn dedup_by_user(results: &mut Vec<ScheduledChangeResult>) {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<ScheduledChangeResult> = results
        .drain(..)
        .rev()
        .filter(|r| seen.insert(r.user_id()))
        .collect();
    deduped.reverse();
    *results = deduped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GraceOverages, UserContact};
    use crate::resources::ResourceKind;
    use crate::testing::{
        FixedResourceCounter, InMemoryBillingStore, RecordingNotifier, StaticUserDirectory,
    };
    use time::macros::datetime;

    struct Harness {
        store: InMemoryBillingStore,
        counter: FixedResourceCounter,
        directory: StaticUserDirectory,
        notifier: Arc<RecordingNotifier>,
        processor: ScheduledChangeProcessor,
    }

    fn harness() -> Harness {
        let store = InMemoryBillingStore::with_default_catalog();
        let counter = FixedResourceCounter::new();
        let directory = StaticUserDirectory::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let config = BillingConfig::default();
        let shared: Arc<dyn BillingStore> = Arc::new(store.clone());
        let processor = ScheduledChangeProcessor::new(
            shared.clone(),
            PlanCatalog::new(shared, &config),
            OverageDetector::new(Arc::new(counter.clone()), config.clone()),
            Arc::new(directory.clone()),
            NotificationDispatcher::new(notifier.clone(), config.notification_timeout),
            config,
        );
        Harness {
            store,
            counter,
            directory,
            notifier,
            processor,
        }
    }

    fn user(h: &Harness) -> Uuid {
        let user_id = Uuid::new_v4();
        h.directory.insert(UserContact {
            user_id,
            email: format!("{}@example.com", user_id),
            name: "Ada".into(),
        });
        user_id
    }

    fn scheduled(h: &Harness, user_id: Uuid, from: &str, to: &str, at: OffsetDateTime) -> Subscription {
        let mut sub = Subscription::new_default(user_id, h.store.plan(from).unwrap().id, at - Duration::days(30));
        sub.current_period_end = Some(at);
        sub.schedule_change(h.store.plan(to).unwrap().id, at);
        sub
    }

    #[tokio::test]
    async fn test_applies_due_downgrade_and_skips_future() {
        let h = harness();
        let now = datetime!(2026-04-01 10:00 UTC);

        let due = user(&h);
        h.store.put_subscription(scheduled(&h, due, "premium", "pro", now - Duration::hours(1)));
        let later = user(&h);
        h.store.put_subscription(scheduled(&h, later, "premium", "pro", now + Duration::days(3)));

        let results = h.processor.apply_due_changes(now).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            &results[0],
            ScheduledChangeResult::Applied { is_cancellation: false, to_plan, .. } if to_plan == "pro"
        ));

        let sub = h.store.subscription(due).unwrap();
        assert_eq!(sub.plan_id, h.store.plan("pro").unwrap().id);
        assert!(sub.scheduled_plan_id.is_none() && sub.scheduled_change_at.is_none());
        assert_eq!(sub.current_period_start, now);
        assert_eq!(sub.current_period_end, Some(now + Duration::days(30)));

        let logs = h.store.change_logs(due);
        assert_eq!(logs[0].change_type, ChangeType::DowngradeApplied);
        assert_eq!(logs[0].effective_at, Some(now));
        assert_eq!(h.notifier.count("plan-downgrade-applied"), 1);

        assert!(h.store.subscription(later).unwrap().scheduled_plan_id.is_some());

        // Second run is a no-op.
        assert!(h.processor.apply_due_changes(now).await.unwrap().is_empty());
        assert_eq!(h.store.change_logs(due).len(), 1);
    }

    #[tokio::test]
    async fn test_applied_cancellation_lands_on_default_plan() {
        let h = harness();
        let now = datetime!(2026-04-01 10:00 UTC);
        let user_id = user(&h);
        let mut sub = scheduled(&h, user_id, "pro", "free", now);
        sub.cancelled_at = Some(now - Duration::days(5));
        sub.cancel_reason = Some("moving".into());
        h.store.put_subscription(sub);

        h.processor.apply_due_changes(now).await.unwrap();

        let sub = h.store.subscription(user_id).unwrap();
        assert_eq!(sub.plan_id, h.store.plan("free").unwrap().id);
        assert!(sub.current_period_end.is_none());
        assert!(sub.cancelled_at.is_none() && sub.cancel_reason.is_none());

        let log = &h.store.change_logs(user_id)[0];
        assert_eq!(log.change_type, ChangeType::CancellationApplied);
        assert_eq!(log.reason.as_deref(), Some("moving"));
        assert_eq!(h.notifier.sent()[0].variables["is_cancellation"], true);
    }

    #[tokio::test]
    async fn test_grace_is_recomputed_at_application() {
        let h = harness();
        let now = datetime!(2026-04-01 10:00 UTC);
        let user_id = user(&h);
        h.store.put_subscription(scheduled(&h, user_id, "pro", "free", now));
        h.counter.set(user_id, ResourceKind::Accounts, 5);
        h.counter.set(user_id, ResourceKind::Goals, 3);

        h.processor.apply_due_changes(now).await.unwrap();

        let sub = h.store.subscription(user_id).unwrap();
        let grace = sub.grace_overages.unwrap();
        assert_eq!(grace.get("accounts"), Some(&3));
        // goals are capped immediately, no grace entry
        assert!(!grace.contains_key("goals"));
        assert_eq!(sub.grace_period_end, Some(now + Duration::days(7)));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let h = harness();
        let now = datetime!(2026-04-01 10:00 UTC);
        let broken = user(&h);
        let fine = user(&h);
        h.store.put_subscription(scheduled(&h, broken, "premium", "pro", now - Duration::hours(2)));
        h.store.put_subscription(scheduled(&h, fine, "premium", "pro", now - Duration::hours(1)));
        h.store.fail_saves_for(broken);

        let results = h.processor.apply_due_changes(now).await.unwrap();
        let summary = ApplySummary::from_results(&results);
        assert_eq!(summary, ApplySummary { applied: 1, skipped: 0, errors: 1 });
        assert_eq!(h.store.subscription(fine).unwrap().plan_id, h.store.plan("pro").unwrap().id);
        assert!(h.store.subscription(broken).unwrap().scheduled_plan_id.is_some());
    }

    #[tokio::test]
    async fn test_failing_rows_do_not_hide_later_rows() {
        let h = harness();
        let processor = h.processor.clone().with_batch_size(2);
        let now = datetime!(2026-04-01 10:00 UTC);

        // A full page of failing rows sits ahead of a healthy one.
        let mut broken = Vec::new();
        for hours in [5, 4, 3] {
            let user_id = user(&h);
            h.store.put_subscription(scheduled(&h, user_id, "premium", "pro", now - Duration::hours(hours)));
            h.store.fail_saves_for(user_id);
            broken.push(user_id);
        }
        let fine = user(&h);
        h.store.put_subscription(scheduled(&h, fine, "premium", "pro", now - Duration::hours(1)));

        let results = processor.apply_due_changes(now).await.unwrap();
        assert_eq!(
            ApplySummary::from_results(&results),
            ApplySummary { applied: 1, skipped: 0, errors: 3 }
        );
        assert_eq!(h.store.subscription(fine).unwrap().plan_id, h.store.plan("pro").unwrap().id);
        for user_id in broken {
            assert!(h.store.subscription(user_id).unwrap().scheduled_plan_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_missing_contact_still_applies() {
        let h = harness();
        let now = datetime!(2026-04-01 10:00 UTC);
        let user_id = Uuid::new_v4();
        h.store.put_subscription(scheduled(&h, user_id, "premium", "pro", now));

        let results = h.processor.apply_due_changes(now).await.unwrap();
        assert!(matches!(results[0], ScheduledChangeResult::Applied { .. }));
        assert!(h.notifier.sent().is_empty());
    }

    fn in_grace(h: &Harness, user_id: Uuid, end: OffsetDateTime) {
        let mut sub = Subscription::new_default(user_id, h.store.plan("free").unwrap().id, end - Duration::days(7));
        let mut overages = GraceOverages::new();
        overages.insert("accounts".into(), 3);
        sub.set_grace(Some((overages, end)));
        h.store.put_subscription(sub);
    }

    #[tokio::test]
    async fn test_grace_warning_within_window() {
        let h = harness();
        let now = datetime!(2026-04-10 09:00 UTC);
        let soon = user(&h);
        in_grace(&h, soon, now + Duration::days(2));
        let far = user(&h);
        in_grace(&h, far, now + Duration::days(5));

        let results = h.processor.process_grace_periods(now).await.unwrap();
        assert_eq!(
            results,
            vec![GracePeriodResult::Warned {
                user_id: soon,
                days_remaining: 2
            }]
        );

        let sent = h.notifier.sent();
        assert_eq!(sent[0].template, "grace-period-warning");
        assert_eq!(sent[0].variables["days_remaining"], 2);
        assert_eq!(sent[0].variables["overages"][0]["overage"], 3);
        // warnings never modify the subscription
        assert!(h.store.subscription(soon).unwrap().grace_overages.is_some());
    }

    #[tokio::test]
    async fn test_grace_expiry_clears_state_once() {
        let h = harness();
        let now = datetime!(2026-04-10 09:00 UTC);
        let user_id = user(&h);
        in_grace(&h, user_id, now - Duration::hours(1));

        let results = h.processor.process_grace_periods(now).await.unwrap();
        assert_eq!(results, vec![GracePeriodResult::Expired { user_id }]);

        let sub = h.store.subscription(user_id).unwrap();
        assert!(sub.grace_overages.is_none() && sub.grace_period_end.is_none());
        assert!(h.store.change_logs(user_id).is_empty());

        h.processor.process_grace_periods(now).await.unwrap();
        assert_eq!(h.notifier.count("grace-period-expired"), 1);
    }

    #[test]
    fn test_summary_counts() {
        let user_id = Uuid::new_v4();
        let results = vec![
            GracePeriodResult::Warned { user_id, days_remaining: 1 },
            GracePeriodResult::Expired { user_id },
            GracePeriodResult::Error { user_id, error: "boom".into() },
        ];
        assert_eq!(
            GraceSummary::from_results(&results),
            GraceSummary { warned: 1, expired: 1, skipped: 0, errors: 1 }
        );
    }
}
