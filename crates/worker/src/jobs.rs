//! Job bodies run by the scheduler
//!
//! Each job takes `now` explicitly and logs one summary event. Per-subscription
//! failures are logged by the processor; a failed run is logged here and
//! swallowed so the next tick runs normally.

use fintrack_billing::{
    ApplySummary, GracePeriodResult, GraceSummary, InvariantCheckSummary, InvariantChecker,
    ScheduledChangeProcessor, ScheduledChangeResult,
};
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Log results of applying due plan changes
pub fn log_apply_results(results: &[ScheduledChangeResult]) -> ApplySummary {
    let summary = ApplySummary::from_results(results);

    info!(
        applied = summary.applied,
        skipped = summary.skipped,
        errors = summary.errors,
        "Scheduled plan change cycle complete"
    );

    // Failures are already logged per subscription by the processor.
    for result in results {
        if let ScheduledChangeResult::Skipped { user_id, reason } = result {
            warn!(user_id = %user_id, reason = %reason, "Skipped scheduled change");
        }
    }

    summary
}

/// Log results of the grace period sweep
pub fn log_grace_results(results: &[GracePeriodResult]) -> GraceSummary {
    let summary = GraceSummary::from_results(results);

    info!(
        warned = summary.warned,
        expired = summary.expired,
        skipped = summary.skipped,
        errors = summary.errors,
        "Grace period cycle complete"
    );

    summary
}

pub async fn apply_scheduled_changes(
    processor: &ScheduledChangeProcessor,
    now: OffsetDateTime,
) -> Option<ApplySummary> {
    info!("Running scheduled plan change application");
    match processor.apply_due_changes(now).await {
        Ok(results) => Some(log_apply_results(&results)),
        Err(e) => {
            error!(error = %e, "Scheduled plan change run failed");
            None
        }
    }
}

pub async fn process_grace_periods(
    processor: &ScheduledChangeProcessor,
    now: OffsetDateTime,
) -> Option<GraceSummary> {
    info!("Running grace period warnings and expirations");
    match processor.process_grace_periods(now).await {
        Ok(results) => Some(log_grace_results(&results)),
        Err(e) => {
            error!(error = %e, "Grace period run failed");
            None
        }
    }
}

pub async fn check_invariants(
    checker: &InvariantChecker,
    now: OffsetDateTime,
) -> Option<InvariantCheckSummary> {
    match checker.run_all_checks_at(now).await {
        Ok(summary) => {
            if summary.healthy {
                info!(
                    checks_run = summary.checks_run,
                    subscriptions_checked = summary.subscriptions_checked,
                    "Billing invariants healthy"
                );
            } else {
                for violation in &summary.violations {
                    warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        user_ids = ?violation.user_ids,
                        description = %violation.description,
                        "Billing invariant violated"
                    );
                }
                warn!(
                    checks_failed = summary.checks_failed,
                    violations = summary.violations.len(),
                    "Billing invariant check found violations"
                );
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Billing invariant check failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fintrack_billing::testing::{
        FixedResourceCounter, InMemoryBillingStore, RecordingNotifier, StaticUserDirectory,
    };
    use fintrack_billing::{BillingConfig, BillingService, Subscription, UserContact};
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    use super::*;

    struct Fixture {
        store: InMemoryBillingStore,
        directory: StaticUserDirectory,
        notifier: Arc<RecordingNotifier>,
        billing: BillingService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryBillingStore::with_default_catalog();
        let directory = StaticUserDirectory::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let billing = BillingService::new(
            Arc::new(store.clone()),
            Arc::new(FixedResourceCounter::new()),
            Arc::new(directory.clone()),
            notifier.clone(),
            BillingConfig::default(),
        );
        Fixture {
            store,
            directory,
            notifier,
            billing,
        }
    }

    fn cancelled_pro(f: &Fixture, user_id: Uuid, at: OffsetDateTime) -> Subscription {
        let pro = f.store.plan("pro").unwrap();
        let free = f.store.plan("free").unwrap();
        let mut sub = Subscription::new_default(user_id, pro.id, at - Duration::days(30));
        sub.current_period_end = Some(at);
        sub.schedule_change(free.id, at);
        sub.cancelled_at = Some(at - Duration::days(10));
        sub
    }

    #[tokio::test]
    async fn test_apply_job_applies_due_cancellation() {
        let f = fixture();
        let now = datetime!(2026-05-01 10:05 UTC);
        let user_id = Uuid::new_v4();
        f.directory.insert(UserContact {
            user_id,
            email: "ana@example.com".into(),
            name: "Ana".into(),
        });
        f.store
            .put_subscription(cancelled_pro(&f, user_id, now - Duration::hours(1)));

        let summary = apply_scheduled_changes(&f.billing.scheduled, now)
            .await
            .unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.errors, 0);

        let sub = f.store.subscription(user_id).unwrap();
        assert_eq!(sub.plan_id, f.store.plan("free").unwrap().id);
        assert!(sub.cancelled_at.is_none());
        assert_eq!(f.notifier.sent().len(), 1);

        // Second tick finds nothing due
        let again = apply_scheduled_changes(&f.billing.scheduled, now)
            .await
            .unwrap();
        assert_eq!(again.applied, 0);
    }

    #[tokio::test]
    async fn test_apply_job_counts_a_failed_save_once() {
        let f = fixture();
        let now = datetime!(2026-05-01 10:05 UTC);
        let user_id = Uuid::new_v4();
        f.store
            .put_subscription(cancelled_pro(&f, user_id, now - Duration::hours(1)));
        f.store.fail_saves_for(user_id);

        let summary = apply_scheduled_changes(&f.billing.scheduled, now)
            .await
            .unwrap();
        assert_eq!(summary, ApplySummary { applied: 0, skipped: 0, errors: 1 });
        assert!(f.store.subscription(user_id).unwrap().scheduled_plan_id.is_some());
    }

    #[tokio::test]
    async fn test_grace_job_with_nothing_in_grace() {
        let f = fixture();
        let summary = process_grace_periods(&f.billing.scheduled, datetime!(2026-05-01 09:00 UTC))
            .await
            .unwrap();
        assert_eq!(summary, GraceSummary::default());
    }

    #[tokio::test]
    async fn test_invariant_job_reports_stale_schedule() {
        let f = fixture();
        let now = datetime!(2026-05-01 04:30 UTC);
        f.store
            .put_subscription(cancelled_pro(&f, Uuid::new_v4(), now - Duration::days(2)));

        let summary = check_invariants(&f.billing.invariants, now).await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.violations[0].invariant, "scheduled_change_not_stale");
    }

    #[test]
    fn test_log_apply_results_counts() {
        let results = vec![
            ScheduledChangeResult::Skipped {
                user_id: Uuid::new_v4(),
                reason: "already applied".into(),
            },
            ScheduledChangeResult::Error {
                user_id: Uuid::new_v4(),
                error: "boom".into(),
            },
        ];
        let summary = log_apply_results(&results);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 1);
    }
}
