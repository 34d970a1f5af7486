//! Billing Invariants Module
//!
//! Runnable consistency checks over the plan catalog and every subscription.
//! Checks only read. Violations carry enough context to debug the row by hand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{Plan, Subscription};
use crate::store::BillingStore;

const PAGE_SIZE: i64 = 500;

/// A due change this much older than `now` means the apply job is not running.
const SCHEDULED_CHANGE_LAG: Duration = Duration::hours(3);

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected (empty for catalog-level checks)
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements are being computed from broken data
    Critical,
    /// A subscription row is internally inconsistent
    High,
    /// Something is late or suspicious
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub subscriptions_checked: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: &[&str] = &[
    "single_default_plan",
    "subscription_plan_exists",
    "scheduled_change_paired",
    "grace_period_paired",
    "cancellation_targets_default",
    "default_plan_has_no_period_end",
    "scheduled_change_not_stale",
];

fn violation(
    invariant: &str,
    user_id: Option<Uuid>,
    severity: ViolationSeverity,
    description: String,
    context: serde_json::Value,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: user_id.into_iter().collect(),
        description,
        context,
        severity,
    }
}

/// Exactly one active default plan.
pub fn check_catalog(plans: &[Plan]) -> Vec<InvariantViolation> {
    let defaults: Vec<&Plan> = plans.iter().filter(|p| p.is_default && p.is_active).collect();
    if defaults.len() == 1 {
        return Vec::new();
    }
    vec![violation(
        "single_default_plan",
        None,
        ViolationSeverity::Critical,
        format!("Catalog has {} active default plans (expected 1)", defaults.len()),
        serde_json::json!({
            "default_plans": defaults.iter().map(|p| p.code.as_str()).collect::<Vec<_>>(),
        }),
    )]
}

/// Row-level checks for one subscription.
pub fn check_subscription(
    subscription: &Subscription,
    plans: &HashMap<Uuid, &Plan>,
    default_plan_id: Option<Uuid>,
    now: OffsetDateTime,
) -> Vec<InvariantViolation> {
    let user_id = Some(subscription.user_id);
    let mut violations = Vec::new();

    let plan = plans.get(&subscription.plan_id);
    if plan.is_none() {
        violations.push(violation(
            "subscription_plan_exists",
            user_id,
            ViolationSeverity::Critical,
            "Subscription references an unknown plan".to_string(),
            serde_json::json!({ "plan_id": subscription.plan_id }),
        ));
    }
    if let Some(scheduled) = subscription.scheduled_plan_id {
        if !plans.contains_key(&scheduled) {
            violations.push(violation(
                "subscription_plan_exists",
                user_id,
                ViolationSeverity::Critical,
                "Scheduled change references an unknown plan".to_string(),
                serde_json::json!({ "scheduled_plan_id": scheduled }),
            ));
        }
    }

    if subscription.scheduled_plan_id.is_some() != subscription.scheduled_change_at.is_some() {
        violations.push(violation(
            "scheduled_change_paired",
            user_id,
            ViolationSeverity::High,
            "Scheduled plan and scheduled date must be set together".to_string(),
            serde_json::json!({
                "scheduled_plan_id": subscription.scheduled_plan_id,
                "scheduled_change_at": subscription.scheduled_change_at.map(|t| t.unix_timestamp()),
            }),
        ));
    }

    if subscription.grace_overages.is_some() != subscription.grace_period_end.is_some() {
        violations.push(violation(
            "grace_period_paired",
            user_id,
            ViolationSeverity::High,
            "Grace overages and grace end must be set together".to_string(),
            serde_json::json!({
                "has_overages": subscription.grace_overages.is_some(),
                "grace_period_end": subscription.grace_period_end.map(|t| t.unix_timestamp()),
            }),
        ));
    }

    if subscription.cancelled_at.is_some() {
        let targets_default =
            default_plan_id.is_some() && subscription.scheduled_plan_id == default_plan_id;
        if !targets_default {
            violations.push(violation(
                "cancellation_targets_default",
                user_id,
                ViolationSeverity::High,
                "Cancelled subscription is not scheduled onto the default plan".to_string(),
                serde_json::json!({ "scheduled_plan_id": subscription.scheduled_plan_id }),
            ));
        }
    }

    if let Some(plan) = plan {
        if plan.is_default && subscription.current_period_end.is_some() {
            violations.push(violation(
                "default_plan_has_no_period_end",
                user_id,
                ViolationSeverity::Medium,
                format!("Subscription on default plan '{}' has a period end", plan.code),
                serde_json::json!({
                    "current_period_end": subscription.current_period_end.map(|t| t.unix_timestamp()),
                }),
            ));
        }
    }

    if let Some(at) = subscription.scheduled_change_at {
        if at + SCHEDULED_CHANGE_LAG < now {
            violations.push(violation(
                "scheduled_change_not_stale",
                user_id,
                ViolationSeverity::Medium,
                "Scheduled change is overdue; the apply job may not be running".to_string(),
                serde_json::json!({
                    "scheduled_change_at": at.unix_timestamp(),
                    "overdue_minutes": (now - at).whole_minutes(),
                }),
            ));
        }
    }

    violations
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub fn available_checks() -> &'static [&'static str] {
        CHECKS
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        self.run_all_checks_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_all_checks_at(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        // The catalog is read straight from the store, not the TTL cache.
        let plans = self.store.list_plans().await?;
        let mut violations = check_catalog(&plans);

        let by_id: HashMap<Uuid, &Plan> = plans.iter().map(|p| (p.id, p)).collect();
        let default_plan_id = plans
            .iter()
            .find(|p| p.is_default && p.is_active)
            .map(|p| p.id);

        let mut subscriptions_checked = 0;
        let mut after = None;
        loop {
            let page = self.store.list_subscriptions(after, PAGE_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.user_id);
            subscriptions_checked += page.len();

            for subscription in &page {
                violations.extend(check_subscription(subscription, &by_id, default_plan_id, now));
            }
            if (page.len() as i64) < PAGE_SIZE {
                break;
            }
        }

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            subscriptions_checked,
            healthy: violations.is_empty(),
            violations,
        })
    }
}
