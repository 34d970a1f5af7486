//! Feature access decisions
//!
//! [`decide`] is the single function that turns a plan feature row and an
//! observed count into allow/deny. [`FeatureAccessChecker`] gathers those
//! inputs (subscription, plan, usage) and never writes anything: gating a
//! CONSUMABLE action and recording its usage are separate calls.
//!
//! RESOURCE counts come from the caller. Two concurrent creations can both
//! pass the check and exceed the cap by one; closing that needs the resource
//! insert itself to be bounded by a count.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{FeatureType, LimitType, PlanFeature, Subscription, UNLIMITED};
use crate::period::PeriodWindow;
use crate::plans::PlanCatalog;
use crate::resources::{ResourceCounter, ResourceKind};
use crate::store::BillingStore;
use crate::usage::{FeatureUsage, UsageCounter, UsageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessDenialReason {
    FeatureNotAvailable,
    FeatureLimitExceeded,
    /// The feature row is inconsistent (e.g. COUNT without a feature type).
    UnknownLimitType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureAccess {
    pub allowed: bool,
    pub current: i64,
    /// -1 when unlimited.
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AccessDenialReason>,
}

impl FeatureAccess {
    fn allow(current: i64, limit: i64) -> Self {
        Self {
            allowed: true,
            current,
            limit,
            reason: None,
        }
    }

    fn deny(current: i64, limit: i64, reason: AccessDenialReason) -> Self {
        Self {
            allowed: false,
            current,
            limit,
            reason: Some(reason),
        }
    }

    /// Turn a denial into the matching business error.
    pub fn into_result(self, feature_code: &str) -> BillingResult<FeatureAccess> {
        match self.reason {
            None => Ok(self),
            Some(AccessDenialReason::FeatureLimitExceeded) => Err(BillingError::FeatureLimitExceeded {
                feature_code: feature_code.to_string(),
                current: self.current,
                limit: self.limit,
            }),
            Some(AccessDenialReason::FeatureNotAvailable)
            | Some(AccessDenialReason::UnknownLimitType) => Err(BillingError::FeatureNotAvailable {
                feature_code: feature_code.to_string(),
            }),
        }
    }
}

/// Pure access decision for one feature row.
///
/// `observed` is the caller-supplied RESOURCE count, or the usage counter's
/// value for CONSUMABLE features. It is informational for UNLIMITED.
pub fn decide(feature: Option<&PlanFeature>, observed: i64) -> FeatureAccess {
    let Some(feature) = feature else {
        return FeatureAccess::deny(0, 0, AccessDenialReason::FeatureNotAvailable);
    };

    match feature.limit_type {
        LimitType::Unlimited => FeatureAccess::allow(observed, UNLIMITED),
        LimitType::Boolean => {
            if feature.limit_value == 1 {
                FeatureAccess::allow(0, feature.limit_value)
            } else {
                FeatureAccess::deny(0, feature.limit_value, AccessDenialReason::FeatureNotAvailable)
            }
        }
        LimitType::Count => {
            let well_formed = match feature.feature_type {
                Some(FeatureType::Resource) => true,
                Some(FeatureType::Consumable) => feature.limit_period.is_some(),
                None => false,
            };
            if !well_formed {
                return FeatureAccess::deny(
                    observed,
                    feature.limit_value,
                    AccessDenialReason::UnknownLimitType,
                );
            }
            if observed < feature.limit_value {
                FeatureAccess::allow(observed, feature.limit_value)
            } else {
                FeatureAccess::deny(
                    observed,
                    feature.limit_value,
                    AccessDenialReason::FeatureLimitExceeded,
                )
            }
        }
    }
}

#[derive(Clone)]
pub struct FeatureAccessChecker {
    store: Arc<dyn BillingStore>,
    catalog: PlanCatalog,
    usage: UsageCounter,
    resources: Arc<dyn ResourceCounter>,
}

impl FeatureAccessChecker {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: PlanCatalog,
        usage: UsageCounter,
        resources: Arc<dyn ResourceCounter>,
    ) -> Self {
        Self {
            store,
            catalog,
            usage,
            resources,
        }
    }

    async fn subscription(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(user_id)
            .await?
            .ok_or(BillingError::NoSubscription(user_id))
    }

    pub async fn check_feature_access(
        &self,
        user_id: Uuid,
        feature_code: &str,
        resource_count: Option<i64>,
    ) -> BillingResult<FeatureAccess> {
        self.check_feature_access_at(user_id, feature_code, resource_count, OffsetDateTime::now_utc())
            .await
    }

    /// Read-only. CONSUMABLE usage is read for the window containing `now`.
    pub async fn check_feature_access_at(
        &self,
        user_id: Uuid,
        feature_code: &str,
        resource_count: Option<i64>,
        now: OffsetDateTime,
    ) -> BillingResult<FeatureAccess> {
        let subscription = self.subscription(user_id).await?;
        let plan = self.catalog.get_by_id(subscription.plan_id).await?;
        let feature = plan.feature(feature_code);

        let observed = match feature {
            Some(f) if f.is_consumable_count() => match f.limit_period {
                Some(period) => {
                    self.usage
                        .get_usage_at(user_id, feature_code, period, now)
                        .await?
                }
                None => 0,
            },
            _ => resource_count.unwrap_or(0),
        };

        let access = decide(feature, observed);
        match access.reason {
            Some(AccessDenialReason::UnknownLimitType) => {
                tracing::error!(
                    user_id = %user_id,
                    plan = %plan.code,
                    feature_code = feature_code,
                    "Plan feature has an inconsistent limit configuration"
                );
            }
            Some(reason) => {
                tracing::debug!(
                    user_id = %user_id,
                    plan = %plan.code,
                    feature_code = feature_code,
                    current = access.current,
                    limit = access.limit,
                    reason = ?reason,
                    "Feature access denied"
                );
            }
            None => {}
        }
        Ok(access)
    }

    /// Like [`check_feature_access`](Self::check_feature_access) but a denial
    /// is an error.
    pub async fn require_feature_access(
        &self,
        user_id: Uuid,
        feature_code: &str,
        resource_count: Option<i64>,
    ) -> BillingResult<FeatureAccess> {
        self.check_feature_access(user_id, feature_code, resource_count)
            .await?
            .into_result(feature_code)
    }

    /// The feature row on the user's current plan, if the plan has it.
    pub async fn plan_feature(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Option<PlanFeature>> {
        let subscription = self.subscription(user_id).await?;
        let plan = self.catalog.get_by_id(subscription.plan_id).await?;
        Ok(plan.feature(feature_code).cloned())
    }

    /// Live count from the wired resource counter, None when `feature_code`
    /// does not name a resource kind.
    pub async fn live_resource_count(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Option<i64>> {
        match ResourceKind::from_feature_code(feature_code) {
            Some(kind) => Ok(Some(self.resources.count(user_id, kind).await?)),
            None => Ok(None),
        }
    }

    /// Usage of every feature on the user's current plan.
    pub async fn get_user_usage(&self, user_id: Uuid) -> BillingResult<UsageReport> {
        self.get_user_usage_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn get_user_usage_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UsageReport> {
        let subscription = self.subscription(user_id).await?;
        let plan = self.catalog.get_by_id(subscription.plan_id).await?;

        let mut features = Vec::with_capacity(plan.features.len());
        for feature in &plan.features {
            let mut period = None;
            let current = if feature.is_consumable_count() {
                match feature.limit_period {
                    Some(limit_period) => {
                        let window = PeriodWindow::containing(limit_period, now)?;
                        period = Some(window);
                        self.store
                            .get_usage(user_id, &feature.feature_code, window.start)
                            .await?
                            .map(|r| r.count)
                            .unwrap_or(0)
                    }
                    None => 0,
                }
            } else if let Some(kind) = ResourceKind::from_feature_code(&feature.feature_code) {
                self.resources.count(user_id, kind).await?
            } else {
                0
            };

            let remaining = match feature.limit_type {
                LimitType::Count => Some((feature.limit_value - current).max(0)),
                _ => None,
            };

            features.push(FeatureUsage {
                feature_code: feature.feature_code.clone(),
                limit_type: feature.limit_type,
                feature_type: feature.feature_type,
                limit: feature.limit_value,
                current,
                remaining,
                period,
            });
        }

        Ok(UsageReport {
            user_id,
            plan_code: plan.code,
            features,
        })
    }
}
