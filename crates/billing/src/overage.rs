//! Overage detection against a downgrade target
//!
//! Compares the user's live resource counts with the target plan's RESOURCE
//! COUNT limits. Over-limit resources are never deleted. Features on the
//! grace list stay usable until the grace period ends; the others are capped
//! as soon as the downgrade applies.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::models::{GraceOverages, Overage, Plan};
use crate::resources::{ResourceCounter, ResourceKind};

#[derive(Clone)]
pub struct OverageDetector {
    resources: Arc<dyn ResourceCounter>,
    config: BillingConfig,
}

impl OverageDetector {
    pub fn new(resources: Arc<dyn ResourceCounter>, config: BillingConfig) -> Self {
        Self { resources, config }
    }

    pub async fn detect_overages(&self, user_id: Uuid, target: &Plan) -> BillingResult<Vec<Overage>> {
        let mut overages = Vec::new();

        for feature in target.resource_features() {
            let Some(kind) = ResourceKind::from_feature_code(&feature.feature_code) else {
                tracing::warn!(
                    plan = %target.code,
                    feature_code = %feature.feature_code,
                    "RESOURCE feature has no resource counter, skipping overage check"
                );
                continue;
            };

            let current = self.resources.count(user_id, kind).await?;
            if current > feature.limit_value {
                overages.push(Overage {
                    feature_code: feature.feature_code.clone(),
                    current,
                    new_limit: feature.limit_value,
                    overage: current - feature.limit_value,
                    has_grace_period: self.config.has_grace_period(&feature.feature_code),
                });
            }
        }

        if !overages.is_empty() {
            tracing::info!(
                user_id = %user_id,
                target_plan = %target.code,
                overage_count = overages.len(),
                "Overages detected against target plan"
            );
        }
        Ok(overages)
    }

    /// Grace state for `overages` starting at `anchor`, or None when no
    /// overage is on the grace list.
    pub fn grace_for(
        &self,
        overages: &[Overage],
        anchor: OffsetDateTime,
    ) -> Option<(GraceOverages, OffsetDateTime)> {
        let map = grace_overages(overages);
        if map.is_empty() {
            return None;
        }
        Some((map, anchor + Duration::days(self.config.grace_period_days)))
    }
}

/// featureCode -> overage for the overages that get a grace period.
pub fn grace_overages(overages: &[Overage]) -> GraceOverages {
    overages
        .iter()
        .filter(|o| o.has_grace_period)
        .map(|o| (o.feature_code.clone(), o.overage))
        .collect()
}

/// Rebuild the overage list stored in grace state, for notifications.
pub fn overages_from_grace(grace: &GraceOverages, target: &Plan) -> Vec<Overage> {
    grace
        .iter()
        .map(|(feature_code, overage)| {
            let new_limit = target
                .feature(feature_code)
                .map(|f| f.limit_value)
                .unwrap_or(0);
            Overage {
                feature_code: feature_code.clone(),
                current: new_limit + overage,
                new_limit,
                overage: *overage,
                has_grace_period: true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_catalog, FixedResourceCounter};

    fn free_plan() -> Plan {
        seed_catalog().remove(0)
    }

    fn detector(counter: &FixedResourceCounter) -> OverageDetector {
        OverageDetector::new(Arc::new(counter.clone()), BillingConfig::default())
    }

    #[tokio::test]
    async fn test_detects_accounts_overage() {
        let counter = FixedResourceCounter::new();
        let user = Uuid::new_v4();
        counter.set(user, ResourceKind::Accounts, 5);
        counter.set(user, ResourceKind::Goals, 1);

        let overages = detector(&counter).detect_overages(user, &free_plan()).await.unwrap();
        assert_eq!(
            overages,
            vec![Overage {
                feature_code: "accounts".into(),
                current: 5,
                new_limit: 2,
                overage: 3,
                has_grace_period: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_no_grace_for_hard_capped_features() {
        let counter = FixedResourceCounter::new();
        let user = Uuid::new_v4();
        counter.set(user, ResourceKind::Goals, 4);

        let detector = detector(&counter);
        let overages = detector.detect_overages(user, &free_plan()).await.unwrap();
        assert_eq!(overages.len(), 1);
        assert!(!overages[0].has_grace_period);
        assert!(detector.grace_for(&overages, OffsetDateTime::now_utc()).is_none());
    }

    #[tokio::test]
    async fn test_unlimited_target_has_no_overages() {
        let counter = FixedResourceCounter::new();
        let user = Uuid::new_v4();
        counter.set(user, ResourceKind::Accounts, 500);
        let premium = seed_catalog().remove(2);

        let overages = detector(&counter).detect_overages(user, &premium).await.unwrap();
        assert!(overages.is_empty());
    }

    #[test]
    fn test_grace_end_offset() {
        let counter = FixedResourceCounter::new();
        let anchor = time::macros::datetime!(2026-04-01 00:00 UTC);
        let overages = vec![Overage {
            feature_code: "accounts".into(),
            current: 5,
            new_limit: 2,
            overage: 3,
            has_grace_period: true,
        }];

        let (map, end) = detector(&counter).grace_for(&overages, anchor).unwrap();
        assert_eq!(map["accounts"], 3);
        assert_eq!(end, time::macros::datetime!(2026-04-08 00:00 UTC));
        assert_eq!(overages_from_grace(&map, &free_plan()), overages);
    }
}
