//! Plan catalog
//!
//! Read-mostly view over the plan store with a TTL cache in front. Plans are
//! only edited administratively; callers that edit plans must call
//! [`PlanCatalog::invalidate`].

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::Plan;
use crate::store::BillingStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PlanKey {
    All,
    Code(String),
    Id(Uuid),
    Default,
}

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
    cache: TtlCache<PlanKey, Arc<Vec<Plan>>>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>, config: &BillingConfig) -> Self {
        Self {
            store,
            cache: TtlCache::new(config.plan_cache_ttl),
        }
    }

    /// Active plans with their features, in upgrade order.
    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let store = self.store.clone();
        let plans = self
            .cache
            .get_or_try_insert_with(PlanKey::All, || async move {
                let mut plans = store.list_plans().await?;
                plans.retain(|p| p.is_active);
                plans.sort_by_key(|p| p.sort_order);
                Ok::<_, BillingError>(Arc::new(plans))
            })
            .await?;
        Ok(plans.as_ref().clone())
    }

    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<Plan>> {
        let store = self.store.clone();
        let lookup = code.to_string();
        let plans = self
            .cache
            .get_or_try_insert_with(PlanKey::Code(code.to_string()), || async move {
                let plan = store.get_plan_by_code(&lookup).await?;
                Ok::<_, BillingError>(Arc::new(plan.into_iter().collect()))
            })
            .await?;
        Ok(plans.first().cloned())
    }

    /// Like [`find_by_code`](Self::find_by_code) but a miss is `PLAN_NOT_FOUND`.
    /// Inactive plans are treated as missing.
    pub async fn get_by_code(&self, code: &str) -> BillingResult<Plan> {
        self.find_by_code(code)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| BillingError::PlanNotFound(code.to_string()))
    }

    /// Plans referenced by subscriptions must exist; a miss here is a data
    /// integrity problem, not a user error.
    pub async fn get_by_id(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let store = self.store.clone();
        let plans = self
            .cache
            .get_or_try_insert_with(PlanKey::Id(plan_id), || async move {
                let plan = store.get_plan_by_id(plan_id).await?;
                Ok::<_, BillingError>(Arc::new(plan.into_iter().collect()))
            })
            .await?;
        plans.first().cloned().ok_or_else(|| {
            BillingError::Misconfiguration(format!("Subscription references unknown plan {}", plan_id))
        })
    }

    /// The single default plan. Zero or several is a seed-data error.
    pub async fn default_plan(&self) -> BillingResult<Plan> {
        let store = self.store.clone();
        let plans = self
            .cache
            .get_or_try_insert_with(PlanKey::Default, || async move {
                Ok::<_, BillingError>(Arc::new(store.get_default_plans().await?))
            })
            .await?;

        match plans.as_slice() {
            [plan] => Ok(plan.clone()),
            [] => {
                tracing::error!("No default plan configured");
                Err(BillingError::Misconfiguration(
                    "No default plan configured".to_string(),
                ))
            }
            many => {
                tracing::error!(count = many.len(), "More than one default plan configured");
                Err(BillingError::Misconfiguration(format!(
                    "{} default plans configured, expected exactly one",
                    many.len()
                )))
            }
        }
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate_all().await;
        tracing::info!("Plan catalog cache invalidated");
    }
}
