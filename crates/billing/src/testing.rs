//! In-memory backend and collaborator doubles.
//!
//! Compiled for this crate's tests and, behind the `test-support` feature, for
//! downstream crates' tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    FeatureType, LimitPeriod, LimitType, Plan, PlanChangeLog, PlanFeature, Subscription,
    UsageRecord, UserContact, UNLIMITED,
};
use crate::period::PeriodWindow;
use crate::resources::{ResourceCounter, ResourceKind};
use crate::store::{DueCursor, PlanChangeLogStore, PlanStore, SubscriptionStore, UsageStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn feature(plan_id: Uuid, code: &str, limit_type: LimitType, limit_value: i64) -> PlanFeature {
    let (feature_type, limit_period) = match (limit_type, code) {
        (LimitType::Count, "transactions_per_month") => {
            (Some(FeatureType::Consumable), Some(LimitPeriod::Monthly))
        }
        (LimitType::Count, _) => (Some(FeatureType::Resource), None),
        _ => (None, None),
    };
    PlanFeature {
        id: Uuid::new_v4(),
        plan_id,
        feature_code: code.to_string(),
        limit_type,
        limit_value,
        feature_type,
        limit_period,
    }
}

fn plan(code: &str, name: &str, price: i64, sort_order: i32, limits: &[(&str, i64)]) -> Plan {
    let id = Uuid::new_v4();
    let mut features: Vec<PlanFeature> = limits
        .iter()
        .map(|(feature_code, limit)| {
            if *limit == UNLIMITED {
                feature(id, feature_code, LimitType::Unlimited, UNLIMITED)
            } else {
                feature(id, feature_code, LimitType::Count, *limit)
            }
        })
        .collect();
    features.push(feature(
        id,
        "export_data",
        LimitType::Boolean,
        if price > 0 { 1 } else { 0 },
    ));

    Plan {
        id,
        code: code.to_string(),
        name: name.to_string(),
        description: None,
        price_monthly_cents: price,
        price_yearly_cents: (price > 0).then_some(price * 10),
        price_currency: "USD".to_string(),
        is_default: sort_order == 0,
        sort_order,
        is_active: true,
        features,
    }
}

/// The same free / pro / premium catalog the seed migration installs.
pub fn seed_catalog() -> Vec<Plan> {
    vec![
        plan(
            "free",
            "Free",
            0,
            0,
            &[
                ("accounts", 2),
                ("goals", 1),
                ("debts", 1),
                ("loans", 1),
                ("custom_categories", 5),
                ("recurring_payments", 3),
                ("transactions_per_month", 100),
            ],
        ),
        plan(
            "pro",
            "Pro",
            499,
            1,
            &[
                ("accounts", 10),
                ("goals", 5),
                ("debts", 5),
                ("loans", 5),
                ("custom_categories", 25),
                ("recurring_payments", 20),
                ("transactions_per_month", 1000),
            ],
        ),
        plan(
            "premium",
            "Premium",
            999,
            2,
            &[
                ("accounts", UNLIMITED),
                ("goals", UNLIMITED),
                ("debts", UNLIMITED),
                ("loans", UNLIMITED),
                ("custom_categories", UNLIMITED),
                ("recurring_payments", UNLIMITED),
                ("transactions_per_month", UNLIMITED),
            ],
        ),
    ]
}

/// In-memory billing store. Clones share state.
#[derive(Default, Clone)]
pub struct InMemoryBillingStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    plans: Mutex<Vec<Plan>>,
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    usage: Mutex<HashMap<(Uuid, String, OffsetDateTime), UsageRecord>>,
    change_logs: Mutex<Vec<PlanChangeLog>>,
    failing_saves: Mutex<HashSet<Uuid>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding [`seed_catalog`].
    pub fn with_default_catalog() -> Self {
        let store = Self::new();
        store.seed_plans(seed_catalog());
        store
    }

    pub fn seed_plans(&self, plans: Vec<Plan>) {
        let mut stored = lock(&self.inner.plans);
        stored.extend(plans);
        stored.sort_by_key(|p| p.sort_order);
    }

    pub fn plan(&self, code: &str) -> Option<Plan> {
        lock(&self.inner.plans).iter().find(|p| p.code == code).cloned()
    }

    /// Overwrite a subscription without the version check.
    pub fn put_subscription(&self, subscription: Subscription) {
        lock(&self.inner.subscriptions).insert(subscription.user_id, subscription);
    }

    pub fn subscription(&self, user_id: Uuid) -> Option<Subscription> {
        lock(&self.inner.subscriptions).get(&user_id).cloned()
    }

    /// Every change log entry for `user_id`, oldest first.
    pub fn change_logs(&self, user_id: Uuid) -> Vec<PlanChangeLog> {
        lock(&self.inner.change_logs)
            .iter()
            .filter(|log| log.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Make every later save for `user_id` fail with a database error.
    pub fn fail_saves_for(&self, user_id: Uuid) {
        lock(&self.inner.failing_saves).insert(user_id);
    }

    /// Simulate a concurrent writer by bumping the stored version.
    pub fn bump_version(&self, user_id: Uuid) {
        if let Some(sub) = lock(&self.inner.subscriptions).get_mut(&user_id) {
            sub.version += 1;
        }
    }

    pub fn usage_records(&self, user_id: Uuid, feature_code: &str) -> Vec<UsageRecord> {
        let mut records: Vec<UsageRecord> = lock(&self.inner.usage)
            .values()
            .filter(|r| r.user_id == user_id && r.feature_code == feature_code)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.period_start);
        records
    }
}

#[async_trait]
impl PlanStore for InMemoryBillingStore {
    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(lock(&self.inner.plans).clone())
    }

    async fn get_plan_by_code(&self, code: &str) -> BillingResult<Option<Plan>> {
        Ok(self.plan(code))
    }

    async fn get_plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(lock(&self.inner.plans).iter().find(|p| p.id == plan_id).cloned())
    }

    async fn get_default_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(lock(&self.inner.plans)
            .iter()
            .filter(|p| p.is_default)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn get_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.subscription(user_id))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<bool> {
        let mut subs = lock(&self.inner.subscriptions);
        if subs.contains_key(&subscription.user_id) {
            return Ok(false);
        }
        subs.insert(subscription.user_id, subscription.clone());
        Ok(true)
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        log: Option<&PlanChangeLog>,
    ) -> BillingResult<Subscription> {
        if lock(&self.inner.failing_saves).contains(&subscription.user_id) {
            return Err(BillingError::Database(format!(
                "simulated write failure for user {}",
                subscription.user_id
            )));
        }

        let mut subs = lock(&self.inner.subscriptions);
        let stored = subs
            .get_mut(&subscription.user_id)
            .filter(|stored| stored.version == subscription.version)
            .ok_or_else(|| {
                BillingError::ConcurrentModification(format!(
                    "Subscription for user {} was modified by another process. Please retry.",
                    subscription.user_id
                ))
            })?;

        let mut updated = subscription.clone();
        updated.version += 1;
        updated.updated_at = OffsetDateTime::now_utc();
        *stored = updated.clone();

        if let Some(entry) = log {
            lock(&self.inner.change_logs).push(entry.clone());
        }
        Ok(updated)
    }

    async fn list_due_scheduled_changes(
        &self,
        now: OffsetDateTime,
        after: Option<DueCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = lock(&self.inner.subscriptions)
            .values()
            .filter(|s| s.scheduled_plan_id.is_some())
            .filter(|s| s.scheduled_change_at.is_some_and(|at| at <= now))
            .filter(|s| after.map_or(true, |cursor| DueCursor::of(s) > Some(cursor)))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.scheduled_change_at, s.user_id));
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn list_grace_periods_ending(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = lock(&self.inner.subscriptions)
            .values()
            .filter(|s| s.grace_overages.is_some())
            .filter(|s| s.grace_period_end.is_some_and(|end| end > after && end <= until))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.grace_period_end);
        Ok(subs)
    }

    async fn list_expired_grace_periods(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = lock(&self.inner.subscriptions)
            .values()
            .filter(|s| s.grace_overages.is_some())
            .filter(|s| s.grace_period_end.is_some_and(|end| end <= now))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.grace_period_end);
        Ok(subs)
    }

    async fn list_subscriptions(
        &self,
        after_user_id: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = lock(&self.inner.subscriptions)
            .values()
            .filter(|s| after_user_id.is_none_or(|after| s.user_id > after))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.user_id);
        subs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(subs)
    }
}

#[async_trait]
impl UsageStore for InMemoryBillingStore {
    async fn get_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        period_start: OffsetDateTime,
    ) -> BillingResult<Option<UsageRecord>> {
        Ok(lock(&self.inner.usage)
            .get(&(user_id, feature_code.to_string(), period_start))
            .cloned())
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64> {
        let mut usage = lock(&self.inner.usage);
        let record = usage
            .entry((user_id, feature_code.to_string(), window.start))
            .or_insert_with(|| UsageRecord {
                id: Uuid::new_v4(),
                user_id,
                feature_code: feature_code.to_string(),
                period_type: window.period,
                period_start: window.start,
                period_end: window.end,
                count: 0,
            });
        record.count += amount;
        Ok(record.count)
    }

    async fn decrement_usage(
        &self,
        user_id: Uuid,
        feature_code: &str,
        window: &PeriodWindow,
        amount: i64,
    ) -> BillingResult<i64> {
        let mut usage = lock(&self.inner.usage);
        match usage.get_mut(&(user_id, feature_code.to_string(), window.start)) {
            Some(record) => {
                record.count = (record.count - amount).max(0);
                Ok(record.count)
            }
            None => Ok(0),
        }
    }

    async fn list_usage_history(
        &self,
        user_id: Uuid,
        feature_code: &str,
    ) -> BillingResult<Vec<UsageRecord>> {
        let mut records = self.usage_records(user_id, feature_code);
        records.reverse();
        Ok(records)
    }
}

#[async_trait]
impl PlanChangeLogStore for InMemoryBillingStore {
    async fn list_plan_changes(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<PlanChangeLog>> {
        let mut logs = self.change_logs(user_id);
        logs.reverse();
        logs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(logs)
    }
}

/// Resource counter answering from a fixed table (0 when unset).
#[derive(Default, Clone)]
pub struct FixedResourceCounter {
    counts: Arc<Mutex<HashMap<(Uuid, ResourceKind), i64>>>,
}

impl FixedResourceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: Uuid, kind: ResourceKind, count: i64) {
        lock(&self.counts).insert((user_id, kind), count);
    }
}

#[async_trait]
impl ResourceCounter for FixedResourceCounter {
    async fn count(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<i64> {
        Ok(lock(&self.counts).get(&(user_id, kind)).copied().unwrap_or(0))
    }
}

#[derive(Default, Clone)]
pub struct StaticUserDirectory {
    contacts: Arc<Mutex<HashMap<Uuid, UserContact>>>,
}

impl StaticUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, contact: UserContact) {
        lock(&self.contacts).insert(contact.user_id, contact);
    }
}

#[async_trait]
impl crate::directory::UserDirectory for StaticUserDirectory {
    async fn contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>> {
        Ok(lock(&self.contacts).get(&user_id).cloned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub template: String,
    pub recipient: String,
    pub variables: serde_json::Value,
}

/// Keeps every send for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        lock(&self.sent).clone()
    }

    pub fn count(&self, template: &str) -> usize {
        lock(&self.sent).iter().filter(|n| n.template == template).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_template(
        &self,
        template: &str,
        recipient: &str,
        variables: &serde_json::Value,
    ) -> BillingResult<()> {
        lock(&self.sent).push(SentNotification {
            template: template.to_string(),
            recipient: recipient.to_string(),
            variables: variables.clone(),
        });
        Ok(())
    }
}

/// Every send fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send_template(
        &self,
        template: &str,
        _recipient: &str,
        _variables: &serde_json::Value,
    ) -> BillingResult<()> {
        Err(BillingError::Notification(format!(
            "provider unavailable for '{}'",
            template
        )))
    }
}
