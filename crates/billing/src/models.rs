//! Domain model: plans, features, subscriptions, usage, change log

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Sentinel limit value for UNLIMITED features.
pub const UNLIMITED: i64 = -1;

/// Overages keyed by feature code.
pub type GraceOverages = BTreeMap<String, i64>;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Internal(format!(
                        "Unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    Boolean,
    Count,
    Unlimited,
}

string_enum!(LimitType {
    Boolean => "BOOLEAN",
    Count => "COUNT",
    Unlimited => "UNLIMITED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    /// Usage is the live count of some other table.
    Resource,
    /// Usage is a period-bound counter that never decreases on deletion.
    Consumable,
}

string_enum!(FeatureType {
    Resource => "RESOURCE",
    Consumable => "CONSUMABLE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

string_enum!(LimitPeriod {
    Daily => "DAILY",
    Weekly => "WEEKLY",
    Monthly => "MONTHLY",
    Yearly => "YEARLY",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanFeature {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub feature_code: String,
    pub limit_type: LimitType,
    /// 0/1 for BOOLEAN, -1 for UNLIMITED, positive cap for COUNT.
    pub limit_value: i64,
    /// Only meaningful for COUNT.
    pub feature_type: Option<FeatureType>,
    /// Only meaningful for CONSUMABLE COUNT.
    pub limit_period: Option<LimitPeriod>,
}

impl PlanFeature {
    pub fn is_resource_count(&self) -> bool {
        self.limit_type == LimitType::Count && self.feature_type == Some(FeatureType::Resource)
    }

    pub fn is_consumable_count(&self) -> bool {
        self.limit_type == LimitType::Count && self.feature_type == Some(FeatureType::Consumable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub price_monthly_cents: i64,
    pub price_yearly_cents: Option<i64>,
    pub price_currency: String,
    pub is_default: bool,
    /// Total order used to classify upgrade vs downgrade.
    pub sort_order: i32,
    pub is_active: bool,
    pub features: Vec<PlanFeature>,
}

impl Plan {
    pub fn feature(&self, feature_code: &str) -> Option<&PlanFeature> {
        self.features.iter().find(|f| f.feature_code == feature_code)
    }

    pub fn resource_features(&self) -> impl Iterator<Item = &PlanFeature> {
        self.features.iter().filter(|f| f.is_resource_count())
    }

    /// Formatted monthly price, e.g. "$4.99" or "EUR 4.99".
    pub fn formatted_monthly_price(&self) -> String {
        format_price(self.price_monthly_cents, &self.price_currency)
    }
}

pub fn format_price(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    let amount = format!("{}.{:02}", abs / 100, abs % 100);
    match currency.to_uppercase().as_str() {
        "USD" => format!("{}${}", sign, amount),
        other => format!("{}{} {}", sign, other, amount),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

string_enum!(SubscriptionStatus {
    Active => "ACTIVE",
    Trialing => "TRIALING",
    PastDue => "PAST_DUE",
    Canceled => "CANCELED",
});

/// The authoritative per-user subscription record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    /// None for the free/no-billing plan.
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub scheduled_plan_id: Option<Uuid>,
    pub scheduled_change_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    pub grace_overages: Option<GraceOverages>,
    pub grace_period_end: Option<OffsetDateTime>,
    /// Optimistic lock; bumped by every successful write.
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// A fresh subscription on the default plan with no billing period end.
    pub fn new_default(user_id: Uuid, default_plan_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            plan_id: default_plan_id,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: None,
            trial_start: None,
            trial_end: None,
            scheduled_plan_id: None,
            scheduled_change_at: None,
            cancelled_at: None,
            cancel_reason: None,
            grace_overages: None,
            grace_period_end: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_scheduled_change(&self) -> bool {
        self.scheduled_plan_id.is_some()
    }

    pub fn is_cancellation_pending(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn schedule_change(&mut self, plan_id: Uuid, at: OffsetDateTime) {
        self.scheduled_plan_id = Some(plan_id);
        self.scheduled_change_at = Some(at);
    }

    /// Clears the scheduled change together with any cancellation marker.
    pub fn clear_scheduled_change(&mut self) {
        self.scheduled_plan_id = None;
        self.scheduled_change_at = None;
        self.cancelled_at = None;
        self.cancel_reason = None;
    }

    /// Sets or clears grace state; both fields always move together.
    pub fn set_grace(&mut self, grace: Option<(GraceOverages, OffsetDateTime)>) {
        match grace {
            Some((overages, end)) if !overages.is_empty() => {
                self.grace_overages = Some(overages);
                self.grace_period_end = Some(end);
            }
            _ => self.clear_grace(),
        }
    }

    /// Grace computed for a scheduled change that has not been applied yet.
    ///
    /// Provisional grace always ends after the change it belongs to, while
    /// grace left by an applied downgrade ends before the next period end.
    pub fn has_provisional_grace(&self) -> bool {
        match (self.grace_period_end, self.scheduled_change_at) {
            (Some(end), Some(at)) => end >= at,
            _ => false,
        }
    }

    pub fn clear_grace(&mut self) {
        self.grace_overages = None;
        self.grace_period_end = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub feature_code: String,
    pub period_type: LimitPeriod,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Upgrade,
    DowngradeScheduled,
    DowngradeApplied,
    Cancellation,
    CancellationApplied,
    Reactivation,
}

string_enum!(ChangeType {
    Upgrade => "UPGRADE",
    DowngradeScheduled => "DOWNGRADE_SCHEDULED",
    DowngradeApplied => "DOWNGRADE_APPLIED",
    Cancellation => "CANCELLATION",
    CancellationApplied => "CANCELLATION_APPLIED",
    Reactivation => "REACTIVATION",
});

/// Append-only audit entry for a subscription transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanChangeLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub change_type: ChangeType,
    pub requested_at: OffsetDateTime,
    /// Set for immediate transitions.
    pub effective_at: Option<OffsetDateTime>,
    /// Set for deferred transitions.
    pub scheduled_for: Option<OffsetDateTime>,
    pub proration_amount_cents: Option<i64>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// A detected resource overage against a target plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Overage {
    pub feature_code: String,
    pub current: i64,
    pub new_limit: i64,
    pub overage: i64,
    pub has_grace_period: bool,
}

/// Identity supplied by the caller; the core does not authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserContact {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
}
