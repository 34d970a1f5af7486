//! Billing error taxonomy
//!
//! Business errors carry the context a caller needs to render an actionable
//! message (current usage and limit, plan codes). Infrastructure errors are
//! kept separate so the HTTP layer can hide their details.

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Feature '{feature_code}' is not available on the current plan")]
    FeatureNotAvailable { feature_code: String },

    #[error("Feature '{feature_code}' limit reached ({current}/{limit})")]
    FeatureLimitExceeded {
        feature_code: String,
        current: i64,
        limit: i64,
    },

    #[error("No subscription found for user {0}")]
    NoSubscription(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Already on plan '{0}'")]
    AlreadyOnPlan(String),

    #[error("Changing from '{current}' to '{target}' is not an upgrade")]
    NotAnUpgrade { current: String, target: String },

    #[error("Changing from '{current}' to '{target}' is not a downgrade")]
    NotADowngrade { current: String, target: String },

    #[error("The free plan '{0}' cannot be cancelled")]
    CannotCancelFreePlan(String),

    #[error("Subscription is already cancelled (effective {effective_at})")]
    SubscriptionAlreadyCancelled { effective_at: String },

    #[error("Subscription has no pending cancellation")]
    NoPendingCancellation,

    #[error("Subscription has no scheduled plan change")]
    NoScheduledChange,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Seed-data invariant violated (for example no default plan).
    #[error("Billing misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code shared with API clients.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::FeatureNotAvailable { .. } => "FEATURE_NOT_AVAILABLE",
            BillingError::FeatureLimitExceeded { .. } => "FEATURE_LIMIT_EXCEEDED",
            BillingError::NoSubscription(_) => "NO_SUBSCRIPTION",
            BillingError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            BillingError::AlreadyOnPlan(_) => "ALREADY_ON_PLAN",
            BillingError::NotAnUpgrade { .. } => "NOT_AN_UPGRADE",
            BillingError::NotADowngrade { .. } => "NOT_A_DOWNGRADE",
            BillingError::CannotCancelFreePlan(_) => "CANNOT_CANCEL_FREE_PLAN",
            BillingError::SubscriptionAlreadyCancelled { .. } => "SUBSCRIPTION_ALREADY_CANCELLED",
            BillingError::NoPendingCancellation => "NO_PENDING_CANCELLATION",
            BillingError::NoScheduledChange => "NO_SCHEDULED_CHANGE",
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::Misconfiguration(_) => "INTERNAL_ERROR",
            BillingError::Database(_) => "INTERNAL_ERROR",
            BillingError::Notification(_) => "INTERNAL_ERROR",
            BillingError::Config(_) => "INTERNAL_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for user-facing business rule violations (as opposed to
    /// infrastructure failures).
    pub fn is_business_error(&self) -> bool {
        !matches!(
            self,
            BillingError::ConcurrentModification(_)
                | BillingError::Misconfiguration(_)
                | BillingError::Database(_)
                | BillingError::Notification(_)
                | BillingError::Config(_)
                | BillingError::Internal(_)
        )
    }

    /// Structured context for the error body.
    pub fn details(&self) -> serde_json::Value {
        match self {
            BillingError::FeatureNotAvailable { feature_code } => {
                serde_json::json!({ "feature_code": feature_code })
            }
            BillingError::FeatureLimitExceeded {
                feature_code,
                current,
                limit,
            } => serde_json::json!({
                "feature_code": feature_code,
                "current": current,
                "limit": limit,
            }),
            BillingError::PlanNotFound(code) => serde_json::json!({ "plan_code": code }),
            BillingError::AlreadyOnPlan(code) => serde_json::json!({ "plan_code": code }),
            BillingError::NotAnUpgrade { current, target }
            | BillingError::NotADowngrade { current, target } => serde_json::json!({
                "current_plan": current,
                "target_plan": target,
            }),
            BillingError::CannotCancelFreePlan(code) => serde_json::json!({ "plan_code": code }),
            BillingError::SubscriptionAlreadyCancelled { effective_at } => {
                serde_json::json!({ "effective_at": effective_at })
            }
            _ => serde_json::Value::Null,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BillingError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        BillingError::Database(format!("Migration failed: {}", err))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("Serialization failed: {}", err))
    }
}
