// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors wire several collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Fintrack Billing Module
//!
//! Subscription entitlements and plan changes for the personal-finance app.
//!
//! ## Features
//!
//! - **Plan Catalog**: Plans and per-feature limits, cached with a TTL
//! - **Feature Access**: Allow/deny decisions for BOOLEAN, COUNT and UNLIMITED limits
//! - **Usage Tracking**: Period-bucketed counters for consumable features
//! - **Plan Changes**: Immediate upgrades with proration estimates, downgrades
//!   and cancellations deferred to period end
//! - **Grace Periods**: Soft limits stay usable for a while after a downgrade
//! - **Scheduled Jobs**: Apply due changes, warn and expire grace periods
//! - **Email Notifications**: Upgrade, downgrade, cancellation and grace emails
//! - **Audit Log**: Append-only history of every plan transition

pub mod cache;
pub mod config;
pub mod directory;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod history;
pub mod invariants;
pub mod models;
pub mod overage;
pub mod period;
pub mod plans;
pub mod postgres;
pub mod proration;
pub mod resources;
pub mod scheduled;
pub mod store;
pub mod subscriptions;
pub mod usage;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


// Config
pub use config::BillingConfig;

// Directory
pub use directory::{PgUserDirectory, UserDirectory};

// Email
pub use email::{EmailConfig, Notification, NotificationDispatcher, Notifier};

// Entitlement
pub use entitlement::{AccessDenialReason, FeatureAccess, FeatureAccessChecker};

// Error
pub use error::{BillingError, BillingResult};

// History
pub use history::PlanChangeEntry;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    ChangeType, FeatureType, LimitPeriod, LimitType, Overage, Plan, PlanChangeLog, PlanFeature,
    Subscription, SubscriptionStatus, UsageRecord, UserContact, UNLIMITED,
};

// Overage
pub use overage::OverageDetector;

// Period
pub use period::PeriodWindow;

// Plans
pub use plans::PlanCatalog;

// Postgres
pub use postgres::{create_pool, run_migrations, PgBillingStore};

// Proration
pub use proration::ProrationEstimate;

// Resources
pub use resources::{ResourceCounter, ResourceKind, ZeroResourceCounter};

// Scheduled
pub use scheduled::{
    ApplySummary, GracePeriodResult, GraceSummary, ScheduledChangeProcessor, ScheduledChangeResult,
};

// Store
pub use store::{BillingStore, DueCursor};

// Subscriptions
pub use subscriptions::{
    PlanChangeKind, PlanChangePreview, PlanChangeResult, SubscriptionOverview, SubscriptionService,
};

// Usage
pub use usage::{FeatureUsage, UsageCounter, UsageReport};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub usage: UsageCounter,
    pub access: FeatureAccessChecker,
    pub subscriptions: SubscriptionService,
    pub scheduled: ScheduledChangeProcessor,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let notifier = EmailConfig::from_env().build_notifier();

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool.clone())),
            Arc::new(ZeroResourceCounter),
            Arc::new(PgUserDirectory::new(pool)),
            notifier,
            config,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        resources: Arc<dyn ResourceCounter>,
        directory: Arc<dyn UserDirectory>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> Self {
        let catalog = PlanCatalog::new(store.clone(), &config);
        let usage = UsageCounter::new(store.clone());
        let overages = OverageDetector::new(resources.clone(), config.clone());
        let notifications = NotificationDispatcher::new(notifier, config.notification_timeout);

        Self {
            access: FeatureAccessChecker::new(store.clone(), catalog.clone(), usage.clone(), resources),
            subscriptions: SubscriptionService::new(
                store.clone(),
                catalog.clone(),
                overages.clone(),
                notifications.clone(),
                config.clone(),
            ),
            scheduled: ScheduledChangeProcessor::new(
                store.clone(),
                catalog.clone(),
                overages,
                directory,
                notifications,
                config,
            ),
            invariants: InvariantChecker::new(store),
            catalog,
            usage,
        }
    }
}
