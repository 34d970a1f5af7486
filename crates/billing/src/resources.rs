//! Resource counting collaborator
//!
//! RESOURCE features count rows that live in other modules (accounts, goals,
//! ...). The engine sees them only through [`ResourceCounter`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Accounts,
    Goals,
    Debts,
    Loans,
    CustomCategories,
    RecurringPayments,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Accounts,
        ResourceKind::Goals,
        ResourceKind::Debts,
        ResourceKind::Loans,
        ResourceKind::CustomCategories,
        ResourceKind::RecurringPayments,
    ];

    /// The feature code gating this kind of resource.
    pub fn feature_code(&self) -> &'static str {
        match self {
            ResourceKind::Accounts => "accounts",
            ResourceKind::Goals => "goals",
            ResourceKind::Debts => "debts",
            ResourceKind::Loans => "loans",
            ResourceKind::CustomCategories => "custom_categories",
            ResourceKind::RecurringPayments => "recurring_payments",
        }
    }

    pub fn from_feature_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.feature_code() == code)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.feature_code())
    }
}

impl FromStr for ResourceKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_feature_code(s)
            .ok_or_else(|| BillingError::Internal(format!("Unknown resource kind '{}'", s)))
    }
}

/// Live count of a user's resources of one kind.
#[async_trait]
pub trait ResourceCounter: Send + Sync {
    async fn count(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<i64>;
}

/// Counter used until the resource modules report real counts.
///
/// Always answers 0, which makes downgrade overage detection a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroResourceCounter;

#[async_trait]
impl ResourceCounter for ZeroResourceCounter {
    async fn count(&self, user_id: Uuid, kind: ResourceKind) -> BillingResult<i64> {
        tracing::debug!(
            user_id = %user_id,
            resource = %kind,
            "No resource counter wired for this kind, reporting 0"
        );
        Ok(0)
    }
}
