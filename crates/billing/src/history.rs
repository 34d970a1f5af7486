//! Plan change log entries and history views

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{ChangeType, Overage, PlanChangeLog};
use crate::plans::PlanCatalog;

/// Default and maximum page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// Builder for a [`PlanChangeLog`] entry.
pub struct PlanChangeLogBuilder {
    entry: PlanChangeLog,
}

impl PlanChangeLogBuilder {
    pub fn new(user_id: Uuid, change_type: ChangeType, requested_at: OffsetDateTime) -> Self {
        Self {
            entry: PlanChangeLog {
                id: Uuid::new_v4(),
                user_id,
                from_plan_id: None,
                to_plan_id: None,
                change_type,
                requested_at,
                effective_at: None,
                scheduled_for: None,
                proration_amount_cents: None,
                reason: None,
                metadata: serde_json::json!({}),
            },
        }
    }

    pub fn plans(mut self, from: Uuid, to: Uuid) -> Self {
        self.entry.from_plan_id = Some(from);
        self.entry.to_plan_id = Some(to);
        self
    }

    /// Immediate transition.
    pub fn effective_at(mut self, at: OffsetDateTime) -> Self {
        self.entry.effective_at = Some(at);
        self
    }

    /// Deferred transition.
    pub fn scheduled_for(mut self, at: OffsetDateTime) -> Self {
        self.entry.scheduled_for = Some(at);
        self
    }

    pub fn proration(mut self, amount_cents: i64) -> Self {
        self.entry.proration_amount_cents = Some(amount_cents);
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.entry.reason = reason;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.entry.metadata = metadata;
        self
    }

    /// Records the overage snapshot and grace end under `metadata`.
    pub fn overages(mut self, overages: &[Overage], grace_period_end: Option<OffsetDateTime>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.entry.metadata {
            map.insert("overages".to_string(), serde_json::json!(overages));
            map.insert(
                "grace_period_end".to_string(),
                serde_json::json!(grace_period_end.map(|end| end.unix_timestamp())),
            );
        }
        self
    }

    pub fn build(self) -> PlanChangeLog {
        self.entry
    }
}

/// One history row with plan codes resolved.
#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeEntry {
    pub id: Uuid,
    pub change_type: ChangeType,
    pub from_plan: Option<String>,
    pub to_plan: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scheduled_for: Option<OffsetDateTime>,
    pub proration_amount_cents: Option<i64>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

async fn plan_code(catalog: &PlanCatalog, plan_id: Option<Uuid>) -> Option<String> {
    let plan_id = plan_id?;
    match catalog.get_by_id(plan_id).await {
        Ok(plan) => Some(plan.code),
        Err(e) => {
            tracing::warn!(plan_id = %plan_id, error = %e, "History references an unknown plan");
            None
        }
    }
}

pub async fn resolve_entries(
    catalog: &PlanCatalog,
    logs: Vec<PlanChangeLog>,
) -> Vec<PlanChangeEntry> {
    let mut entries = Vec::with_capacity(logs.len());
    for log in logs {
        entries.push(PlanChangeEntry {
            id: log.id,
            change_type: log.change_type,
            from_plan: plan_code(catalog, log.from_plan_id).await,
            to_plan: plan_code(catalog, log.to_plan_id).await,
            requested_at: log.requested_at,
            effective_at: log.effective_at,
            scheduled_for: log.scheduled_for,
            proration_amount_cents: log.proration_amount_cents,
            reason: log.reason,
            metadata: log.metadata,
        });
    }
    entries
}
