//! Feature gate
//!
//! A route table maps (method, matched route) to the plan feature the
//! route consumes. [`feature_gate`] checks access before the handler runs
//! and records CONSUMABLE usage after it succeeds. Routes not in the table
//! pass through untouched.

use std::collections::HashMap;

use axum::{
    extract::{MatchedPath, Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use fintrack_billing::LimitPeriod;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default)]
pub struct FeatureRouteTable {
    routes: HashMap<(Method, String), String>,
}

impl FeatureRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `path` is the route as registered, e.g. `/api/v1/goals/{goal_id}/contributions`.
    pub fn route(mut self, method: Method, path: &str, feature_code: &str) -> Self {
        self.routes
            .insert((method, path.to_string()), feature_code.to_string());
        self
    }

    pub fn feature_for(&self, method: &Method, path: &str) -> Option<&str> {
        self.routes
            .get(&(method.clone(), path.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Creation routes of the finance modules and the features they count against.
    pub fn fintrack_defaults() -> Self {
        Self::new()
            .route(Method::POST, "/api/v1/accounts", "accounts")
            .route(Method::POST, "/api/v1/goals", "goals")
            .route(Method::POST, "/api/v1/debts", "debts")
            .route(Method::POST, "/api/v1/loans", "loans")
            .route(Method::POST, "/api/v1/categories", "custom_categories")
            .route(Method::POST, "/api/v1/recurring-payments", "recurring_payments")
            .route(Method::POST, "/api/v1/transactions", "transactions_per_month")
            .route(Method::GET, "/api/v1/export", "export_data")
    }
}

/// Middleware enforcing plan limits on routes listed in the feature table.
/// Must run after `require_identity`.
pub async fn feature_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let feature_code = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|matched| {
            state
                .feature_routes
                .feature_for(request.method(), matched.as_str())
        })
        .map(String::from);

    let Some(feature_code) = feature_code else {
        return next.run(request).await;
    };

    let Some(user_id) = request.extensions().get::<AuthUser>().map(|u| u.user_id) else {
        return ApiError::Unauthorized.into_response();
    };

    let consumable_period = match authorize(&state, user_id, &feature_code).await {
        Ok(period) => period,
        Err(e) => return e.into_response(),
    };

    let response = next.run(request).await;

    if let Some(period) = consumable_period {
        if response.status().is_success() {
            if let Err(e) = state
                .billing
                .usage
                .increment_usage(user_id, &feature_code, period, 1)
                .await
            {
                tracing::warn!(
                    user_id = %user_id,
                    feature_code = %feature_code,
                    error = %e,
                    "Failed to record usage after successful request"
                );
            }
        }
    }

    response
}

/// Returns the period to record usage in when the feature is CONSUMABLE.
async fn authorize(
    state: &AppState,
    user_id: Uuid,
    feature_code: &str,
) -> ApiResult<Option<LimitPeriod>> {
    let access = &state.billing.access;
    let feature = access.plan_feature(user_id, feature_code).await?;

    let resource_count = match &feature {
        Some(f) if f.is_resource_count() => access.live_resource_count(user_id, feature_code).await?,
        _ => None,
    };

    access
        .check_feature_access(user_id, feature_code, resource_count)
        .await?
        .into_result(feature_code)?;

    Ok(feature
        .filter(|f| f.is_consumable_count())
        .and_then(|f| f.limit_period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_lookup_is_by_method_and_path() {
        let table = FeatureRouteTable::fintrack_defaults();
        assert_eq!(
            table.feature_for(&Method::POST, "/api/v1/accounts"),
            Some("accounts")
        );
        assert_eq!(table.feature_for(&Method::GET, "/api/v1/accounts"), None);
        assert_eq!(
            table.feature_for(&Method::GET, "/api/v1/export"),
            Some("export_data")
        );
        assert!(!table.is_empty());
    }
}
