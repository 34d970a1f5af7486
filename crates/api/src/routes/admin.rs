//! Operator routes: usage corrections and billing invariant checks

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use fintrack_billing::{InvariantCheckSummary, LimitPeriod};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct DecrementUsageRequest {
    pub feature_code: String,
    pub period: LimitPeriod,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct UsageCorrectionResponse {
    pub user_id: Uuid,
    pub feature_code: String,
    pub period: LimitPeriod,
    pub count: i64,
}

/// Correct a user's usage in the current window. Clamps at zero.
pub async fn decrement_usage(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<DecrementUsageRequest>,
) -> ApiResult<Json<UsageCorrectionResponse>> {
    if req.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }
    if req.feature_code.trim().is_empty() {
        return Err(ApiError::Validation("feature_code is required".to_string()));
    }

    let count = state
        .billing
        .usage
        .decrement_usage(user_id, &req.feature_code, req.period, req.amount)
        .await?;

    tracing::info!(
        admin_id = %admin.user_id,
        user_id = %user_id,
        feature_code = %req.feature_code,
        amount = req.amount,
        "Admin usage correction applied"
    );

    Ok(Json(UsageCorrectionResponse {
        user_id,
        feature_code: req.feature_code,
        period: req.period,
        count,
    }))
}

/// Run every billing invariant check and return the violations
pub async fn check_invariants(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.billing.invariants.run_all_checks().await?;

    if !summary.healthy {
        tracing::warn!(
            admin_id = %admin.user_id,
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }

    Ok(Json(summary))
}
