//! Usage and feature access routes

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use fintrack_billing::{FeatureAccess, UsageReport};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UsageReport>> {
    let report = state.billing.access.get_user_usage(auth_user.user_id).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    /// Resource count to check against; the live count is used when absent.
    pub count: Option<i64>,
}

/// Read-only access check, for clients that want to grey out actions
pub async fn check_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(feature_code): Path<String>,
    Query(query): Query<AccessQuery>,
) -> ApiResult<Json<FeatureAccess>> {
    if query.count.is_some_and(|c| c < 0) {
        return Err(ApiError::Validation("count must not be negative".to_string()));
    }

    let access = &state.billing.access;
    let count = match query.count {
        Some(count) => Some(count),
        None => {
            access
                .live_resource_count(auth_user.user_id, &feature_code)
                .await?
        }
    };

    let result = access
        .check_feature_access(auth_user.user_id, &feature_code, count)
        .await?;
    Ok(Json(result))
}
