//! Subscription and plan change routes

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use fintrack_billing::{PlanChangeEntry, PlanChangePreview, PlanChangeResult, SubscriptionOverview};
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_code: String,
}

impl PlanChangeRequest {
    fn plan_code(&self) -> ApiResult<&str> {
        let code = self.plan_code.trim();
        if code.is_empty() {
            return Err(ApiError::Validation("plan_code is required".to_string()));
        }
        Ok(code)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionOverview>> {
    let overview = state
        .billing
        .subscriptions
        .get_subscription_overview(auth_user.user_id)
        .await?;
    Ok(Json(overview))
}

/// Put a new user on the default plan. Safe to call repeatedly.
pub async fn provision_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionOverview>> {
    let subscriptions = &state.billing.subscriptions;
    subscriptions.provision_default(auth_user.user_id).await?;
    let overview = subscriptions
        .get_subscription_overview(auth_user.user_id)
        .await?;
    Ok(Json(overview))
}

pub async fn preview_plan_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangePreview>> {
    let preview = state
        .billing
        .subscriptions
        .preview_plan_change(auth_user.user_id, req.plan_code()?)
        .await?;
    Ok(Json(preview))
}

pub async fn upgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .subscriptions
        .upgrade_plan(&auth_user.contact(), req.plan_code()?)
        .await?;
    Ok(Json(result))
}

pub async fn downgrade_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .subscriptions
        .downgrade_plan(&auth_user.contact(), req.plan_code()?)
        .await?;
    Ok(Json(result))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .subscriptions
        .cancel_subscription(&auth_user.contact(), req.reason)
        .await?;
    Ok(Json(result))
}

pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .subscriptions
        .reactivate_subscription(&auth_user.contact())
        .await?;
    Ok(Json(result))
}

/// Drop a pending downgrade. Pending cancellations go through reactivate.
pub async fn cancel_scheduled_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionOverview>> {
    let overview = state
        .billing
        .subscriptions
        .cancel_scheduled_change(auth_user.user_id)
        .await?;
    Ok(Json(overview))
}

pub async fn get_plan_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<PlanChangeEntry>>> {
    let history = state
        .billing
        .subscriptions
        .get_plan_history(auth_user.user_id, query.limit)
        .await?;
    Ok(Json(history))
}
