//! Plan catalog routes

use axum::{extract::State, Json};
use fintrack_billing::Plan;

use crate::{error::ApiResult, state::AppState};

/// Active plans with their features, cheapest first
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    let plans = state.billing.catalog.list_plans().await?;
    Ok(Json(plans))
}
