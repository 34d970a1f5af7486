//! API routes

pub mod admin;
pub mod plans;
pub mod subscription;
pub mod usage;

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_identity},
    gate::feature_gate,
    state::AppState,
};

/// Router with the billing routes only
pub fn create_router(state: AppState) -> Router {
    create_router_with(state, Router::new())
}

/// Router with the billing routes plus `app_routes`.
///
/// `app_routes` sit behind the identity layer and the feature gate, so any
/// of them listed in the state's route table are limited by plan.
pub fn create_router_with(state: AppState, app_routes: Router<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/plans", get(plans::list_plans));

    let admin = Router::new()
        .route(
            "/api/v1/admin/usage/{user_id}/decrement",
            post(admin::decrement_usage),
        )
        .route("/api/v1/admin/billing/invariants", get(admin::check_invariants))
        .route_layer(middleware::from_fn(require_admin));

    let protected = Router::new()
        .route("/api/v1/subscription", get(subscription::get_subscription))
        .route(
            "/api/v1/subscription/provision",
            post(subscription::provision_subscription),
        )
        .route(
            "/api/v1/subscription/preview",
            post(subscription::preview_plan_change),
        )
        .route("/api/v1/subscription/upgrade", post(subscription::upgrade_plan))
        .route("/api/v1/subscription/downgrade", post(subscription::downgrade_plan))
        .route("/api/v1/subscription/cancel", post(subscription::cancel_subscription))
        .route(
            "/api/v1/subscription/reactivate",
            post(subscription::reactivate_subscription),
        )
        .route(
            "/api/v1/subscription/scheduled-change",
            delete(subscription::cancel_scheduled_change),
        )
        .route("/api/v1/subscription/history", get(subscription::get_plan_history))
        .route("/api/v1/usage", get(usage::get_usage))
        .route(
            "/api/v1/features/{feature_code}/access",
            get(usage::check_access),
        )
        .merge(admin)
        .merge(app_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), feature_gate))
        .route_layer(middleware::from_fn(require_identity));

    public.merge(protected).with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
