// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Fintrack API Library
//!
//! HTTP surface for the billing engine: identity layer, plan feature gate,
//! and the plan catalog, subscription, usage and admin routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod gate;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use gate::{feature_gate, FeatureRouteTable};
pub use routes::{create_router, create_router_with};
pub use state::AppState;
