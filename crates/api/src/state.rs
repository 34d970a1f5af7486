//! Application state

use std::sync::Arc;

use fintrack_billing::BillingService;

use crate::gate::FeatureRouteTable;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Routes that require a plan feature, consulted by the feature gate
    pub feature_routes: Arc<FeatureRouteTable>,
}

impl AppState {
    pub fn new(billing: BillingService, feature_routes: FeatureRouteTable) -> Self {
        Self {
            billing: Arc::new(billing),
            feature_routes: Arc::new(feature_routes),
        }
    }
}
