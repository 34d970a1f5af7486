//! API error type and HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fintrack_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub details: serde_json::Value,
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::FeatureNotAvailable { .. } | BillingError::FeatureLimitExceeded { .. } => {
            StatusCode::FORBIDDEN
        }
        BillingError::NoSubscription(_) | BillingError::PlanNotFound(_) => StatusCode::NOT_FOUND,
        BillingError::AlreadyOnPlan(_)
        | BillingError::NotAnUpgrade { .. }
        | BillingError::NotADowngrade { .. }
        | BillingError::CannotCancelFreePlan(_)
        | BillingError::NoPendingCancellation
        | BillingError::NoScheduledChange => StatusCode::BAD_REQUEST,
        BillingError::SubscriptionAlreadyCancelled { .. }
        | BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
        BillingError::Misconfiguration(_)
        | BillingError::Database(_)
        | BillingError::Notification(_)
        | BillingError::Config(_)
        | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(err) => billing_status(err),
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Unauthorized => ErrorBody {
                error: "UNAUTHORIZED",
                message: self.to_string(),
                details: serde_json::Value::Null,
            },
            ApiError::Validation(message) => ErrorBody {
                error: "VALIDATION_ERROR",
                message: message.clone(),
                details: serde_json::Value::Null,
            },
            ApiError::Billing(err) if err.is_business_error() => ErrorBody {
                error: err.code(),
                message: err.to_string(),
                details: err.details(),
            },
            ApiError::Billing(BillingError::ConcurrentModification(_)) => ErrorBody {
                error: "CONCURRENT_MODIFICATION",
                message: "The subscription was changed by another request, please retry"
                    .to_string(),
                details: serde_json::Value::Null,
            },
            ApiError::Billing(_) => ErrorBody {
                error: "INTERNAL_ERROR",
                message: "Internal server error".to_string(),
                details: serde_json::Value::Null,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(self.body())).into_response()
    }
}
