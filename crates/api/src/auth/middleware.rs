//! Identity middleware
//!
//! Authentication happens upstream. The gateway forwards the verified
//! identity as `x-user-*` headers and this layer turns them into an
//! [`AuthUser`] request extension.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use fintrack_billing::UserContact;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Authenticated user extracted from request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// Contact details for plan-change emails.
    pub fn contact(&self) -> UserContact {
        UserContact {
            user_id: self.user_id,
            email: self.email.clone(),
            name: self.name.clone(),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let raw_id = header_value(headers, USER_ID_HEADER).ok_or(AuthError::MissingIdentity)?;
        let user_id = Uuid::parse_str(raw_id).map_err(|_| AuthError::InvalidIdentity)?;
        let email = header_value(headers, USER_EMAIL_HEADER).unwrap_or_default().to_string();
        let name = header_value(headers, USER_NAME_HEADER)
            .map(String::from)
            .unwrap_or_else(|| email.clone());
        let role = header_value(headers, USER_ROLE_HEADER).unwrap_or("user").to_string();

        Ok(Self {
            user_id,
            email,
            name,
            role,
        })
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing user identity")]
    MissingIdentity,
    #[error("Invalid user identity")]
    InvalidIdentity,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            AuthError::MissingIdentity | AuthError::InvalidIdentity => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
            }
            AuthError::InsufficientPermissions => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        };

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
            "details": null,
        }));

        (status, body).into_response()
    }
}

/// Middleware that requires a forwarded user identity
pub async fn require_identity(mut request: Request, next: Next) -> Response {
    match AuthUser::from_headers(request.headers()) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %request.uri().path(),
                user_id = %auth_user.user_id,
                "require_identity: identity accepted"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "require_identity: rejected");
            e.into_response()
        }
    }
}

/// Middleware for operator-only routes. Must run after [`require_identity`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    let is_admin = request
        .extensions()
        .get::<AuthUser>()
        .map(AuthUser::is_admin)
        .unwrap_or(false);

    if !is_admin {
        tracing::warn!(path = %request.uri().path(), "require_admin: not an admin");
        return AuthError::InsufficientPermissions.into_response();
    }
    next.run(request).await
}
