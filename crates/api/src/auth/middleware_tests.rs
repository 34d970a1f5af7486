//! Unit tests for the identity middleware
//!
//! Tests cover:
//! - Header parsing (required id, optional email/name/role)
//! - Rejection of missing and malformed identities
//! - Admin-only routes

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::super::middleware::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn app() -> Router {
        let admin = Router::new()
            .route("/admin", get(|| async { "ok" }))
            .route_layer(middleware::from_fn(require_admin));

        Router::new()
            .route(
                "/me",
                get(|Extension(user): Extension<AuthUser>| async move { user.user_id.to_string() }),
            )
            .merge(admin)
            .route_layer(middleware::from_fn(require_identity))
    }

    #[test]
    fn test_full_identity() {
        let user_id = Uuid::new_v4();
        let user = AuthUser::from_headers(&headers(&[
            (USER_ID_HEADER, &user_id.to_string()),
            (USER_EMAIL_HEADER, "ana@example.com"),
            (USER_NAME_HEADER, "Ana"),
        ]))
        .unwrap();

        assert_eq!(user.user_id, user_id);
        assert_eq!(user.contact().name, "Ana");
        assert_eq!(user.role, "user");
        assert!(!user.is_admin());
    }

    #[test]
    fn test_name_falls_back_to_email() {
        let user = AuthUser::from_headers(&headers(&[
            (USER_ID_HEADER, &Uuid::new_v4().to_string()),
            (USER_EMAIL_HEADER, "ana@example.com"),
        ]))
        .unwrap();
        assert_eq!(user.name, "ana@example.com");
    }

    #[test]
    fn test_missing_or_malformed_id() {
        assert!(matches!(
            AuthUser::from_headers(&headers(&[(USER_EMAIL_HEADER, "ana@example.com")])),
            Err(AuthError::MissingIdentity)
        ));
        assert!(matches!(
            AuthUser::from_headers(&headers(&[(USER_ID_HEADER, "   ")])),
            Err(AuthError::MissingIdentity)
        ));
        assert!(matches!(
            AuthUser::from_headers(&headers(&[(USER_ID_HEADER, "user-42")])),
            Err(AuthError::InvalidIdentity)
        ));
    }

    #[tokio::test]
    async fn test_identity_reaches_handler() {
        let user_id = Uuid::new_v4();
        let request = Request::builder()
            .uri("/me")
            .header(USER_ID_HEADER, user_id.to_string())
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes, user_id.to_string().as_bytes());
    }

    #[tokio::test]
    async fn test_admin_route() {
        let user_id = Uuid::new_v4().to_string();

        let request = Request::builder()
            .uri("/admin")
            .header(USER_ID_HEADER, &user_id)
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .uri("/admin")
            .header(USER_ID_HEADER, &user_id)
            .header(USER_ROLE_HEADER, "admin")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder().uri("/admin").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
