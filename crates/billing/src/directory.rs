//! Contact lookup for notifications sent outside a request

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::UserContact;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Email and display name for `user_id`, if the user still exists.
    async fn contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>>;
}

/// Reads contacts from the identity service's `users` table.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn contact(&self, user_id: Uuid) -> BillingResult<Option<UserContact>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT email, name
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(email, name)| UserContact {
            user_id,
            name: name.unwrap_or_else(|| email.clone()),
            email,
        }))
    }
}
