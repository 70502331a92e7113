use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Account;
use crate::error::{AppError, AppResult};

/// Repository for owning accounts (`accounts` table).
pub struct AccountRepository;

impl AccountRepository {
    pub async fn create(
        pool: &SqlitePool,
        user_id: &str,
        email: &str,
        access_token: &str,
        refresh_token: &str,
        token_expires_at: NaiveDateTime,
    ) -> AppResult<Account> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (
                id, user_id, email, access_token, refresh_token,
                token_expires_at, is_active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(email)
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_at)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(account)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(account)
    }

    /// Persist rotated OAuth tokens after a refresh.
    pub async fn update_tokens(
        pool: &SqlitePool,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        token_expires_at: NaiveDateTime,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = ?, refresh_token = ?, token_expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_at)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }
}
