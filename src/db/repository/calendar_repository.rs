use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Calendar;
use crate::error::{AppError, AppResult};

/// Repository for sync units (`calendars` table).
pub struct CalendarRepository;

impl CalendarRepository {
    pub async fn create(
        pool: &SqlitePool,
        account_id: &str,
        remote_calendar_id: &str,
    ) -> AppResult<Calendar> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let calendar = sqlx::query_as::<_, Calendar>(
            r#"
            INSERT INTO calendars (
                id, account_id, remote_calendar_id, enabled,
                cleanup_pending, cleanup_requested_at, webhook_channel_id,
                created_at, updated_at
            )
            VALUES (?, ?, ?, 1, 0, NULL, NULL, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(account_id)
        .bind(remote_calendar_id)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(calendar)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Calendar>> {
        let calendar = sqlx::query_as::<_, Calendar>("SELECT * FROM calendars WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(calendar)
    }

    /// Map a Google push notification channel back to its calendar.
    pub async fn find_by_webhook_channel(
        pool: &SqlitePool,
        channel_id: &str,
    ) -> AppResult<Option<Calendar>> {
        let calendar =
            sqlx::query_as::<_, Calendar>("SELECT * FROM calendars WHERE webhook_channel_id = ?")
                .bind(channel_id)
                .fetch_optional(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(calendar)
    }

    pub async fn set_webhook_channel(
        pool: &SqlitePool,
        id: &str,
        channel_id: Option<&str>,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE calendars SET webhook_channel_id = ?, updated_at = ? WHERE id = ?")
            .bind(channel_id)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<Calendar>> {
        let calendars = sqlx::query_as::<_, Calendar>("SELECT * FROM calendars ORDER BY created_at")
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(calendars)
    }

    /// All calendars eligible to take part in a sync pass: enabled, with an
    /// active owning account.
    pub async fn list_eligible(pool: &SqlitePool) -> AppResult<Vec<Calendar>> {
        let calendars = sqlx::query_as::<_, Calendar>(
            r#"
            SELECT c.* FROM calendars c
            JOIN accounts a ON a.id = c.account_id
            WHERE c.enabled = 1 AND a.is_active = 1
            ORDER BY c.created_at
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(calendars)
    }

    /// Eligible calendars belonging to one user, across all of that user's
    /// accounts. This is the fan-out target universe (the source calendar is
    /// excluded by the caller).
    pub async fn list_eligible_for_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> AppResult<Vec<Calendar>> {
        let calendars = sqlx::query_as::<_, Calendar>(
            r#"
            SELECT c.* FROM calendars c
            JOIN accounts a ON a.id = c.account_id
            WHERE c.enabled = 1 AND a.is_active = 1 AND a.user_id = ?
            ORDER BY c.created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(calendars)
    }

    /// Synchronous half of a disable: flip `enabled` off and mark cleanup
    /// pending with a request timestamp.
    pub async fn mark_disabled(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE calendars
            SET enabled = 0, cleanup_pending = 1, cleanup_requested_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_enabled(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE calendars SET enabled = 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Clear the cleanup-pending flag. Called from the teardown engine's
    /// finally path and from the stuck-flag sweep.
    pub async fn clear_cleanup_pending(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE calendars
            SET cleanup_pending = 0, cleanup_requested_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// Cleanup-pending calendars whose request is at least `age_seconds`
    /// old. The cleanup worker uses the minimum-age threshold to pick
    /// teardowns safe to run; the stuck sweep uses a much larger one.
    pub async fn list_cleanup_older_than(
        pool: &SqlitePool,
        age_seconds: i64,
    ) -> AppResult<Vec<Calendar>> {
        let cutoff = Utc::now().naive_utc() - Duration::seconds(age_seconds);

        let calendars = sqlx::query_as::<_, Calendar>(
            r#"
            SELECT * FROM calendars
            WHERE cleanup_pending = 1 AND cleanup_requested_at IS NOT NULL
              AND cleanup_requested_at <= ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(calendars)
    }
}
