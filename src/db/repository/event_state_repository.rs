use chrono::Utc;
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::models::{EventState, EventStatus, NewEventState};
use crate::error::{AppError, AppResult};

/// The Event State Store: authoritative ledger of every event this service
/// knows about (`event_states` table), keyed by the correlation identifier.
pub struct EventStateRepository;

impl EventStateRepository {
    /// Insert a validated new row, generating the correlation identifier.
    ///
    /// Generic over the executor so reconciler repair and teardown can run
    /// inside a transaction.
    pub async fn insert<'e, E>(executor: E, new: NewEventState) -> AppResult<EventState>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, EventState>(
            r#"
            INSERT INTO event_states (
                id, calendar_id, remote_event_id, is_busy_block, source_event_id,
                status, title, start_time, end_time, last_seen_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new.calendar_id)
        .bind(&new.remote_event_id)
        .bind(new.is_busy_block)
        .bind(&new.source_event_id)
        .bind(new.status)
        .bind(&new.title)
        .bind(new.start_time)
        .bind(new.end_time)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<EventState>> {
        let row = sqlx::query_as::<_, EventState>("SELECT * FROM event_states WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Look up a row by the provider-assigned event id on its calendar.
    pub async fn find_by_remote_event(
        pool: &SqlitePool,
        calendar_id: &str,
        remote_event_id: &str,
    ) -> AppResult<Option<EventState>> {
        let row = sqlx::query_as::<_, EventState>(
            r#"
            SELECT * FROM event_states
            WHERE calendar_id = ? AND remote_event_id = ? AND status != 'deleted'
            "#,
        )
        .bind(calendar_id)
        .bind(remote_event_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// The busy block mirroring `source_event_id` on `calendar_id`, if any.
    /// At most one such row exists (unique index).
    pub async fn find_by_source_and_calendar<'e, E>(
        executor: E,
        source_event_id: &str,
        calendar_id: &str,
    ) -> AppResult<Option<EventState>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query_as::<_, EventState>(
            r#"
            SELECT * FROM event_states
            WHERE source_event_id = ? AND calendar_id = ? AND is_busy_block = 1
            "#,
        )
        .bind(source_event_id)
        .bind(calendar_id)
        .fetch_optional(executor)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Every busy block spawned by one source event, across all calendars.
    pub async fn find_busy_blocks_by_source(
        pool: &SqlitePool,
        source_event_id: &str,
    ) -> AppResult<Vec<EventState>> {
        let rows = sqlx::query_as::<_, EventState>(
            "SELECT * FROM event_states WHERE source_event_id = ? AND is_busy_block = 1",
        )
        .bind(source_event_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Live user events owned by a calendar.
    pub async fn user_events_for_calendar(
        pool: &SqlitePool,
        calendar_id: &str,
    ) -> AppResult<Vec<EventState>> {
        let rows = sqlx::query_as::<_, EventState>(
            r#"
            SELECT * FROM event_states
            WHERE calendar_id = ? AND is_busy_block = 0 AND status != 'deleted'
            "#,
        )
        .bind(calendar_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Live busy blocks hosted on a calendar.
    pub async fn busy_blocks_for_calendar(
        pool: &SqlitePool,
        calendar_id: &str,
    ) -> AppResult<Vec<EventState>> {
        let rows = sqlx::query_as::<_, EventState>(
            r#"
            SELECT * FROM event_states
            WHERE calendar_id = ? AND is_busy_block = 1 AND status != 'deleted'
            "#,
        )
        .bind(calendar_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// All rows owned by a calendar, any status. Used by teardown.
    pub async fn all_for_calendar(
        pool: &SqlitePool,
        calendar_id: &str,
    ) -> AppResult<Vec<EventState>> {
        let rows =
            sqlx::query_as::<_, EventState>("SELECT * FROM event_states WHERE calendar_id = ?")
                .bind(calendar_id)
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Rows awaiting their remote write. A crash between the local and the
    /// remote write leaves exactly these behind for the reconciler.
    pub async fn pending(pool: &SqlitePool) -> AppResult<Vec<EventState>> {
        let rows =
            sqlx::query_as::<_, EventState>("SELECT * FROM event_states WHERE status = 'pending'")
                .fetch_all(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Most recently seen rows on a calendar, newest first. Input to the
    /// cascade-guard fan-out suppression heuristic.
    pub async fn recent_for_calendar(
        pool: &SqlitePool,
        calendar_id: &str,
        limit: i64,
    ) -> AppResult<Vec<EventState>> {
        let rows = sqlx::query_as::<_, EventState>(
            r#"
            SELECT * FROM event_states
            WHERE calendar_id = ? AND status != 'deleted'
            ORDER BY last_seen_at DESC
            LIMIT ?
            "#,
        )
        .bind(calendar_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Record the remote event id after a successful remote write and
    /// transition pending -> synced.
    pub async fn mark_synced(
        pool: &SqlitePool,
        id: &str,
        remote_event_id: &str,
    ) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            UPDATE event_states
            SET remote_event_id = ?, status = ?, last_seen_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(remote_event_id)
        .bind(EventStatus::Synced)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    pub async fn mark_deleted(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE event_states SET status = ?, updated_at = ? WHERE id = ?")
            .bind(EventStatus::Deleted)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Refresh `last_seen_at` on a subsequent sighting.
    pub async fn touch(pool: &SqlitePool, id: &str) -> AppResult<()> {
        let now = Utc::now().naive_utc();

        sqlx::query("UPDATE event_states SET last_seen_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Hard delete one row.
    pub async fn delete<'e, E>(executor: E, id: &str) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("DELETE FROM event_states WHERE id = ?")
            .bind(id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }

    /// Hard delete every row owned by a calendar. Used by teardown.
    pub async fn delete_by_calendar<'e, E>(executor: E, calendar_id: &str) -> AppResult<u64>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query("DELETE FROM event_states WHERE calendar_id = ?")
            .bind(calendar_id)
            .execute(executor)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Expected side of the audit matrix: live user events on the source
    /// calendar.
    pub async fn count_user_events(pool: &SqlitePool, calendar_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM event_states
            WHERE calendar_id = ? AND is_busy_block = 0 AND status != 'deleted'
            "#,
        )
        .bind(calendar_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Actual side of the audit matrix: busy blocks on `target` whose source
    /// is a live user event on `source`.
    pub async fn count_busy_blocks_for_pair(
        pool: &SqlitePool,
        source_calendar_id: &str,
        target_calendar_id: &str,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM event_states t
            JOIN event_states s ON s.id = t.source_event_id
            WHERE t.calendar_id = ? AND t.is_busy_block = 1 AND t.status != 'deleted'
              AND s.calendar_id = ? AND s.is_busy_block = 0 AND s.status != 'deleted'
            "#,
        )
        .bind(target_calendar_id)
        .bind(source_calendar_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    /// User events on `source` that have no live busy block on `target`.
    /// These are the reconciler's repair candidates.
    pub async fn user_events_missing_block(
        pool: &SqlitePool,
        source_calendar_id: &str,
        target_calendar_id: &str,
    ) -> AppResult<Vec<EventState>> {
        let rows = sqlx::query_as::<_, EventState>(
            r#"
            SELECT s.* FROM event_states s
            WHERE s.calendar_id = ? AND s.is_busy_block = 0 AND s.status = 'synced'
              AND NOT EXISTS (
                  SELECT 1 FROM event_states t
                  WHERE t.source_event_id = s.id AND t.calendar_id = ?
                    AND t.is_busy_block = 1 AND t.status != 'deleted'
              )
            "#,
        )
        .bind(source_calendar_id)
        .bind(target_calendar_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
