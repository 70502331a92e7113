use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Distributed mutual exclusion keyed by calendar id. Pure mutual
/// exclusion, not a queue: a failed acquire means the caller skips its pass.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to acquire the lock for `calendar_id` with the given TTL.
    /// Returns a holder guard token on success, `None` when the lock is
    /// already held.
    async fn acquire(&self, calendar_id: &str, ttl_seconds: i64) -> AppResult<Option<String>>;

    /// Release a lock previously acquired with `holder`. Releasing a lock
    /// held by someone else (ours expired and was re-acquired) is a no-op.
    async fn release(&self, calendar_id: &str, holder: &str) -> AppResult<()>;
}

/// Lock rows in the `sync_locks` table. Acquisition is a single atomic
/// upsert that only steals an expired row; the holder token guards release.
pub struct SqliteLockService {
    pool: SqlitePool,
}

impl SqliteLockService {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteLockService { pool }
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn acquire(&self, calendar_id: &str, ttl_seconds: i64) -> AppResult<Option<String>> {
        let holder = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let expires_at = now + Duration::seconds(ttl_seconds);

        let result = sqlx::query(
            r#"
            INSERT INTO sync_locks (calendar_id, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(calendar_id) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE sync_locks.expires_at <= ?
            "#,
        )
        .bind(calendar_id)
        .bind(&holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(holder))
    }

    async fn release(&self, calendar_id: &str, holder: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM sync_locks WHERE calendar_id = ? AND holder = ?")
            .bind(calendar_id)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        Ok(())
    }
}
