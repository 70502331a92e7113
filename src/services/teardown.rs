use chrono::{Duration, Utc};

use crate::db::models::Calendar;
use crate::db::{CalendarRepository, EventStateRepository};
use crate::error::{AppError, AppResult};
use crate::services::SyncContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The disable is too recent; an in-flight sync pass may still be
    /// writing. Try again on the next worker tick.
    NotDue,
    Done(CleanupStats),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    /// Busy blocks removed from sibling calendars (sourced from the
    /// disabled calendar's user events).
    pub mirrored_blocks_removed: usize,
    /// Busy blocks removed from the disabled calendar's own remote.
    pub hosted_blocks_removed: usize,
    /// Local rows deleted.
    pub rows_deleted: u64,
    pub remote_failures: usize,
}

/// Disables calendars and unwinds their sync footprint: blocks they host,
/// blocks they spawned elsewhere, and every local record.
pub struct TeardownEngine;

impl TeardownEngine {
    /// Synchronous half of a disable. The actual deletion runs later from
    /// the cleanup worker, once the request has aged past the race window.
    pub async fn disable(ctx: &SyncContext, calendar_id: &str) -> AppResult<Calendar> {
        let calendar = CalendarRepository::find_by_id(&ctx.pool, calendar_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))?;
        if calendar.cleanup_pending {
            return Err(AppError::CleanupInProgress(calendar_id.to_string()));
        }

        CalendarRepository::mark_disabled(&ctx.pool, calendar_id).await?;
        // Notifications for a disabled calendar have nowhere to land; drop
        // the channel mapping with it.
        CalendarRepository::set_webhook_channel(&ctx.pool, calendar_id, None).await?;
        tracing::info!(calendar_id, "calendar disabled; cleanup queued");

        CalendarRepository::find_by_id(&ctx.pool, calendar_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))
    }

    /// Re-enable a calendar. Rejected while its teardown is still pending:
    /// re-enabling mid-cleanup would race the deletes.
    pub async fn enable(ctx: &SyncContext, calendar_id: &str) -> AppResult<Calendar> {
        let calendar = CalendarRepository::find_by_id(&ctx.pool, calendar_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))?;
        if calendar.cleanup_pending {
            return Err(AppError::CleanupInProgress(calendar_id.to_string()));
        }

        CalendarRepository::mark_enabled(&ctx.pool, calendar_id).await?;

        CalendarRepository::find_by_id(&ctx.pool, calendar_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))
    }

    /// Execute a pending teardown. The cleanup-pending flag is cleared no
    /// matter how the deletion goes; a partially failed teardown must not
    /// wedge the calendar forever.
    pub async fn run_cleanup(ctx: &SyncContext, calendar: &Calendar) -> AppResult<CleanupOutcome> {
        let requested_at = match calendar.cleanup_requested_at {
            Some(ts) if calendar.cleanup_pending => ts,
            _ => return Ok(CleanupOutcome::NotDue),
        };
        let cutoff = Utc::now().naive_utc() - Duration::seconds(ctx.config.cleanup.min_age_seconds);
        if requested_at > cutoff {
            return Ok(CleanupOutcome::NotDue);
        }

        let result = Self::delete_footprint(ctx, calendar).await;

        if let Err(e) = CalendarRepository::clear_cleanup_pending(&ctx.pool, &calendar.id).await {
            tracing::error!(calendar_id = %calendar.id, "failed to clear cleanup flag: {:?}", e);
        }

        match result {
            Ok(stats) => {
                tracing::info!(
                    calendar_id = %calendar.id,
                    mirrored = stats.mirrored_blocks_removed,
                    hosted = stats.hosted_blocks_removed,
                    rows = stats.rows_deleted,
                    failures = stats.remote_failures,
                    "calendar teardown complete"
                );
                Ok(CleanupOutcome::Done(stats))
            }
            Err(e) => {
                tracing::error!(calendar_id = %calendar.id, "calendar teardown failed: {:?}", e);
                Err(AppError::Teardown(format!(
                    "teardown of calendar {} failed: {}",
                    calendar.id, e
                )))
            }
        }
    }

    async fn delete_footprint(ctx: &SyncContext, calendar: &Calendar) -> AppResult<CleanupStats> {
        let mut stats = CleanupStats::default();

        // Blocks this calendar's user events spawned on its siblings.
        let user_events = EventStateRepository::user_events_for_calendar(&ctx.pool, &calendar.id)
            .await?;
        for source in &user_events {
            let blocks =
                EventStateRepository::find_busy_blocks_by_source(&ctx.pool, &source.id).await?;
            for block in blocks {
                match CalendarRepository::find_by_id(&ctx.pool, &block.calendar_id).await? {
                    Some(host) => {
                        if let Some(remote_id) = block.remote_event_id.as_deref() {
                            if Self::remote_delete(ctx, &host, remote_id).await.is_err() {
                                stats.remote_failures += 1;
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            block_id = %block.id,
                            calendar_id = %block.calendar_id,
                            "busy block points at a missing calendar; deleting locally only"
                        );
                    }
                }
                EventStateRepository::delete(&ctx.pool, &block.id).await?;
                stats.mirrored_blocks_removed += 1;
            }
        }

        // Blocks hosted on the disabled calendar itself, removed in one
        // best-effort batch against its own remote.
        let hosted = EventStateRepository::busy_blocks_for_calendar(&ctx.pool, &calendar.id).await?;
        let hosted_remote_ids: Vec<String> = hosted
            .iter()
            .filter_map(|block| block.remote_event_id.clone())
            .collect();
        if !hosted_remote_ids.is_empty() {
            let token = ctx.credentials.access_token(&calendar.account_id).await?;
            if let Err(e) = ctx
                .client
                .batch_delete(&token, &calendar.remote_calendar_id, &hosted_remote_ids)
                .await
            {
                tracing::warn!(
                    calendar_id = %calendar.id,
                    "Batch delete of hosted blocks failed: {:?}",
                    e
                );
                stats.remote_failures += hosted_remote_ids.len();
            }
        }
        stats.hosted_blocks_removed = hosted.len();

        // Every remaining local record owned by the calendar.
        stats.rows_deleted =
            EventStateRepository::delete_by_calendar(&ctx.pool, &calendar.id).await?;

        Ok(stats)
    }

    async fn remote_delete(ctx: &SyncContext, host: &Calendar, remote_id: &str) -> AppResult<()> {
        let token = ctx.credentials.access_token(&host.account_id).await?;
        ctx.client
            .delete_event(&token, &host.remote_calendar_id, remote_id)
            .await
            .map_err(|e| {
                tracing::warn!(
                    "Failed to delete remote event {} on {}: {:?}",
                    remote_id,
                    host.id,
                    e
                );
                e
            })
    }

    /// Clear cleanup flags that have been pending far longer than any
    /// teardown should take. A stuck flag means a worker died mid-teardown.
    pub async fn sweep_stuck(ctx: &SyncContext) -> AppResult<usize> {
        let stuck = CalendarRepository::list_cleanup_older_than(
            &ctx.pool,
            ctx.config.cleanup.stuck_timeout_seconds,
        )
        .await?;

        for calendar in &stuck {
            tracing::error!(
                calendar_id = %calendar.id,
                requested_at = ?calendar.cleanup_requested_at,
                "cleanup flag stuck past timeout; clearing so the calendar can recover"
            );
            CalendarRepository::clear_cleanup_pending(&ctx.pool, &calendar.id).await?;
        }

        Ok(stuck.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::models::NewEventState;
    use crate::db::EventStateRepository;
    use crate::services::fanout::FanOutEngine;
    use crate::services::remote::RemoteEvent;
    use crate::test_support::{
        setup_pool, test_context, test_times, three_calendar_user, FakeCalendarClient,
    };

    async fn backdate_cleanup_request(pool: &sqlx::SqlitePool, calendar_id: &str, seconds: i64) {
        let ts = Utc::now().naive_utc() - Duration::seconds(seconds);
        sqlx::query("UPDATE calendars SET cleanup_requested_at = ? WHERE id = ?")
            .bind(ts)
            .bind(calendar_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reenable_is_rejected_while_cleanup_pending() {
        let pool = setup_pool().await;
        let (_, a, _, _) = three_calendar_user(&pool).await;
        let ctx = test_context(pool.clone(), Arc::new(FakeCalendarClient::new()));

        let disabled = TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.cleanup_pending);

        let err = TeardownEngine::enable(&ctx, &a.id).await;
        assert!(matches!(err, Err(AppError::CleanupInProgress(_))));

        // A second disable is rejected too.
        let err = TeardownEngine::disable(&ctx, &a.id).await;
        assert!(matches!(err, Err(AppError::CleanupInProgress(_))));
    }

    #[tokio::test]
    async fn disable_drops_the_webhook_channel_mapping() {
        let pool = setup_pool().await;
        let (_, a, _, _) = three_calendar_user(&pool).await;
        let ctx = test_context(pool.clone(), Arc::new(FakeCalendarClient::new()));

        CalendarRepository::set_webhook_channel(&pool, &a.id, Some("chan-a"))
            .await
            .unwrap();

        let disabled = TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        assert!(disabled.webhook_channel_id.is_none());
        assert!(CalendarRepository::find_by_webhook_channel(&pool, "chan-a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fresh_disable_is_not_due_for_cleanup() {
        let pool = setup_pool().await;
        let (_, a, _, _) = three_calendar_user(&pool).await;
        let ctx = test_context(pool.clone(), Arc::new(FakeCalendarClient::new()));

        let disabled = TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        let outcome = TeardownEngine::run_cleanup(&ctx, &disabled).await.unwrap();
        assert_eq!(outcome, CleanupOutcome::NotDue);
    }

    #[tokio::test]
    async fn teardown_removes_only_the_disabled_calendars_footprint() {
        let pool = setup_pool().await;
        let (_, a, b, c) = three_calendar_user(&pool).await;
        let client = Arc::new(FakeCalendarClient::new());
        let mut ctx = test_context(pool.clone(), client.clone());
        ctx.config.cleanup.min_age_seconds = 0;

        let (start, end) = test_times();
        let event_a = RemoteEvent {
            id: Some("rem-a1".to_string()),
            title: Some("From A".to_string()),
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        };
        let event_b = RemoteEvent {
            id: Some("rem-b1".to_string()),
            title: Some("From B".to_string()),
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        };
        client.seed_event(&a.remote_calendar_id, event_a.clone());
        client.seed_event(&b.remote_calendar_id, event_b.clone());

        // A's event is mirrored to B and C; B's event to A and C.
        FanOutEngine::process_new_user_event(&ctx, "t", &a, &event_a)
            .await
            .unwrap();
        FanOutEngine::process_new_user_event(&ctx, "t", &b, &event_b)
            .await
            .unwrap();
        assert_eq!(client.events_on(&c.remote_calendar_id).len(), 2);

        TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        backdate_cleanup_request(&pool, &a.id, 120).await;
        let disabled = CalendarRepository::find_by_id(&pool, &a.id)
            .await
            .unwrap()
            .unwrap();

        let outcome = TeardownEngine::run_cleanup(&ctx, &disabled).await.unwrap();
        let stats = match outcome {
            CleanupOutcome::Done(stats) => stats,
            other => panic!("expected Done, got {:?}", other),
        };
        assert_eq!(stats.mirrored_blocks_removed, 2);
        assert_eq!(stats.hosted_blocks_removed, 1);
        assert_eq!(stats.remote_failures, 0);

        // A's local footprint is gone.
        assert!(EventStateRepository::all_for_calendar(&pool, &a.id)
            .await
            .unwrap()
            .is_empty());

        // B -> C mirroring is untouched: C still carries exactly the block
        // sourced from B, and B keeps its own user event.
        let c_blocks = EventStateRepository::busy_blocks_for_calendar(&pool, &c.id)
            .await
            .unwrap();
        assert_eq!(c_blocks.len(), 1);
        assert_eq!(c_blocks[0].title, "Busy - From B");
        assert_eq!(client.events_on(&c.remote_calendar_id).len(), 1);

        // A's remote calendar keeps the user's own event but loses the block
        // that mirrored B.
        let a_remote = client.events_on(&a.remote_calendar_id);
        assert_eq!(a_remote.len(), 1);
        assert_eq!(a_remote[0].id.as_deref(), Some("rem-a1"));

        // The flag is cleared, so re-enabling works now.
        let enabled = TeardownEngine::enable(&ctx, &a.id).await.unwrap();
        assert!(enabled.enabled);
        assert!(!enabled.cleanup_pending);
    }

    #[tokio::test]
    async fn cleanup_flag_is_cleared_even_when_deletes_fail() {
        let pool = setup_pool().await;
        let (_, a, b, _) = three_calendar_user(&pool).await;
        let client = Arc::new(FakeCalendarClient::new());
        let mut ctx = test_context(pool.clone(), client.clone());
        ctx.config.cleanup.min_age_seconds = 0;

        let (start, end) = test_times();
        let source = EventStateRepository::insert(
            &pool,
            NewEventState::user_event(&a.id, "rem-a1", None, "From A", start, end).unwrap(),
        )
        .await
        .unwrap();
        let block = EventStateRepository::insert(
            &pool,
            NewEventState::busy_block(&b.id, Some(&source.id), "Busy - From A", start, end)
                .unwrap(),
        )
        .await
        .unwrap();
        EventStateRepository::mark_synced(&pool, &block.id, "rem-blk").await.unwrap();

        TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        backdate_cleanup_request(&pool, &a.id, 120).await;
        let disabled = CalendarRepository::find_by_id(&pool, &a.id)
            .await
            .unwrap()
            .unwrap();

        client.fail_deletes(true);
        let outcome = TeardownEngine::run_cleanup(&ctx, &disabled).await.unwrap();
        let stats = match outcome {
            CleanupOutcome::Done(stats) => stats,
            other => panic!("expected Done, got {:?}", other),
        };
        assert_eq!(stats.remote_failures, 1);
        // The local rows still go, and the flag still clears.
        assert!(EventStateRepository::all_for_calendar(&pool, &a.id)
            .await
            .unwrap()
            .is_empty());
        assert!(EventStateRepository::find_by_id(&pool, &block.id)
            .await
            .unwrap()
            .is_none());

        let after = CalendarRepository::find_by_id(&pool, &a.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!after.cleanup_pending);
        assert!(after.cleanup_requested_at.is_none());
    }

    #[tokio::test]
    async fn sweep_clears_stuck_flags_only() {
        let pool = setup_pool().await;
        let (_, a, b, _) = three_calendar_user(&pool).await;
        let ctx = test_context(pool.clone(), Arc::new(FakeCalendarClient::new()));

        TeardownEngine::disable(&ctx, &a.id).await.unwrap();
        TeardownEngine::disable(&ctx, &b.id).await.unwrap();
        // Only A's request is old enough to count as stuck.
        backdate_cleanup_request(&pool, &a.id, 7200).await;

        let cleared = TeardownEngine::sweep_stuck(&ctx).await.unwrap();
        assert_eq!(cleared, 1);

        let a_after = CalendarRepository::find_by_id(&pool, &a.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!a_after.cleanup_pending);
        let b_after = CalendarRepository::find_by_id(&pool, &b.id)
            .await
            .unwrap()
            .unwrap();
        assert!(b_after.cleanup_pending);
    }
}
