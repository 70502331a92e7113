use chrono::{Duration, Utc};
use serde::Serialize;

use crate::db::models::{Calendar, EventState, NewEventState};
use crate::db::{CalendarRepository, EventStateRepository};
use crate::error::{AppError, AppResult};
use crate::services::identity::IdentityCodec;
use crate::services::remote::RemoteEvent;
use crate::services::SyncContext;

/// Health of one ordered (source, target) calendar pair: how many of the
/// source's user events have a live busy block on the target.
#[derive(Debug, Clone, Serialize)]
pub struct PairHealth {
    pub source_calendar_id: String,
    pub target_calendar_id: String,
    pub expected: i64,
    pub actual: i64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub user_id: String,
    pub pairs: Vec<PairHealth>,
    pub overall_score: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RepairReport {
    pub blocks_repaired: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegacyCalendarScan {
    pub calendar_id: String,
    pub remaining: usize,
}

/// Remote events still carrying the pre-identifier text markers, per
/// calendar. Once every count reaches zero the legacy-upgrade rule can be
/// switched off.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LegacyScanReport {
    pub calendars: Vec<LegacyCalendarScan>,
    pub total: usize,
}

/// Measures mirror completeness per calendar pair and recreates busy blocks
/// lost to remote failures or out-of-band deletions.
pub struct Reconciler;

/// A `pending` row this old was abandoned mid-write (crash between the local
/// insert and the remote create); anything younger may belong to a pass in
/// flight.
const STALE_PENDING_SECS: i64 = 300;

/// Free-text term matching both legacy marker forms (title prefix and
/// description tag).
const LEGACY_SEARCH_TERM: &str = "CalBridge";

impl Reconciler {
    /// Score every ordered pair of the user's eligible calendars. An empty
    /// source scores 100: nothing expected means nothing missing.
    pub async fn audit(ctx: &SyncContext, user_id: &str) -> AppResult<AuditReport> {
        let calendars = CalendarRepository::list_eligible_for_user(&ctx.pool, user_id).await?;

        let mut pairs = Vec::new();
        let mut total_expected = 0i64;
        let mut total_actual = 0i64;

        for source in &calendars {
            let expected = EventStateRepository::count_user_events(&ctx.pool, &source.id).await?;
            for target in &calendars {
                if target.id == source.id {
                    continue;
                }
                let actual = EventStateRepository::count_busy_blocks_for_pair(
                    &ctx.pool,
                    &source.id,
                    &target.id,
                )
                .await?;

                total_expected += expected;
                total_actual += actual;
                pairs.push(PairHealth {
                    source_calendar_id: source.id.clone(),
                    target_calendar_id: target.id.clone(),
                    expected,
                    actual,
                    score: Self::score(expected, actual),
                });
            }
        }

        Ok(AuditReport {
            user_id: user_id.to_string(),
            pairs,
            overall_score: Self::score(total_expected, total_actual),
        })
    }

    fn score(expected: i64, actual: i64) -> f64 {
        if expected == 0 {
            100.0
        } else {
            100.0 * actual as f64 / expected as f64
        }
    }

    /// Recreate every missing busy block for the user. Local rows for the
    /// whole user land in one transaction, so a concurrent audit sees either
    /// the pre-repair or the post-repair matrix; remote writes follow after
    /// commit, database-first as everywhere else.
    pub async fn repair(ctx: &SyncContext, user_id: &str) -> AppResult<RepairReport> {
        Self::expire_stale_pending(ctx).await?;

        let calendars = CalendarRepository::list_eligible_for_user(&ctx.pool, user_id).await?;

        let mut candidates: Vec<(EventState, Calendar)> = Vec::new();
        for source in &calendars {
            for target in &calendars {
                if target.id == source.id {
                    continue;
                }
                let missing = EventStateRepository::user_events_missing_block(
                    &ctx.pool,
                    &source.id,
                    &target.id,
                )
                .await?;
                for state in missing {
                    candidates.push((state, target.clone()));
                }
            }
        }

        if candidates.is_empty() {
            return Ok(RepairReport::default());
        }

        struct PendingWrite {
            row_id: String,
            target: Calendar,
            stale_remote_id: Option<String>,
            remote: RemoteEvent,
        }

        let mut writes: Vec<PendingWrite> = Vec::with_capacity(candidates.len());
        let mut tx = ctx.pool.begin().await?;

        for (source_state, target) in candidates {
            // A tombstone from an earlier failed write occupies the pair's
            // unique slot; clear it before re-inserting.
            let mut stale_remote_id = None;
            if let Some(stale) = EventStateRepository::find_by_source_and_calendar(
                &mut *tx,
                &source_state.id,
                &target.id,
            )
            .await?
            {
                stale_remote_id = stale.remote_event_id.clone();
                EventStateRepository::delete(&mut *tx, &stale.id).await?;
            }

            let title = format!(
                "Busy - {}",
                IdentityCodec::clean_title(&source_state.title)
            );
            let new = NewEventState::busy_block(
                &target.id,
                Some(&source_state.id),
                &title,
                source_state.start_time,
                source_state.end_time,
            )?;
            let row = EventStateRepository::insert(&mut *tx, new).await?;

            let mut remote = RemoteEvent {
                title: Some(title),
                start_time: Some(source_state.start_time),
                end_time: Some(source_state.end_time),
                transparency: Some("opaque".to_string()),
                visibility: Some("private".to_string()),
                ..Default::default()
            };
            IdentityCodec::embed(&mut remote, &row.id, false);

            writes.push(PendingWrite {
                row_id: row.id,
                target,
                stale_remote_id,
                remote,
            });
        }

        tx.commit().await?;

        let mut report = RepairReport::default();
        for write in writes {
            match Self::apply_remote(ctx, &write.target, write.stale_remote_id, &write.remote)
                .await
            {
                Ok(remote_id) => {
                    EventStateRepository::mark_synced(&ctx.pool, &write.row_id, &remote_id)
                        .await?;
                    report.blocks_repaired += 1;
                }
                Err(e) => {
                    EventStateRepository::mark_deleted(&ctx.pool, &write.row_id).await?;
                    report.failures += 1;
                    tracing::warn!(
                        row_id = %write.row_id,
                        target_calendar = %write.target.id,
                        "repair write failed: {:?}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            user_id,
            repaired = report.blocks_repaired,
            failures = report.failures,
            "reconciler repair complete"
        );

        Ok(report)
    }

    /// Search each of the user's calendars for events that still carry the
    /// legacy text markers and no embedded identifier. Upgraded events keep
    /// their visible markers but carry an id, so they do not count.
    pub async fn scan_legacy(ctx: &SyncContext, user_id: &str) -> AppResult<LegacyScanReport> {
        let calendars = CalendarRepository::list_eligible_for_user(&ctx.pool, user_id).await?;

        let mut report = LegacyScanReport::default();
        for calendar in &calendars {
            let token = ctx.credentials.access_token(&calendar.account_id).await?;
            let hits = ctx
                .client
                .search_events(&token, &calendar.remote_calendar_id, LEGACY_SEARCH_TERM)
                .await?;
            let remaining = hits
                .iter()
                .filter(|ev| {
                    IdentityCodec::has_legacy_markers(ev) && IdentityCodec::extract(ev).is_none()
                })
                .count();

            report.total += remaining;
            report.calendars.push(LegacyCalendarScan {
                calendar_id: calendar.id.clone(),
                remaining,
            });
        }

        Ok(report)
    }

    /// Tombstone abandoned `pending` rows so their pairs show up as missing
    /// and get recreated below. A live pass never leaves pending rows for
    /// long; only a crash between the local and the remote write does.
    async fn expire_stale_pending(ctx: &SyncContext) -> AppResult<()> {
        let cutoff = Utc::now().naive_utc() - Duration::seconds(STALE_PENDING_SECS);
        for row in EventStateRepository::pending(&ctx.pool).await? {
            if row.updated_at <= cutoff {
                tracing::warn!(
                    row_id = %row.id,
                    calendar_id = %row.calendar_id,
                    "expiring pending row abandoned mid-write"
                );
                EventStateRepository::mark_deleted(&ctx.pool, &row.id).await?;
            }
        }
        Ok(())
    }

    async fn apply_remote(
        ctx: &SyncContext,
        target: &Calendar,
        stale_remote_id: Option<String>,
        remote: &RemoteEvent,
    ) -> AppResult<String> {
        let token = ctx.credentials.access_token(&target.account_id).await?;

        if let Some(stale_id) = stale_remote_id {
            if let Err(e) = ctx
                .client
                .delete_event(&token, &target.remote_calendar_id, &stale_id)
                .await
            {
                tracing::warn!(
                    "Failed to delete stale busy block {} on {}: {:?}",
                    stale_id,
                    target.id,
                    e
                );
            }
        }

        let created = ctx
            .client
            .create_event(&token, &target.remote_calendar_id, remote)
            .await?;
        created
            .id
            .ok_or_else(|| AppError::RemoteApi("created event has no id".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::models::EventStatus;
    use crate::services::identity::{LEGACY_DESCRIPTION_TAG, LEGACY_TITLE_PREFIX};
    use crate::test_support::{
        create_account, create_calendar, setup_pool, test_context, test_times, FakeCalendarClient,
    };

    async fn seed_user_event(
        pool: &sqlx::SqlitePool,
        calendar_id: &str,
        remote_id: &str,
        title: &str,
    ) -> EventState {
        let (start, end) = test_times();
        EventStateRepository::insert(
            pool,
            NewEventState::user_event(calendar_id, remote_id, None, title, start, end).unwrap(),
        )
        .await
        .unwrap()
    }

    async fn seed_block(
        pool: &sqlx::SqlitePool,
        calendar_id: &str,
        source: &EventState,
        remote_id: &str,
    ) {
        let block = EventStateRepository::insert(
            pool,
            NewEventState::busy_block(
                calendar_id,
                Some(&source.id),
                &format!("Busy - {}", source.title),
                source.start_time,
                source.end_time,
            )
            .unwrap(),
        )
        .await
        .unwrap();
        EventStateRepository::mark_synced(pool, &block.id, remote_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_calendars_score_perfect() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        create_calendar(&pool, &account, "remote-a").await;
        create_calendar(&pool, &account, "remote-b").await;
        let ctx = test_context(pool, Arc::new(FakeCalendarClient::new()));

        let report = Reconciler::audit(&ctx, "user-1").await.unwrap();
        assert_eq!(report.pairs.len(), 2);
        assert!(report.pairs.iter().all(|p| p.score == 100.0));
        assert_eq!(report.overall_score, 100.0);
    }

    #[tokio::test]
    async fn missing_blocks_lower_the_score_and_repair_restores_it() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let client = Arc::new(FakeCalendarClient::new());
        let ctx = test_context(pool.clone(), client.clone());

        // Five user events on A, only three mirrored to B.
        let mut sources = Vec::new();
        for i in 0..5 {
            sources.push(
                seed_user_event(&pool, &a.id, &format!("rem-{}", i), &format!("Event {}", i))
                    .await,
            );
        }
        for (i, source) in sources.iter().take(3).enumerate() {
            seed_block(&pool, &b.id, source, &format!("rem-blk-{}", i)).await;
        }

        let report = Reconciler::audit(&ctx, "user-1").await.unwrap();
        let a_to_b = report
            .pairs
            .iter()
            .find(|p| p.source_calendar_id == a.id && p.target_calendar_id == b.id)
            .unwrap();
        assert_eq!(a_to_b.expected, 5);
        assert_eq!(a_to_b.actual, 3);
        assert!((a_to_b.score - 60.0).abs() < f64::EPSILON);

        let repair = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(repair.blocks_repaired, 2);
        assert_eq!(repair.failures, 0);

        let report = Reconciler::audit(&ctx, "user-1").await.unwrap();
        assert_eq!(report.overall_score, 100.0);

        // The repaired blocks exist remotely with their identifiers embedded.
        let remote_blocks = client.events_on(&b.remote_calendar_id);
        assert_eq!(remote_blocks.len(), 2);
        for ev in &remote_blocks {
            assert!(IdentityCodec::extract(ev).is_some());
            assert_eq!(ev.transparency.as_deref(), Some("opaque"));
        }
    }

    #[tokio::test]
    async fn repair_is_idempotent() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let client = Arc::new(FakeCalendarClient::new());
        let ctx = test_context(pool.clone(), client.clone());

        seed_user_event(&pool, &a.id, "rem-1", "Standup").await;

        let first = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(first.blocks_repaired, 1);

        let second = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(second.blocks_repaired, 0);
        assert_eq!(client.events_on(&b.remote_calendar_id).len(), 1);
    }

    #[tokio::test]
    async fn failed_repair_leaves_tombstone_and_later_repair_heals() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let client = Arc::new(FakeCalendarClient::new());
        let ctx = test_context(pool.clone(), client.clone());

        let source = seed_user_event(&pool, &a.id, "rem-1", "Standup").await;

        client.fail_creates(true);
        let report = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(report.blocks_repaired, 0);
        assert_eq!(report.failures, 1);

        let tombstone =
            EventStateRepository::find_by_source_and_calendar(&pool, &source.id, &b.id)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(tombstone.status, EventStatus::Deleted);

        // The tombstone keeps the score at zero until the next repair clears
        // it and re-creates the block.
        client.fail_creates(false);
        let report = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(report.blocks_repaired, 1);

        let audit = Reconciler::audit(&ctx, "user-1").await.unwrap();
        assert_eq!(audit.overall_score, 100.0);
    }

    #[tokio::test]
    async fn legacy_scan_counts_only_unupgraded_events() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let client = Arc::new(FakeCalendarClient::new());
        let ctx = test_context(pool.clone(), client.clone());

        let (start, end) = test_times();
        // A block from the pre-identifier era, never upgraded.
        client.seed_event(
            &a.remote_calendar_id,
            RemoteEvent {
                id: Some("rem-old".to_string()),
                title: Some(format!("{}Busy", LEGACY_TITLE_PREFIX)),
                start_time: Some(start),
                end_time: Some(end),
                ..Default::default()
            },
        );
        // An upgraded block keeps its visible markers but carries an id.
        let mut upgraded = RemoteEvent {
            id: Some("rem-upgraded".to_string()),
            title: Some("Busy".to_string()),
            description: Some(LEGACY_DESCRIPTION_TAG.to_string()),
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        };
        IdentityCodec::embed(&mut upgraded, "11111111-1111-4111-8111-111111111111", false);
        client.seed_event(&a.remote_calendar_id, upgraded);
        // An ordinary event never counts.
        client.seed_event(
            &b.remote_calendar_id,
            RemoteEvent {
                id: Some("rem-plain".to_string()),
                title: Some("Standup".to_string()),
                start_time: Some(start),
                end_time: Some(end),
                ..Default::default()
            },
        );

        let report = Reconciler::scan_legacy(&ctx, "user-1").await.unwrap();
        assert_eq!(report.total, 1);
        let a_scan = report
            .calendars
            .iter()
            .find(|c| c.calendar_id == a.id)
            .unwrap();
        assert_eq!(a_scan.remaining, 1);
        let b_scan = report
            .calendars
            .iter()
            .find(|c| c.calendar_id == b.id)
            .unwrap();
        assert_eq!(b_scan.remaining, 0);
    }

    #[tokio::test]
    async fn abandoned_pending_rows_are_expired_and_recreated() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let client = Arc::new(FakeCalendarClient::new());
        let ctx = test_context(pool.clone(), client.clone());

        let source = seed_user_event(&pool, &a.id, "rem-1", "Standup").await;
        // A crash between the local insert and the remote create leaves a
        // pending row with no remote event behind it.
        let stuck = EventStateRepository::insert(
            &pool,
            NewEventState::busy_block(
                &b.id,
                Some(&source.id),
                "Busy - Standup",
                source.start_time,
                source.end_time,
            )
            .unwrap(),
        )
        .await
        .unwrap();

        // Young pending rows may belong to a pass in flight; repair leaves
        // them alone.
        let report = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(report.blocks_repaired, 0);

        let ts = Utc::now().naive_utc() - Duration::seconds(STALE_PENDING_SECS + 60);
        sqlx::query("UPDATE event_states SET updated_at = ? WHERE id = ?")
            .bind(ts)
            .bind(&stuck.id)
            .execute(&pool)
            .await
            .unwrap();

        let report = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(report.blocks_repaired, 1);
        assert_eq!(client.events_on(&b.remote_calendar_id).len(), 1);

        // The abandoned row is gone, replaced by a fresh synced one.
        assert!(EventStateRepository::find_by_id(&pool, &stuck.id)
            .await
            .unwrap()
            .is_none());
        let replacement =
            EventStateRepository::find_by_source_and_calendar(&pool, &source.id, &b.id)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(replacement.status, EventStatus::Synced);
    }

    #[tokio::test]
    async fn legacy_placeholder_blocks_stay_out_of_the_matrix() {
        let pool = setup_pool().await;
        let account = create_account(&pool, "user-1").await;
        let a = create_calendar(&pool, &account, "remote-a").await;
        let b = create_calendar(&pool, &account, "remote-b").await;
        let ctx = test_context(pool.clone(), Arc::new(FakeCalendarClient::new()));

        // An upgraded legacy block on B has no real source; it must neither
        // count toward any pair nor trigger a repair.
        let (start, end) = test_times();
        EventStateRepository::insert(
            &pool,
            NewEventState::upgraded_legacy(&b.id, "rem-legacy", "Busy", start, end),
        )
        .await
        .unwrap();

        let report = Reconciler::audit(&ctx, "user-1").await.unwrap();
        let a_to_b = report
            .pairs
            .iter()
            .find(|p| p.source_calendar_id == a.id && p.target_calendar_id == b.id)
            .unwrap();
        assert_eq!(a_to_b.expected, 0);
        assert_eq!(a_to_b.actual, 0);

        let repair = Reconciler::repair(&ctx, "user-1").await.unwrap();
        assert_eq!(repair.blocks_repaired, 0);
    }
}
