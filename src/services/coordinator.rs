use std::time::Duration;

use serde::Serialize;

use crate::db::models::Calendar;
use crate::db::{AccountRepository, CalendarRepository, EventStateRepository};
use crate::error::{AppError, AppResult};
use crate::services::classifier::{Classification, Classifier};
use crate::services::fanout::FanOutEngine;
use crate::services::remote::RemoteEvent;
use crate::services::SyncContext;

/// What started a sync pass. Webhook passes run under a longer lock TTL and
/// are subject to fan-out suppression; scheduled and manual passes are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Webhook,
    Scheduled,
    Manual,
}

impl SyncTrigger {
    fn lock_ttl(&self, ctx: &SyncContext) -> i64 {
        match self {
            SyncTrigger::Webhook => ctx.config.sync.webhook_lock_ttl_seconds,
            SyncTrigger::Scheduled | SyncTrigger::Manual => {
                ctx.config.sync.scheduled_lock_ttl_seconds
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing was done: another pass holds the calendar lock, or the
    /// calendar is not eligible for sync.
    Skipped,
    Completed(SyncStats),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub events_listed: usize,
    pub our_events_skipped: usize,
    pub seen_updated: usize,
    pub legacy_upgraded: usize,
    pub new_user_events: usize,
    pub blocks_created: usize,
    pub fanout_failures: usize,
    /// Set when the cascade guard withheld fan-out on a webhook pass.
    pub fanout_suppressed: bool,
}

/// Runs one full sync pass over a calendar: list, classify, fan out. One
/// pass per calendar at a time, enforced through the lock service.
pub struct SyncCoordinator;

impl SyncCoordinator {
    pub async fn run_pass(
        ctx: &SyncContext,
        calendar_id: &str,
        trigger: SyncTrigger,
    ) -> AppResult<SyncOutcome> {
        let calendar = CalendarRepository::find_by_id(&ctx.pool, calendar_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))?;
        if !Self::is_eligible(ctx, &calendar).await? {
            tracing::info!(calendar_id, ?trigger, "calendar not eligible; skipping pass");
            return Ok(SyncOutcome::Skipped);
        }

        let holder = match ctx.locks.acquire(calendar_id, trigger.lock_ttl(ctx)).await? {
            Some(holder) => holder,
            None => {
                tracing::debug!(calendar_id, ?trigger, "calendar locked; skipping pass");
                return Ok(SyncOutcome::Skipped);
            }
        };

        let result = Self::run_locked(ctx, &calendar, trigger).await;

        if let Err(e) = ctx.locks.release(calendar_id, &holder).await {
            tracing::warn!(calendar_id, "failed to release sync lock: {:?}", e);
        }

        result.map(SyncOutcome::Completed)
    }

    /// A pass may only run for an enabled calendar on an active account with
    /// no teardown in flight. Checked on every pass: a webhook notification
    /// can arrive for a calendar disabled after its channel was registered,
    /// and must never turn it back into a fan-out source.
    async fn is_eligible(ctx: &SyncContext, calendar: &Calendar) -> AppResult<bool> {
        if !calendar.enabled || calendar.cleanup_pending {
            return Ok(false);
        }
        let account = AccountRepository::find_by_id(&ctx.pool, &calendar.account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {}", calendar.account_id)))?;
        Ok(account.is_active)
    }

    async fn run_locked(
        ctx: &SyncContext,
        calendar: &Calendar,
        trigger: SyncTrigger,
    ) -> AppResult<SyncStats> {
        let calendar_id = calendar.id.as_str();
        let token = ctx.credentials.access_token(&calendar.account_id).await?;

        let now = chrono::Utc::now().naive_utc();
        let from = now - chrono::Duration::days(ctx.config.sync.window_past_days);
        let to = now + chrono::Duration::days(ctx.config.sync.window_future_days);

        let events = ctx
            .client
            .list_events(&token, &calendar.remote_calendar_id, from, to)
            .await?;

        let mut stats = SyncStats {
            events_listed: events.len(),
            ..Default::default()
        };
        let mut new_events: Vec<RemoteEvent> = Vec::new();

        for event in &events {
            if event.is_cancelled() {
                continue;
            }
            match Classifier::classify(ctx, &token, calendar, event).await? {
                Classification::SkipOurEvent => stats.our_events_skipped += 1,
                Classification::UpdateSeen => stats.seen_updated += 1,
                Classification::UpgradeLegacy { .. } => stats.legacy_upgraded += 1,
                Classification::ProcessNewUserEvent => new_events.push(event.clone()),
            }
        }

        stats.new_user_events = new_events.len();

        if !new_events.is_empty() {
            if trigger == SyncTrigger::Webhook
                && Self::should_suppress_fanout(ctx, calendar_id).await?
            {
                tracing::warn!(
                    calendar_id,
                    candidates = new_events.len(),
                    "recent activity is mostly busy blocks; withholding fan-out \
                     until the next scheduled pass"
                );
                stats.fanout_suppressed = true;
            } else {
                // Settle window before cross-calendar writes, so a burst of
                // notifications collapses into one round of fan-out.
                if ctx.config.sync.fanout_delay_seconds > 0 {
                    tokio::time::sleep(Duration::from_secs(ctx.config.sync.fanout_delay_seconds))
                        .await;
                }

                for event in &new_events {
                    match FanOutEngine::process_new_user_event(ctx, &token, calendar, event).await
                    {
                        Ok((_, result)) => {
                            stats.blocks_created += result.blocks_created;
                            stats.fanout_failures += result.failures;
                        }
                        Err(e) => {
                            stats.fanout_failures += 1;
                            tracing::warn!(
                                calendar_id,
                                remote_event_id = event.id.as_deref().unwrap_or("?"),
                                "fan-out failed: {:?}",
                                e
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(
            calendar_id,
            ?trigger,
            listed = stats.events_listed,
            ours = stats.our_events_skipped,
            seen = stats.seen_updated,
            upgraded = stats.legacy_upgraded,
            new = stats.new_user_events,
            created = stats.blocks_created,
            suppressed = stats.fanout_suppressed,
            "sync pass complete"
        );

        Ok(stats)
    }

    /// Cascade guard heuristic: when nearly everything recently seen on a
    /// calendar is a busy block, an incoming notification is most likely the
    /// echo of our own writes, so a webhook pass withholds fan-out.
    async fn should_suppress_fanout(ctx: &SyncContext, calendar_id: &str) -> AppResult<bool> {
        let recent = EventStateRepository::recent_for_calendar(
            &ctx.pool,
            calendar_id,
            ctx.config.sync.recent_window,
        )
        .await?;
        if recent.is_empty() {
            return Ok(false);
        }

        let busy = recent.iter().filter(|s| s.is_busy_block).count();
        let fraction = busy as f64 / recent.len() as f64;
        Ok(fraction > ctx.config.sync.busy_fraction_threshold)
    }
}
