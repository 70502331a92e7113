use crate::db::models::{Calendar, EventState, EventStatus, NewEventState};
use crate::db::{AccountRepository, CalendarRepository, EventStateRepository};
use crate::error::{AppError, AppResult};
use crate::services::identity::IdentityCodec;
use crate::services::remote::RemoteEvent;
use crate::services::SyncContext;

/// Fan-out engine: turns one user event into busy-block placeholders on
/// every other eligible calendar of the same user. All writes are
/// database-first; a remote failure leaves a locally `deleted` row for the
/// reconciler to heal, never an untracked remote write.
pub struct FanOutEngine;

#[derive(Debug, Default, Clone)]
pub struct FanOutResult {
    pub targets_attempted: usize,
    pub blocks_created: usize,
    pub failures: usize,
}

impl FanOutEngine {
    /// Register a newly-classified user event and mirror it across the
    /// user's other calendars. Returns the created (or reused) source
    /// record and the per-target tally.
    pub async fn process_new_user_event(
        ctx: &SyncContext,
        source_token: &str,
        source_calendar: &Calendar,
        event: &RemoteEvent,
    ) -> AppResult<(EventState, FanOutResult)> {
        let remote_event_id = event
            .id
            .as_deref()
            .ok_or_else(|| AppError::Validation("remote event has no id".to_string()))?;
        let start_time = event.start_time.ok_or_else(|| {
            AppError::Validation(format!("event {} has no start time", remote_event_id))
        })?;
        let end_time = event.end_time.unwrap_or(start_time);

        // Re-processing an event whose identifier channels were stripped
        // remotely must not mint a second record for the same remote event.
        let source_state = match EventStateRepository::find_by_remote_event(
            &ctx.pool,
            &source_calendar.id,
            remote_event_id,
        )
        .await?
        {
            Some(existing) => existing,
            None => {
                let new = NewEventState::user_event(
                    &source_calendar.id,
                    remote_event_id,
                    None,
                    &IdentityCodec::clean_title(event.title_or_empty()),
                    start_time,
                    end_time,
                )?;
                EventStateRepository::insert(&ctx.pool, new).await?
            }
        };

        // Tag the source event remotely so every later sighting resolves to
        // this record. User events keep all three channels.
        let mut tagged = event.clone();
        IdentityCodec::embed(&mut tagged, &source_state.id, true);
        let patch = RemoteEvent {
            title: tagged.title,
            description: tagged.description,
            private_properties: tagged.private_properties,
            ..Default::default()
        };
        ctx.client
            .update_event(
                source_token,
                &source_calendar.remote_calendar_id,
                remote_event_id,
                &patch,
            )
            .await?;

        let result = Self::fan_out(ctx, &source_state, source_calendar).await?;
        Ok((source_state, result))
    }

    /// Mirror one source record onto every eligible sibling calendar.
    pub async fn fan_out(
        ctx: &SyncContext,
        source_state: &EventState,
        source_calendar: &Calendar,
    ) -> AppResult<FanOutResult> {
        let account = AccountRepository::find_by_id(&ctx.pool, &source_calendar.account_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("account {}", source_calendar.account_id))
            })?;

        let targets = CalendarRepository::list_eligible_for_user(&ctx.pool, &account.user_id)
            .await?
            .into_iter()
            .filter(|c| c.id != source_calendar.id)
            .collect::<Vec<_>>();

        let mut result = FanOutResult::default();
        for target in &targets {
            result.targets_attempted += 1;
            match Self::ensure_block_for_target(ctx, source_state, target).await {
                Ok(true) => result.blocks_created += 1,
                Ok(false) => {}
                Err(e) => {
                    result.failures += 1;
                    tracing::warn!(
                        source_event = %source_state.id,
                        target_calendar = %target.id,
                        "busy-block creation failed: {:?}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            source_event = %source_state.id,
            source_calendar = %source_calendar.id,
            targets = result.targets_attempted,
            created = result.blocks_created,
            failures = result.failures,
            "fan-out complete"
        );

        Ok(result)
    }

    /// The single-target creation path, shared with reconciler repair.
    ///
    /// Returns true when a busy block was created and synced. Safety check:
    /// never mirror a source that is itself a busy block or already deleted,
    /// which would start a busy-blocks-of-busy-blocks chain.
    pub async fn ensure_block_for_target(
        ctx: &SyncContext,
        source_state: &EventState,
        target: &Calendar,
    ) -> AppResult<bool> {
        if source_state.is_busy_block || source_state.status == EventStatus::Deleted {
            tracing::warn!(
                source_event = %source_state.id,
                target_calendar = %target.id,
                "refusing to mirror a busy block or deleted event"
            );
            return Ok(false);
        }

        let token = ctx.credentials.access_token(&target.account_id).await?;

        // Remove any stale block for this (source, target) pair before
        // creating, so re-processing can never duplicate.
        if let Some(stale) = EventStateRepository::find_by_source_and_calendar(
            &ctx.pool,
            &source_state.id,
            &target.id,
        )
        .await?
        {
            if let Some(remote_id) = stale.remote_event_id.as_deref() {
                if let Err(e) = ctx
                    .client
                    .delete_event(&token, &target.remote_calendar_id, remote_id)
                    .await
                {
                    tracing::warn!(
                        "Failed to delete stale busy block {} on {}: {:?}",
                        remote_id,
                        target.id,
                        e
                    );
                }
            }
            EventStateRepository::delete(&ctx.pool, &stale.id).await?;
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
        let block = EventStateRepository::insert(&ctx.pool, new).await?;

        let mut remote = RemoteEvent {
            title: Some(title),
            start_time: Some(source_state.start_time),
            end_time: Some(source_state.end_time),
            transparency: Some("opaque".to_string()),
            visibility: Some("private".to_string()),
            ..Default::default()
        };
        // Busy-block titles stay clean: no title-channel embedding.
        IdentityCodec::embed(&mut remote, &block.id, false);

        match ctx
            .client
            .create_event(&token, &target.remote_calendar_id, &remote)
            .await
        {
            Ok(created) => {
                let remote_id = created.id.as_deref().ok_or_else(|| {
                    AppError::RemoteApi("created event has no id".to_string())
                })?;
                EventStateRepository::mark_synced(&ctx.pool, &block.id, remote_id).await?;
                Ok(true)
            }
            Err(e) => {
                // Leave a deleted tombstone; the reconciler retries on its
                // next pass rather than retrying inline.
                EventStateRepository::mark_deleted(&ctx.pool, &block.id).await?;
                Err(e)
            }
        }
    }
}
