use crate::db::models::{Calendar, NewEventState};
use crate::db::EventStateRepository;
use crate::error::{AppError, AppResult};
use crate::services::identity::IdentityCodec;
use crate::services::remote::RemoteEvent;
use crate::services::SyncContext;

/// Outcome of classifying one fetched remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The event is one of our busy blocks; touch and stop. This is the
    /// cascade-prevention decision point.
    SkipOurEvent,
    /// Known (or unknown-but-tagged) user content; sighting recorded, no
    /// fan-out needed.
    UpdateSeen,
    /// A pre-identifier legacy item; a fresh identifier was embedded and a
    /// retroactive record created.
    UpgradeLegacy { correlation_id: String },
    /// New user content: hand off to the fan-out engine.
    ProcessNewUserEvent,
}

pub struct Classifier;

impl Classifier {
    /// Decide what one remote event is. Anything this service wrote is
    /// recognized before falling through to "new user event", so its own
    /// writes never re-enter fan-out as long as one identifier channel
    /// round-trips.
    pub async fn classify(
        ctx: &SyncContext,
        token: &str,
        calendar: &Calendar,
        event: &RemoteEvent,
    ) -> AppResult<Classification> {
        // Reads all three channels and logs partial-write inconsistencies.
        let report = IdentityCodec::validate(event);

        if let Some(correlation_id) = report.resolved() {
            return match EventStateRepository::find_by_id(&ctx.pool, correlation_id).await? {
                Some(state) if state.is_busy_block => {
                    EventStateRepository::touch(&ctx.pool, &state.id).await?;
                    Ok(Classification::SkipOurEvent)
                }
                Some(state) => {
                    // Carries our identifier but is recorded as a user
                    // event. Treat as seen, never as new.
                    EventStateRepository::touch(&ctx.pool, &state.id).await?;
                    Ok(Classification::UpdateSeen)
                }
                None => {
                    tracing::debug!(
                        calendar_id = %calendar.id,
                        correlation_id,
                        "identifier with no matching record; recording sighting only"
                    );
                    Ok(Classification::UpdateSeen)
                }
            };
        }

        if ctx.config.sync.legacy_upgrade_enabled && IdentityCodec::has_legacy_markers(event) {
            let correlation_id = Self::upgrade_legacy(ctx, token, calendar, event).await?;
            return Ok(Classification::UpgradeLegacy { correlation_id });
        }

        Ok(Classification::ProcessNewUserEvent)
    }

    /// Migrate a legacy-tagged event to identifier-based recognition:
    /// record it locally, then embed the record's id remotely without
    /// changing visible content.
    async fn upgrade_legacy(
        ctx: &SyncContext,
        token: &str,
        calendar: &Calendar,
        event: &RemoteEvent,
    ) -> AppResult<String> {
        let remote_event_id = event.id.as_deref().ok_or_else(|| {
            AppError::Correlation("legacy event has no remote id".to_string())
        })?;
        let start_time = event.start_time.ok_or_else(|| {
            AppError::Validation(format!("legacy event {} has no start time", remote_event_id))
        })?;
        let end_time = event.end_time.unwrap_or(start_time);

        // An earlier upgrade may have recorded the row and then failed the
        // remote embed; reuse that row and retry the embed instead of
        // minting another record for the same remote event.
        let state = match EventStateRepository::find_by_remote_event(
            &ctx.pool,
            &calendar.id,
            remote_event_id,
        )
        .await?
        {
            Some(existing) => existing,
            None => {
                let new = NewEventState::upgraded_legacy(
                    &calendar.id,
                    remote_event_id,
                    event.title_or_empty(),
                    start_time,
                    end_time,
                );
                EventStateRepository::insert(&ctx.pool, new).await?
            }
        };

        let mut tagged = event.clone();
        IdentityCodec::embed(&mut tagged, &state.id, true);

        let patch = RemoteEvent {
            title: tagged.title,
            description: tagged.description,
            private_properties: tagged.private_properties,
            ..Default::default()
        };
        ctx.client
            .update_event(token, &calendar.remote_calendar_id, remote_event_id, &patch)
            .await?;

        tracing::info!(
            calendar_id = %calendar.id,
            remote_event_id,
            correlation_id = %state.id,
            "upgraded legacy event to identifier-based tracking"
        );

        Ok(state.id)
    }
}
