use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{AppError, AppResult};

/// Lifecycle of an event record.
///
/// `Pending` exists only between the local write and the corresponding
/// remote write (database-first ordering); `Synced` once a remote event id
/// is recorded; `Deleted` once removed locally and, best effort, remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Synced,
    Deleted,
}

/// The authoritative local record for one remote event, user-created or
/// system-created. The row id is the correlation identifier embedded into
/// the remote event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventState {
    pub id: String,
    pub calendar_id: String,
    pub remote_event_id: Option<String>,
    pub is_busy_block: bool,
    pub source_event_id: Option<String>,
    pub status: EventStatus,
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl EventState {
    /// Core invariant: a busy block always points at the user event that
    /// spawned it, and a user event never has a source.
    pub fn check_invariant(&self) -> AppResult<()> {
        if self.is_busy_block != self.source_event_id.is_some() {
            return Err(AppError::Validation(format!(
                "event state {}: is_busy_block={} but source_event_id={:?}",
                self.id, self.is_busy_block, self.source_event_id
            )));
        }
        Ok(())
    }
}

/// Validated input for a new event state row.
#[derive(Debug, Clone)]
pub struct NewEventState {
    pub calendar_id: String,
    pub remote_event_id: Option<String>,
    pub is_busy_block: bool,
    pub source_event_id: Option<String>,
    pub status: EventStatus,
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

/// Source placeholder for busy blocks recovered from legacy text markers.
/// The original source event is unknowable; the placeholder keeps the
/// busy-block invariant intact while keeping the row out of fan-out and
/// audit arithmetic (it never joins against a real user event). The unique
/// (source, calendar) pair index exempts this value; see the schema
/// migration.
pub const LEGACY_SOURCE_PLACEHOLDER: &str = "legacy-unknown";

impl NewEventState {
    /// A user event sighted on a remote calendar. Fails fast if a source id
    /// is supplied: user events have no source.
    pub fn user_event(
        calendar_id: &str,
        remote_event_id: &str,
        source_event_id: Option<&str>,
        title: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    ) -> AppResult<Self> {
        if let Some(source) = source_event_id {
            return Err(AppError::Validation(format!(
                "user event must not carry a source event id (got {})",
                source
            )));
        }
        Ok(NewEventState {
            calendar_id: calendar_id.to_string(),
            remote_event_id: Some(remote_event_id.to_string()),
            is_busy_block: false,
            source_event_id: None,
            status: EventStatus::Synced,
            title: title.to_string(),
            start_time,
            end_time,
        })
    }

    /// A busy-block placeholder targeted at another calendar. Starts
    /// `Pending`; the remote write has not happened yet. Fails fast if the
    /// source id is absent.
    pub fn busy_block(
        calendar_id: &str,
        source_event_id: Option<&str>,
        title: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    ) -> AppResult<Self> {
        let source = source_event_id.ok_or_else(|| {
            AppError::Validation("busy block requires a source event id".to_string())
        })?;
        Ok(NewEventState {
            calendar_id: calendar_id.to_string(),
            remote_event_id: None,
            is_busy_block: true,
            source_event_id: Some(source.to_string()),
            status: EventStatus::Pending,
            title: title.to_string(),
            start_time,
            end_time,
        })
    }

    /// Retroactive record for a pre-identifier busy block discovered via
    /// legacy text markers. Already present remotely, so it starts `Synced`
    /// with the remote id recorded and the legacy source placeholder.
    pub fn upgraded_legacy(
        calendar_id: &str,
        remote_event_id: &str,
        title: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
    ) -> Self {
        NewEventState {
            calendar_id: calendar_id.to_string(),
            remote_event_id: Some(remote_event_id.to_string()),
            is_busy_block: true,
            source_event_id: Some(LEGACY_SOURCE_PLACEHOLDER.to_string()),
            status: EventStatus::Synced,
            title: title.to_string(),
            start_time,
            end_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn times() -> (NaiveDateTime, NaiveDateTime) {
        let start = Utc::now().naive_utc();
        (start, start + chrono::Duration::hours(1))
    }

    #[test]
    fn busy_block_without_source_is_rejected() {
        let (start, end) = times();
        let res = NewEventState::busy_block("cal-1", None, "Busy - X", start, end);
        assert!(matches!(res, Err(AppError::Validation(_))));
    }

    #[test]
    fn user_event_with_source_is_rejected() {
        let (start, end) = times();
        let res = NewEventState::user_event("cal-1", "rem-1", Some("u1"), "Standup", start, end);
        assert!(matches!(res, Err(AppError::Validation(_))));
    }

    #[test]
    fn busy_block_starts_pending() {
        let (start, end) = times();
        let new = NewEventState::busy_block("cal-2", Some("u1"), "Busy - Standup", start, end)
            .expect("valid busy block");
        assert_eq!(new.status, EventStatus::Pending);
        assert!(new.is_busy_block);
        assert!(new.remote_event_id.is_none());
    }

    #[test]
    fn user_event_starts_synced() {
        let (start, end) = times();
        let new = NewEventState::user_event("cal-1", "rem-1", None, "Standup", start, end)
            .expect("valid user event");
        assert_eq!(new.status, EventStatus::Synced);
        assert!(!new.is_busy_block);
        assert_eq!(new.remote_event_id.as_deref(), Some("rem-1"));
    }

    #[test]
    fn invariant_check_flags_mismatch() {
        let (start, end) = times();
        let row = EventState {
            id: "x".into(),
            calendar_id: "cal-1".into(),
            remote_event_id: None,
            is_busy_block: true,
            source_event_id: None,
            status: EventStatus::Pending,
            title: "Busy".into(),
            start_time: start,
            end_time: end,
            last_seen_at: start,
            created_at: start,
            updated_at: start,
        };
        assert!(row.check_invariant().is_err());
    }
}
