use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A remote calendar event as this service sees it, provider-agnostic.
///
/// Every field the provider may omit is optional; the identity codec reads
/// and writes `private_properties`, `description` and `title`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    /// "opaque" blocks time, "transparent" does not. Busy blocks are opaque.
    pub transparency: Option<String>,
    pub visibility: Option<String>,
    pub status: Option<String>,
    pub private_properties: HashMap<String, String>,
}

impl RemoteEvent {
    pub fn title_or_empty(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }

    pub fn description_or_empty(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    /// Cancelled remote events are tombstones; they carry no times.
    pub fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }
}

/// Remote calendar operations the sync core depends on.
///
/// The production implementation talks to the Google Calendar API; tests
/// substitute an in-memory fake. All methods take a bearer token obtained
/// from the credential provider.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// List events within a time window.
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> AppResult<Vec<RemoteEvent>>;

    async fn get_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> AppResult<Option<RemoteEvent>>;

    /// Create an event; the returned value carries the provider-assigned id.
    async fn create_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent>;

    /// Partial update of an existing event.
    async fn update_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent>;

    async fn delete_event(&self, token: &str, calendar_id: &str, event_id: &str) -> AppResult<()>;

    /// Best-effort bulk delete; individual failures are logged, not fatal.
    async fn batch_delete(
        &self,
        token: &str,
        calendar_id: &str,
        event_ids: &[String],
    ) -> AppResult<()>;

    /// Free-text search, used to locate legacy-tagged events.
    async fn search_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &str,
    ) -> AppResult<Vec<RemoteEvent>>;

    /// Register a push notification channel delivering change notices for
    /// the calendar to `address`.
    async fn watch_events(
        &self,
        token: &str,
        calendar_id: &str,
        channel_id: &str,
        address: &str,
    ) -> AppResult<()>;
}
