use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::remote::{CalendarClient, RemoteEvent};

const GOOGLE_CALENDAR_API_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Google Calendar API v3 client.
#[derive(Debug, Clone)]
pub struct GoogleCalendarClient {
    client: Client,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<GoogleEventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<GoogleEventDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<GoogleExtendedProperties>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleEventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    /// All-day events carry a date only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleExtendedProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct GoogleEventsResponse {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

// ============================================================================
// Conversions
// ============================================================================

fn parse_event_time(value: &GoogleEventDateTime) -> Option<NaiveDateTime> {
    if let Some(dt) = value.date_time.as_deref() {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(dt) {
            return Some(parsed.with_timezone(&Utc).naive_utc());
        }
    }
    if let Some(date) = value.date.as_deref() {
        if let Ok(parsed) = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            return parsed.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn to_event_time(value: NaiveDateTime) -> GoogleEventDateTime {
    GoogleEventDateTime {
        date_time: Some(
            DateTime::<Utc>::from_naive_utc_and_offset(value, Utc).to_rfc3339(),
        ),
        date: None,
        time_zone: Some("UTC".to_string()),
    }
}

impl From<GoogleEvent> for RemoteEvent {
    fn from(g: GoogleEvent) -> Self {
        RemoteEvent {
            id: g.id,
            title: g.summary,
            description: g.description,
            start_time: g.start.as_ref().and_then(parse_event_time),
            end_time: g.end.as_ref().and_then(parse_event_time),
            transparency: g.transparency,
            visibility: g.visibility,
            status: g.status,
            private_properties: g
                .extended_properties
                .and_then(|p| p.private)
                .unwrap_or_default(),
        }
    }
}

impl From<&RemoteEvent> for GoogleEvent {
    fn from(ev: &RemoteEvent) -> Self {
        GoogleEvent {
            id: None,
            summary: ev.title.clone(),
            description: ev.description.clone(),
            start: ev.start_time.map(to_event_time),
            end: ev.end_time.map(to_event_time),
            transparency: ev.transparency.clone(),
            visibility: ev.visibility.clone(),
            status: None,
            extended_properties: if ev.private_properties.is_empty() {
                None
            } else {
                Some(GoogleExtendedProperties {
                    private: Some(ev.private_properties.clone()),
                })
            },
        }
    }
}

// ============================================================================
// Client
// ============================================================================

impl GoogleCalendarClient {
    pub fn new() -> Self {
        GoogleCalendarClient {
            client: Client::new(),
        }
    }

    fn events_url(calendar_id: &str) -> String {
        format!("{}/calendars/{}/events", GOOGLE_CALENDAR_API_URL, calendar_id)
    }

    fn event_url(calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/calendars/{}/events/{}",
            GOOGLE_CALENDAR_API_URL, calendar_id, event_id
        )
    }

    /// Send a request, retrying on 429 and 5xx with exponential backoff.
    async fn send_with_backoff<F>(&self, make_request: F) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        const MAX_RETRIES: usize = 5;
        let mut backoff_secs: u64 = 1;
        let max_backoff_secs: u64 = 60;

        for attempt in 0..MAX_RETRIES {
            match (make_request)().send().await {
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        || resp.status().is_server_error()
                    {
                        // Respect Retry-After header if present
                        let mut wait_secs = backoff_secs;
                        if let Some(h) = resp.headers().get("retry-after") {
                            if let Ok(s) = h.to_str() {
                                if let Ok(parsed) = s.parse::<u64>() {
                                    wait_secs = parsed;
                                }
                            }
                        }

                        tracing::warn!(
                            "Transient Google Calendar error (status: {}). Retrying in {}s (attempt {}/{})",
                            resp.status(),
                            wait_secs,
                            attempt + 1,
                            MAX_RETRIES
                        );

                        if attempt + 1 >= MAX_RETRIES {
                            let err_text = resp.text().await.unwrap_or_default();
                            return Err(AppError::RemoteApi(format!(
                                "Failed after {} attempts: {}",
                                attempt + 1,
                                err_text
                            )));
                        }

                        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
                        backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                        continue;
                    }

                    // Return response even for non-200 (caller decides how to handle 401/404/etc.)
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    tracing::warn!(
                        "HTTP request failed: {}. Retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = std::cmp::min(backoff_secs * 2, max_backoff_secs);
                }
            }
        }

        Err(AppError::RemoteApi("Retry loop exhausted".to_string()))
    }

    async fn list_page(
        &self,
        token: &str,
        calendar_id: &str,
        query: &[(&str, String)],
    ) -> AppResult<GoogleEventsResponse> {
        let response = self
            .send_with_backoff(|| {
                self.client
                    .get(Self::events_url(calendar_id))
                    .bearer_auth(token)
                    .query(query)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to list events for {}: {}",
                calendar_id, error_text
            )));
        }

        response
            .json::<GoogleEventsResponse>()
            .await
            .map_err(|e| AppError::RemoteApi(format!("Failed to parse events response: {}", e)))
    }

    async fn list_all_pages(
        &self,
        token: &str,
        calendar_id: &str,
        base_query: Vec<(&str, String)>,
    ) -> AppResult<Vec<RemoteEvent>> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = base_query.clone();
            if let Some(ref t) = page_token {
                query.push(("pageToken", t.clone()));
            }

            let page = self.list_page(token, calendar_id, &query).await?;
            events.extend(page.items.into_iter().map(RemoteEvent::from));

            match page.next_page_token {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }

        Ok(events)
    }
}

impl Default for GoogleCalendarClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CalendarClient for GoogleCalendarClient {
    async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> AppResult<Vec<RemoteEvent>> {
        let query = vec![
            ("timeMin", to_event_time(from).date_time.unwrap_or_default()),
            ("timeMax", to_event_time(to).date_time.unwrap_or_default()),
            ("singleEvents", "true".to_string()),
            ("maxResults", "2500".to_string()),
        ];
        self.list_all_pages(token, calendar_id, query).await
    }

    async fn get_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> AppResult<Option<RemoteEvent>> {
        let response = self
            .send_with_backoff(|| {
                self.client
                    .get(Self::event_url(calendar_id, event_id))
                    .bearer_auth(token)
            })
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::GONE
        {
            return Ok(None);
        }
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to get event {}: {}",
                event_id, error_text
            )));
        }

        let event = response
            .json::<GoogleEvent>()
            .await
            .map_err(|e| AppError::RemoteApi(format!("Failed to parse event response: {}", e)))?;

        Ok(Some(event.into()))
    }

    async fn create_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent> {
        let payload = GoogleEvent::from(event);
        let response = self
            .send_with_backoff(|| {
                self.client
                    .post(Self::events_url(calendar_id))
                    .bearer_auth(token)
                    .json(&payload)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to create event on {}: {}",
                calendar_id, error_text
            )));
        }

        let created = response
            .json::<GoogleEvent>()
            .await
            .map_err(|e| AppError::RemoteApi(format!("Failed to parse event response: {}", e)))?;

        Ok(created.into())
    }

    async fn update_event(
        &self,
        token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent> {
        let payload = GoogleEvent::from(event);
        let response = self
            .send_with_backoff(|| {
                self.client
                    .patch(Self::event_url(calendar_id, event_id))
                    .bearer_auth(token)
                    .json(&payload)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to update event {}: {}",
                event_id, error_text
            )));
        }

        let updated = response
            .json::<GoogleEvent>()
            .await
            .map_err(|e| AppError::RemoteApi(format!("Failed to parse event response: {}", e)))?;

        Ok(updated.into())
    }

    async fn delete_event(&self, token: &str, calendar_id: &str, event_id: &str) -> AppResult<()> {
        let response = self
            .send_with_backoff(|| {
                self.client
                    .delete(Self::event_url(calendar_id, event_id))
                    .bearer_auth(token)
            })
            .await?;

        // Already gone is success for our purposes.
        if response.status() == reqwest::StatusCode::NOT_FOUND
            || response.status() == reqwest::StatusCode::GONE
        {
            return Ok(());
        }
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to delete event {}: {}",
                event_id, error_text
            )));
        }

        Ok(())
    }

    async fn batch_delete(
        &self,
        token: &str,
        calendar_id: &str,
        event_ids: &[String],
    ) -> AppResult<()> {
        for event_id in event_ids {
            if let Err(e) = self.delete_event(token, calendar_id, event_id).await {
                tracing::warn!(
                    "Best-effort delete of event {} on {} failed: {:?}",
                    event_id,
                    calendar_id,
                    e
                );
            }
        }
        Ok(())
    }

    async fn search_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &str,
    ) -> AppResult<Vec<RemoteEvent>> {
        let query = vec![
            ("q", query.to_string()),
            ("singleEvents", "true".to_string()),
            ("maxResults", "2500".to_string()),
        ];
        self.list_all_pages(token, calendar_id, query).await
    }

    async fn watch_events(
        &self,
        token: &str,
        calendar_id: &str,
        channel_id: &str,
        address: &str,
    ) -> AppResult<()> {
        let payload = serde_json::json!({
            "id": channel_id,
            "type": "web_hook",
            "address": address,
        });
        let response = self
            .send_with_backoff(|| {
                self.client
                    .post(format!("{}/watch", Self::events_url(calendar_id)))
                    .bearer_auth(token)
                    .json(&payload)
            })
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::RemoteApi(format!(
                "Failed to register watch channel on {}: {}",
                calendar_id, error_text
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_time_round_trips_through_rfc3339() {
        let start = chrono::NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        let wire = to_event_time(start);
        assert_eq!(parse_event_time(&wire), Some(start));
    }

    #[test]
    fn all_day_events_parse_to_midnight() {
        let wire = GoogleEventDateTime {
            date_time: None,
            date: Some("2026-03-14".to_string()),
            time_zone: None,
        };
        let parsed = parse_event_time(&wire).unwrap();
        assert_eq!(parsed.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn private_properties_survive_conversion() {
        let mut ev = RemoteEvent {
            title: Some("Busy - X".to_string()),
            ..Default::default()
        };
        ev.private_properties
            .insert("calbridge_id".to_string(), "abc".to_string());

        let wire = GoogleEvent::from(&ev);
        let back = RemoteEvent::from(wire);
        assert_eq!(back.private_properties.get("calbridge_id").unwrap(), "abc");
    }
}
