use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::models::Calendar;
use crate::db::CalendarRepository;
use crate::error::{AppError, AppResult};
use crate::services::coordinator::{SyncCoordinator, SyncOutcome, SyncTrigger};
use crate::services::teardown::TeardownEngine;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_calendars))
        .route("/:id/toggle", post(toggle_calendar))
        .route("/:id/sync", post(sync_calendar))
        .route("/:id/watch", post(watch_calendar))
}

async fn list_calendars(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<Calendar>>> {
    let calendars = CalendarRepository::list_all(&state.db).await?;
    Ok(Json(calendars))
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

/// Enable or disable mirroring for one calendar. Disabling queues the
/// teardown; both directions are rejected with 409 while a teardown is
/// still pending.
async fn toggle_calendar(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> AppResult<Json<Calendar>> {
    let calendar = if body.enabled {
        TeardownEngine::enable(&state.sync, &id).await?
    } else {
        TeardownEngine::disable(&state.sync, &id).await?
    };
    Ok(Json(calendar))
}

/// Manually trigger a sync pass for one calendar.
async fn sync_calendar(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let calendar = CalendarRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("calendar {}", id)))?;
    if !calendar.enabled {
        return Err(AppError::BadRequest(format!(
            "calendar {} is disabled",
            id
        )));
    }

    match SyncCoordinator::run_pass(&state.sync, &id, SyncTrigger::Manual).await? {
        SyncOutcome::Skipped => Ok(Json(json!({ "status": "skipped" }))),
        SyncOutcome::Completed(stats) => {
            Ok(Json(json!({ "status": "completed", "stats": stats })))
        }
    }
}

/// Register a Google push notification channel for one calendar, so remote
/// edits arrive as webhook notices instead of waiting for the next
/// scheduled pass.
async fn watch_calendar(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let calendar = CalendarRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("calendar {}", id)))?;
    if !calendar.enabled {
        return Err(AppError::BadRequest(format!(
            "calendar {} is disabled",
            id
        )));
    }

    let channel_id = uuid::Uuid::new_v4().to_string();
    let address = format!("{}/webhooks/google", state.config.server.webhook_url);
    let token = state
        .sync
        .credentials
        .access_token(&calendar.account_id)
        .await?;
    state
        .sync
        .client
        .watch_events(&token, &calendar.remote_calendar_id, &channel_id, &address)
        .await?;
    CalendarRepository::set_webhook_channel(&state.db, &id, Some(&channel_id)).await?;

    tracing::info!(calendar_id = %id, channel_id, "webhook channel registered");
    Ok(Json(json!({ "channel_id": channel_id })))
}

/// Run a manual pass over every eligible calendar, aggregating per-calendar
/// results. Individual failures do not abort the remaining calendars.
pub async fn sync_all(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let calendars = CalendarRepository::list_eligible(&state.db).await?;

    let mut results = Vec::with_capacity(calendars.len());
    for calendar in &calendars {
        let entry = match SyncCoordinator::run_pass(&state.sync, &calendar.id, SyncTrigger::Manual)
            .await
        {
            Ok(SyncOutcome::Skipped) => json!({
                "calendar_id": calendar.id,
                "status": "skipped",
            }),
            Ok(SyncOutcome::Completed(stats)) => json!({
                "calendar_id": calendar.id,
                "status": "completed",
                "stats": stats,
            }),
            Err(e) => {
                tracing::warn!("Manual sync failed for calendar {}: {:?}", calendar.id, e);
                json!({
                    "calendar_id": calendar.id,
                    "status": "failed",
                })
            }
        };
        results.push(entry);
    }

    Ok(Json(json!({ "calendars": results })))
}
