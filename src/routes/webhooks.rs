use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};

use crate::db::CalendarRepository;
use crate::services::coordinator::{SyncCoordinator, SyncOutcome, SyncTrigger};
use crate::AppState;

const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";

/// Channel handshake sent when a watch is first registered; carries no
/// change to process.
const RESOURCE_STATE_SYNC: &str = "sync";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/google", post(handle_google_webhook))
}

/// Google push notification entry point.
///
/// Always answers 200: any non-2xx makes Google retry with backoff and
/// eventually drop the channel, which costs more than an occasionally lost
/// notification (the scheduled pass covers the gap). Failures only get
/// logged.
async fn handle_google_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> StatusCode {
    let channel_id = headers
        .get(CHANNEL_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let resource_state = headers
        .get(RESOURCE_STATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("exists");

    if resource_state == RESOURCE_STATE_SYNC {
        tracing::debug!(channel_id, "webhook channel handshake acknowledged");
        return StatusCode::OK;
    }

    let channel_id = match channel_id {
        Some(id) => id,
        None => {
            tracing::warn!("webhook notification without a channel id header");
            return StatusCode::OK;
        }
    };

    let calendar = match CalendarRepository::find_by_webhook_channel(&state.db, channel_id).await {
        Ok(Some(calendar)) => calendar,
        Ok(None) => {
            tracing::debug!(channel_id, "notification for an unknown channel; ignoring");
            return StatusCode::OK;
        }
        Err(e) => {
            tracing::warn!(channel_id, "channel lookup failed: {:?}", e);
            return StatusCode::OK;
        }
    };

    match SyncCoordinator::run_pass(&state.sync, &calendar.id, SyncTrigger::Webhook).await {
        Ok(SyncOutcome::Skipped) => {
            tracing::debug!(
                calendar_id = %calendar.id,
                "webhook pass skipped (calendar locked or ineligible)"
            );
        }
        Ok(SyncOutcome::Completed(_)) => {}
        Err(e) => {
            tracing::warn!(calendar_id = %calendar.id, "webhook-triggered sync failed: {:?}", e);
        }
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use crate::db::CalendarRepository;
    use crate::test_support::{
        setup_pool, test_app_state, three_calendar_user, FakeCalendarClient,
    };

    fn app(state: Arc<crate::AppState>) -> axum::Router {
        axum::Router::new()
            .nest("/webhooks", super::router())
            .with_state(state)
    }

    #[tokio::test]
    async fn webhook_returns_200_without_headers() {
        let pool = setup_pool().await;
        let state = test_app_state(pool, Arc::new(FakeCalendarClient::new()));

        let response = app(state)
            .oneshot(
                Request::post("/webhooks/google")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_returns_200_for_unknown_channel() {
        let pool = setup_pool().await;
        let state = test_app_state(pool, Arc::new(FakeCalendarClient::new()));

        let response = app(state)
            .oneshot(
                Request::post("/webhooks/google")
                    .header("X-Goog-Channel-ID", "no-such-channel")
                    .header("X-Goog-Resource-State", "exists")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_returns_200_when_the_calendar_is_locked() {
        let pool = setup_pool().await;
        let (_, a, _, _) = three_calendar_user(&pool).await;
        let state = test_app_state(pool.clone(), Arc::new(FakeCalendarClient::new()));

        CalendarRepository::set_webhook_channel(&pool, &a.id, Some("chan-a"))
            .await
            .unwrap();
        state.sync.locks.acquire(&a.id, 90).await.unwrap().unwrap();

        let response = app(state)
            .oneshot(
                Request::post("/webhooks/google")
                    .header("X-Goog-Channel-ID", "chan-a")
                    .header("X-Goog-Resource-State", "exists")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handshake_is_acknowledged_without_a_pass() {
        let pool = setup_pool().await;
        let (_, a, _, _) = three_calendar_user(&pool).await;
        let state = test_app_state(pool.clone(), Arc::new(FakeCalendarClient::new()));

        CalendarRepository::set_webhook_channel(&pool, &a.id, Some("chan-a"))
            .await
            .unwrap();

        let response = app(state)
            .oneshot(
                Request::post("/webhooks/google")
                    .header("X-Goog-Channel-ID", "chan-a")
                    .header("X-Goog-Resource-State", "sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
