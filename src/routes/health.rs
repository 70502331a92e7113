use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub timestamp: String,
}

/// Liveness plus a database probe: the service is useless without its event
/// state store, so a failed probe reports 503.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
    {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!("health check database probe failed: {:?}", e);
            "unavailable"
        }
    };

    let healthy = database == "ok";
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::test_support::{setup_pool, test_app_state, FakeCalendarClient};

    #[tokio::test]
    async fn health_reports_database_status() {
        let pool = setup_pool().await;
        let state = test_app_state(pool, Arc::new(FakeCalendarClient::new()));
        let app = axum::Router::new()
            .route("/health", axum::routing::get(super::health_check))
            .with_state(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["database"], "ok");
    }
}
