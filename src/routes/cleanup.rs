use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde_json::json;

use crate::error::AppResult;
use crate::services::teardown::TeardownEngine;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/sweep", post(sweep))
}

/// Operator escape hatch: clear cleanup flags stuck past the timeout
/// without waiting for the next worker tick.
async fn sweep(State(state): State<Arc<AppState>>) -> AppResult<Json<serde_json::Value>> {
    let cleared = TeardownEngine::sweep_stuck(&state.sync).await?;
    Ok(Json(json!({ "cleared": cleared })))
}
