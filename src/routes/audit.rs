use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::AppResult;
use crate::services::reconciler::{AuditReport, LegacyScanReport, Reconciler, RepairReport};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:user_id", get(audit_user))
        .route("/:user_id/repair", post(repair_user))
        .route("/:user_id/legacy", get(scan_legacy))
}

/// Mirror-completeness matrix for one user's calendars.
async fn audit_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<AuditReport>> {
    let report = Reconciler::audit(&state.sync, &user_id).await?;
    Ok(Json(report))
}

/// Recreate every missing busy block for one user.
async fn repair_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<RepairReport>> {
    let report = Reconciler::repair(&state.sync, &user_id).await?;
    Ok(Json(report))
}

/// Count remote events still carrying legacy text markers, as input to
/// retiring the legacy-upgrade rule.
async fn scan_legacy(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> AppResult<Json<LegacyScanReport>> {
    let report = Reconciler::scan_legacy(&state.sync, &user_id).await?;
    Ok(Json(report))
}
