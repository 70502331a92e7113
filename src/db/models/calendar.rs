use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One sync unit: a single remote calendar belonging to an account.
///
/// Only calendars with `enabled = true` whose owning account is active are
/// eligible fan-out sources or targets. `cleanup_pending` marks a disabled
/// calendar whose asynchronous teardown has not finished yet; while it is
/// set the calendar may not be re-enabled.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    pub remote_calendar_id: String,
    pub enabled: bool,
    pub cleanup_pending: bool,
    pub cleanup_requested_at: Option<NaiveDateTime>,
    pub webhook_channel_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
