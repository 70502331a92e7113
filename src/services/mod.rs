use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;

pub mod classifier;
pub mod coordinator;
pub mod credentials;
pub mod fanout;
pub mod google;
pub mod identity;
pub mod init;
pub mod locks;
pub mod reconciler;
pub mod remote;
pub mod teardown;

/// Everything a sync pass needs: the store plus the injected external
/// capabilities (remote calendar, credentials, distributed lock).
#[derive(Clone)]
pub struct SyncContext {
    pub pool: SqlitePool,
    pub client: Arc<dyn remote::CalendarClient>,
    pub credentials: Arc<dyn credentials::CredentialProvider>,
    pub locks: Arc<dyn locks::LockService>,
    pub config: Config,
}
