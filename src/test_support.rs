//! Shared test fixtures: in-memory database, fake external capabilities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::models::{Account, Calendar};
use crate::db::{AccountRepository, CalendarRepository};
use crate::error::{AppError, AppResult};
use crate::services::credentials::CredentialProvider;
use crate::services::locks::SqliteLockService;
use crate::services::remote::{CalendarClient, RemoteEvent};
use crate::services::SyncContext;

/// Fresh in-memory SQLite pool with migrations applied. Single connection so
/// every query sees the same database.
pub async fn setup_pool() -> SqlitePool {
    let options: SqliteConnectOptions = "sqlite::memory:"
        .parse()
        .expect("valid sqlite memory url");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("connect to in-memory sqlite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    pool
}

pub fn test_times() -> (NaiveDateTime, NaiveDateTime) {
    let start = Utc::now().naive_utc() + Duration::hours(1);
    (start, start + Duration::hours(1))
}

pub async fn create_account(pool: &SqlitePool, user_id: &str) -> Account {
    let expires = Utc::now().naive_utc() + Duration::hours(1);
    AccountRepository::create(
        pool,
        user_id,
        &format!("{}@example.com", user_id),
        "test-access-token",
        "test-refresh-token",
        expires,
    )
    .await
    .expect("create account")
}

pub async fn create_calendar(pool: &SqlitePool, account: &Account, remote_id: &str) -> Calendar {
    CalendarRepository::create(pool, &account.id, remote_id)
        .await
        .expect("create calendar")
}

/// One user with three enabled calendars on one account.
pub async fn three_calendar_user(pool: &SqlitePool) -> (Account, Calendar, Calendar, Calendar) {
    let account = create_account(pool, "user-1").await;
    let a = create_calendar(pool, &account, "remote-a").await;
    let b = create_calendar(pool, &account, "remote-b").await;
    let c = create_calendar(pool, &account, "remote-c").await;
    (account, a, b, c)
}

/// In-memory remote calendar: events keyed by remote calendar id.
#[derive(Default)]
pub struct FakeCalendarClient {
    calendars: Mutex<HashMap<String, Vec<RemoteEvent>>>,
    /// (remote calendar id, channel id) pairs registered via `watch_events`.
    watches: Mutex<Vec<(String, String)>>,
    next_id: AtomicU64,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FakeCalendarClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent create fail, to exercise remote-write failure
    /// handling.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent delete fail, to exercise best-effort cleanup.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn seed_event(&self, calendar_id: &str, event: RemoteEvent) {
        self.calendars
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .push(event);
    }

    pub fn watches(&self) -> Vec<(String, String)> {
        self.watches.lock().unwrap().clone()
    }

    pub fn events_on(&self, calendar_id: &str) -> Vec<RemoteEvent> {
        self.calendars
            .lock()
            .unwrap()
            .get(calendar_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CalendarClient for FakeCalendarClient {
    async fn list_events(
        &self,
        _token: &str,
        calendar_id: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> AppResult<Vec<RemoteEvent>> {
        Ok(self
            .events_on(calendar_id)
            .into_iter()
            .filter(|ev| match ev.start_time {
                Some(start) => start >= from && start <= to,
                None => true,
            })
            .collect())
    }

    async fn get_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> AppResult<Option<RemoteEvent>> {
        Ok(self
            .events_on(calendar_id)
            .into_iter()
            .find(|ev| ev.id.as_deref() == Some(event_id)))
    }

    async fn create_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(AppError::RemoteApi("simulated create failure".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut created = event.clone();
        created.id = Some(format!("fake-{}", n));

        self.calendars
            .lock()
            .unwrap()
            .entry(calendar_id.to_string())
            .or_default()
            .push(created.clone());

        Ok(created)
    }

    async fn update_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &RemoteEvent,
    ) -> AppResult<RemoteEvent> {
        let mut calendars = self.calendars.lock().unwrap();
        let events = calendars
            .get_mut(calendar_id)
            .ok_or_else(|| AppError::NotFound(format!("calendar {}", calendar_id)))?;
        let existing = events
            .iter_mut()
            .find(|ev| ev.id.as_deref() == Some(event_id))
            .ok_or_else(|| AppError::NotFound(format!("event {}", event_id)))?;

        // Patch semantics: only provided fields overwrite.
        if event.title.is_some() {
            existing.title = event.title.clone();
        }
        if event.description.is_some() {
            existing.description = event.description.clone();
        }
        if event.start_time.is_some() {
            existing.start_time = event.start_time;
        }
        if event.end_time.is_some() {
            existing.end_time = event.end_time;
        }
        if event.transparency.is_some() {
            existing.transparency = event.transparency.clone();
        }
        if event.visibility.is_some() {
            existing.visibility = event.visibility.clone();
        }
        for (k, v) in &event.private_properties {
            existing.private_properties.insert(k.clone(), v.clone());
        }

        Ok(existing.clone())
    }

    async fn delete_event(
        &self,
        _token: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> AppResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AppError::RemoteApi("simulated delete failure".to_string()));
        }

        if let Some(events) = self.calendars.lock().unwrap().get_mut(calendar_id) {
            events.retain(|ev| ev.id.as_deref() != Some(event_id));
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
            self.delete_event(token, calendar_id, event_id).await?;
        }
        Ok(())
    }

    async fn search_events(
        &self,
        _token: &str,
        calendar_id: &str,
        query: &str,
    ) -> AppResult<Vec<RemoteEvent>> {
        Ok(self
            .events_on(calendar_id)
            .into_iter()
            .filter(|ev| {
                ev.title_or_empty().contains(query) || ev.description_or_empty().contains(query)
            })
            .collect())
    }

    async fn watch_events(
        &self,
        _token: &str,
        calendar_id: &str,
        channel_id: &str,
        _address: &str,
    ) -> AppResult<()> {
        self.watches
            .lock()
            .unwrap()
            .push((calendar_id.to_string(), channel_id.to_string()));
        Ok(())
    }
}

pub struct FakeCredentialProvider;

#[async_trait]
impl CredentialProvider for FakeCredentialProvider {
    async fn access_token(&self, _account_id: &str) -> AppResult<String> {
        Ok("test-token".to_string())
    }
}

/// Assemble a `SyncContext` over the given pool and fake remote, with a zero
/// fan-out delay so tests run fast.
pub fn test_context(pool: SqlitePool, client: Arc<FakeCalendarClient>) -> SyncContext {
    let mut config = Config::default();
    config.sync.fanout_delay_seconds = 0;

    SyncContext {
        pool: pool.clone(),
        client,
        credentials: Arc::new(FakeCredentialProvider),
        locks: Arc::new(SqliteLockService::new(pool)),
        config,
    }
}

/// Full application state for route tests.
pub fn test_app_state(pool: SqlitePool, client: Arc<FakeCalendarClient>) -> Arc<crate::AppState> {
    let sync = test_context(pool.clone(), client);
    Arc::new(crate::AppState {
        db: pool,
        config: sync.config.clone(),
        sync,
    })
}
