use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::StatusCode;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::Config;
use services::credentials::GoogleCredentialProvider;
use services::google::GoogleCalendarClient;
use services::locks::SqliteLockService;
use services::{init, SyncContext};

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub sync: SyncContext,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calbridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting CalBridge busy-block sync service");

    // Initialize database
    let pool = init::init_db(&config).await?;

    let sync = SyncContext {
        pool: pool.clone(),
        client: Arc::new(GoogleCalendarClient::new()),
        credentials: Arc::new(GoogleCredentialProvider::new(
            pool.clone(),
            config.google.client_id.clone(),
            config.google.client_secret.clone(),
        )),
        locks: Arc::new(SqliteLockService::new(pool.clone())),
        config: config.clone(),
    };

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        sync,
    });

    // Create shutdown notifier for background workers and std threads
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Rate limiter for the public webhook endpoint
    let mut webhooks_builder = GovernorConfigBuilder::default();
    webhooks_builder.per_second(config.rate_limit.webhook_per_second.into());
    webhooks_builder.burst_size(config.rate_limit.webhook_burst);
    webhooks_builder.key_extractor(SmartIpKeyExtractor);
    webhooks_builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                let retry_after = wait_time;
                let body = serde_json::json!({
                    "error": "rate_limit_exceeded",
                    "retry_after_seconds": retry_after
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;

                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }

                if let Ok(value) = http::HeaderValue::from_str(&retry_after.to_string()) {
                    resp.headers_mut().insert(http::header::RETRY_AFTER, value);
                }

                resp
            }
            GovernorError::UnableToExtractKey => {
                let mut resp = http::Response::new(Body::from(
                    "Unable to determine client IP for rate limiting",
                ));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
                let mut resp = http::Response::new(Body::from(body));
                let status = StatusCode::from_u16(code.as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                *resp.status_mut() = status;
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });
    let webhooks_gov_conf = Arc::new(
        webhooks_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build webhooks governor config"))?,
    );

    // Background cleanup for webhooks limiter storage
    let webhooks_cleaner = {
        let limiter = webhooks_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Webhooks rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("webhooks rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let webhooks_rate_layer = GovernorLayer {
        config: webhooks_gov_conf.clone(),
    };

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Calendar management (list, toggle, manual sync)
        .nest("/api/calendars", routes::calendars::router())
        // Manual sync over all eligible calendars
        .route("/api/sync", post(routes::calendars::sync_all))
        // Mirror audit / repair
        .nest("/api/audit", routes::audit::router())
        // Stuck-cleanup sweep
        .nest("/api/cleanup", routes::cleanup::router())
        // Google push notifications (apply rate limiting)
        .nest(
            "/webhooks",
            routes::webhooks::router().layer(webhooks_rate_layer),
        )
        // Add shared state
        .with_state(app_state.clone())
        // Add middleware
        .layer(TraceLayer::new_for_http());

    // Start server
    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{}:{}", host, port);

    tracing::info!("Server listening on {}", addr);

    // Start server using axum `serve` helper. We also spawn a signal listener
    // and select between the server future and the signal future. When a
    // shutdown signal is received we notify background workers and threads
    // and then drop the server future (which stops accepting new connections).
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    let shutdown_tx_clone = shutdown_tx.clone();
    let thread_shutdown_clone = thread_shutdown.clone();

    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to bind SIGTERM");
            tokio::select! {
                _ = ctrl_c => {},
                _ = term.recv() => {},
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("Failed to bind Ctrl+C");
        }

        tracing::info!("Shutdown signal received, notifying background workers and threads");
        let _ = shutdown_tx_clone.send(());
        thread_shutdown_clone.store(true, Ordering::SeqCst);
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Give background workers some time to finish their work.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    let _ = tokio::time::timeout(shutdown_wait, bg_wait).await;

    if let Err(e) = webhooks_cleaner.join() {
        tracing::warn!("Webhooks cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
