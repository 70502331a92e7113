use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub google: GoogleConfig,
    pub rate_limit: RateLimitConfig,
    pub sync: SyncConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL this service is reachable at; used when registering
    /// Google push notification channels.
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the webhook endpoint
    pub webhook_per_second: u32,
    /// Burst size for the webhook endpoint
    pub webhook_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// How often (seconds) the scheduled sync worker walks all enabled calendars.
    pub interval_seconds: u64,
    /// Lock TTL (seconds) for webhook-triggered passes.
    pub webhook_lock_ttl_seconds: i64,
    /// Lock TTL (seconds) for scheduled and manual passes.
    pub scheduled_lock_ttl_seconds: i64,
    /// Delay (seconds) before cross-calendar writes after a pass classifies events.
    pub fanout_delay_seconds: u64,
    /// How many recently-seen events the cascade-guard heuristic inspects.
    pub recent_window: i64,
    /// Busy-block fraction above which a webhook pass skips fan-out.
    pub busy_fraction_threshold: f64,
    /// Remote listing window: days in the past.
    pub window_past_days: i64,
    /// Remote listing window: days in the future.
    pub window_future_days: i64,
    /// Whether the legacy text-marker upgrade rule is still active.
    pub legacy_upgrade_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// How often (seconds) the cleanup worker polls for pending teardowns.
    pub interval_seconds: u64,
    /// Minimum age (seconds) of a cleanup request before it may run, to avoid
    /// racing an in-flight sync pass.
    pub min_age_seconds: i64,
    /// Age (seconds) past which a still-pending cleanup flag is considered stuck.
    pub stuck_timeout_seconds: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                webhook_url: env::var("WEBHOOK_URL")
                    .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/calbridge.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            google: GoogleConfig {
                client_id: env::var("GOOGLE_CLIENT_ID")
                    .map_err(|_| ConfigError::MissingEnv("GOOGLE_CLIENT_ID".to_string()))?,
                client_secret: env::var("GOOGLE_CLIENT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("GOOGLE_CLIENT_SECRET".to_string()))?,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: env::var("RATE_LIMIT_WEBHOOKS_PER_SECOND")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                webhook_burst: env::var("RATE_LIMIT_WEBHOOKS_BURST")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
            sync: SyncConfig {
                interval_seconds: env::var("SYNC_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
                webhook_lock_ttl_seconds: env::var("SYNC_WEBHOOK_LOCK_TTL_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
                scheduled_lock_ttl_seconds: env::var("SYNC_SCHEDULED_LOCK_TTL_SECONDS")
                    .unwrap_or_else(|_| "90".to_string())
                    .parse()
                    .unwrap_or(90),
                fanout_delay_seconds: env::var("SYNC_FANOUT_DELAY_SECONDS")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                recent_window: env::var("SYNC_RECENT_WINDOW")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                busy_fraction_threshold: env::var("SYNC_BUSY_FRACTION_THRESHOLD")
                    .unwrap_or_else(|_| "0.8".to_string())
                    .parse()
                    .unwrap_or(0.8),
                window_past_days: env::var("SYNC_WINDOW_PAST_DAYS")
                    .unwrap_or_else(|_| "7".to_string())
                    .parse()
                    .unwrap_or(7),
                window_future_days: env::var("SYNC_WINDOW_FUTURE_DAYS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                legacy_upgrade_enabled: match env::var("SYNC_LEGACY_UPGRADE_ENABLED") {
                    Ok(v) => match v.to_lowercase().as_str() {
                        "1" | "true" | "yes" => true,
                        "0" | "false" | "no" => false,
                        _ => true,
                    },
                    Err(_) => true,
                },
            },
            cleanup: CleanupConfig {
                interval_seconds: env::var("CLEANUP_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                min_age_seconds: env::var("CLEANUP_MIN_AGE_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                stuck_timeout_seconds: env::var("CLEANUP_STUCK_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                webhook_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/calbridge.db".to_string(),
                max_connections: 5,
            },
            google: GoogleConfig {
                client_id: String::new(),
                client_secret: String::new(),
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 10,
                webhook_burst: 50,
            },
            sync: SyncConfig {
                interval_seconds: 300,
                webhook_lock_ttl_seconds: 120,
                scheduled_lock_ttl_seconds: 90,
                fanout_delay_seconds: 2,
                recent_window: 10,
                busy_fraction_threshold: 0.8,
                window_past_days: 7,
                window_future_days: 60,
                legacy_upgrade_enabled: true,
            },
            cleanup: CleanupConfig {
                interval_seconds: 60,
                min_age_seconds: 60,
                stuck_timeout_seconds: 3600,
            },
        }
    }
}
