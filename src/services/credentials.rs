use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db::AccountRepository;
use crate::error::{AppError, AppResult};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

// Refresh this many seconds before the stored token expires.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Supplies a currently-valid access token for a calendar's owning account.
///
/// Failure is a hard stop for that calendar's sync pass; the pass is skipped
/// and retried on the next trigger.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, account_id: &str) -> AppResult<String>;
}

#[derive(Debug, Deserialize)]
struct RefreshTokenResponse {
    access_token: String,
    expires_in: i64,
    /// Google omits this when the refresh token is unchanged.
    refresh_token: Option<String>,
}

/// Google OAuth credential provider backed by the `accounts` table.
/// Rotated tokens are persisted before being returned.
pub struct GoogleCredentialProvider {
    pool: SqlitePool,
    client: Client,
    client_id: String,
    client_secret: String,
}

impl GoogleCredentialProvider {
    pub fn new(pool: SqlitePool, client_id: String, client_secret: String) -> Self {
        GoogleCredentialProvider {
            pool,
            client: Client::new(),
            client_id,
            client_secret,
        }
    }

    async fn refresh(&self, refresh_token: &str) -> AppResult<RefreshTokenResponse> {
        let response = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Credential(format!(
                "Failed to refresh token: {}",
                error_text
            )));
        }

        response
            .json::<RefreshTokenResponse>()
            .await
            .map_err(|e| AppError::Credential(format!("Failed to parse token response: {}", e)))
    }
}

#[async_trait]
impl CredentialProvider for GoogleCredentialProvider {
    async fn access_token(&self, account_id: &str) -> AppResult<String> {
        let account = AccountRepository::find_by_id(&self.pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("account {}", account_id)))?;

        if !account.is_active {
            return Err(AppError::Credential(format!(
                "account {} is inactive",
                account_id
            )));
        }

        let margin = Utc::now().naive_utc() + Duration::seconds(REFRESH_MARGIN_SECS);
        if account.token_expires_at > margin {
            return Ok(account.access_token);
        }

        tracing::info!("Refreshing access token for account {}", account_id);
        let refreshed = self.refresh(&account.refresh_token).await?;

        let expires_at = Utc::now().naive_utc() + Duration::seconds(refreshed.expires_in);
        let new_refresh_token = refreshed
            .refresh_token
            .as_deref()
            .unwrap_or(&account.refresh_token);

        AccountRepository::update_tokens(
            &self.pool,
            &account.id,
            &refreshed.access_token,
            new_refresh_token,
            expires_at,
        )
        .await?;

        Ok(refreshed.access_token)
    }
}
