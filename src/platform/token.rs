//! Bearer token acquisition.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::errors::ApiError;

/// Tokens are refreshed this long before they actually expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, ApiError>;
}

/// A pre-issued token used as is.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct M2mCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Client-credentials token exchange with an in-memory cache.
pub struct M2mTokenSource {
    http: reqwest::Client,
    credentials: M2mCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl M2mTokenSource {
    pub fn new(http: reqwest::Client, credentials: M2mCredentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::new(None),
        }
    }

    async fn exchange(&self) -> Result<TokenResponse, ApiError> {
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "client_id": self.credentials.client_id,
            "client_secret": self.credentials.client_secret,
            "audience": self.credentials.audience,
        });
        let resp = self
            .http
            .post(&self.credentials.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Auth(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Auth(format!(
                "token endpoint returned HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| ApiError::Auth(format!("unreadable token response: {e}")))
    }
}

#[async_trait]
impl TokenSource for M2mTokenSource {
    async fn token(&self) -> Result<String, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let fresh = self.exchange().await?;
        let lifetime = Duration::from_secs(fresh.expires_in);
        let refresh_at = Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN);
        tracing::debug!(expires_in = fresh.expires_in, "acquired machine token");
        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            refresh_at,
        });
        Ok(fresh.access_token)
    }
}
