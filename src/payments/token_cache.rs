use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};

/// Tokens are refreshed this long before the provider says they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

/// One client-credentials grant against a provider.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    /// Returns the bearer token and its lifetime in seconds.
    async fn fetch(&self) -> Result<(String, u64)>;
}

/// Caches a provider token until shortly before it expires. Concurrent
/// callers share a single refresh.
pub struct TokenCache<F> {
    fetcher: F,
    current: Mutex<Option<AccessToken>>,
}

impl<F: CredentialFetcher> TokenCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            current: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        let now = Instant::now();

        if let Some(cached) = current.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        let (token, expires_in) = self.fetcher.fetch().await?;
        tracing::debug!("Refreshed gateway access token, valid for {}s", expires_in);
        *current = Some(AccessToken {
            token: token.clone(),
            expires_at: now + Duration::from_secs(expires_in),
        });
        Ok(token)
    }

    /// Drops the cached token, e.g. after the provider answered 401.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    expires_in: Option<u64>,
}

/// Daraja sends `expires_in` as a string, PayPal as a number.
fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Seconds>::deserialize(deserializer)? {
        Some(Seconds::Number(n)) => Some(n),
        Some(Seconds::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

fn basic_auth(id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", id, secret)))
}

async fn read_token(response: reqwest::Response, provider: &str) -> Result<(String, u64)> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::BAD_REQUEST {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::GatewayAuth(format!(
            "{} rejected client credentials ({}): {}",
            provider,
            status,
            body.chars().take(200).collect::<String>()
        )));
    }
    if status.is_server_error() {
        return Err(AppError::Transport(format!("{} token endpoint returned {}", provider, status)));
    }
    if !status.is_success() {
        return Err(AppError::GatewayAuth(format!("{} token endpoint returned {}", provider, status)));
    }

    let parsed: TokenResponse = response.json().await.map_err(|e| {
        AppError::GatewayAuth(format!("{} returned an unreadable token: {}", provider, e))
    })?;
    Ok((parsed.access_token, parsed.expires_in.unwrap_or(3599)))
}

/// Daraja OAuth: `GET /oauth/v1/generate?grant_type=client_credentials`.
pub struct MpesaCredentials {
    pub client: reqwest::Client,
    pub api_base: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

#[async_trait]
impl CredentialFetcher for MpesaCredentials {
    async fn fetch(&self) -> Result<(String, u64)> {
        let response = self
            .client
            .get(format!("{}/oauth/v1/generate", self.api_base))
            .query(&[("grant_type", "client_credentials")])
            .header(reqwest::header::AUTHORIZATION, basic_auth(&self.consumer_key, &self.consumer_secret))
            .send()
            .await?;

        read_token(response, "M-Pesa").await
    }
}

/// PayPal OAuth: `POST /v1/oauth2/token` with a form-encoded grant.
pub struct PayPalCredentials {
    pub client: reqwest::Client,
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
}

#[async_trait]
impl CredentialFetcher for PayPalCredentials {
    async fn fetch(&self) -> Result<(String, u64)> {
        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .header(reqwest::header::AUTHORIZATION, basic_auth(&self.client_id, &self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        read_token(response, "PayPal").await
    }
}
