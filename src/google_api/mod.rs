//! Native Google API client for the provider importers.
//!
//! Direct HTTP via reqwest. The OAuth token lives in a JSON file written by
//! the sign-in flow (see [`token_store`]); access tokens are refreshed here
//! when they are within a minute of expiry.
//!
//! Modules:
//! - calendar: Calendar API v3 events with sync tokens
//! - people: People API connections with sync tokens
//! - gmail: Gmail API v1 messages and history
//! - token_store: file-backed token persistence

pub mod calendar;
pub mod gmail;
pub mod people;
pub mod token_store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SyncError;

/// Google OAuth2 scopes the importers need (all read-only).
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/calendar.readonly",
    "https://www.googleapis.com/auth/contacts.readonly",
    "https://www.googleapis.com/auth/gmail.metadata",
];

// ============================================================================
// Token type
// ============================================================================

/// OAuth2 token payload persisted by [`token_store`].
///
/// Both `token` and `access_token` are accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToken {
    #[serde(alias = "access_token")]
    pub token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// RFC 3339 expiry of `token`.
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Token expired or revoked")]
    AuthExpired,
    #[error("Token not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
    /// The sync token is no longer valid; a full fetch is required.
    #[error("Sync token expired")]
    SyncTokenExpired,
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<GoogleApiError> for SyncError {
    fn from(err: GoogleApiError) -> Self {
        match err {
            GoogleApiError::SyncTokenExpired => SyncError::ProviderTokenExpired,
            GoogleApiError::Http(e) => SyncError::Transport(e.to_string()),
            GoogleApiError::ApiError { status, message } if status >= 500 || status == 429 => {
                SyncError::Transport(format!("provider returned HTTP {status}: {message}"))
            }
            other => SyncError::ProviderPermanent(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0)
        % 150;
    Duration::from_millis(base.saturating_add(jitter))
}

/// Send a request, retrying 429/408/5xx and connect/timeouts with backoff.
/// Other statuses are returned to the caller untouched.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(GoogleApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if is_retryable_status(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google_api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google_api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(GoogleApiError::Http(err));
            }
        }
    }
}

/// Turn a non-success response into an error. 401 is `AuthExpired`; 410 is
/// `SyncTokenExpired` (Calendar and People use it for stale sync tokens).
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, GoogleApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(GoogleApiError::AuthExpired);
    }
    if status == reqwest::StatusCode::GONE {
        return Err(GoogleApiError::SyncTokenExpired);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GoogleApiError::ApiError {
        status: status.as_u16(),
        message: body,
    })
}

// ============================================================================
// Token refresh
// ============================================================================

/// Serializes concurrent token refreshes.
static TOKEN_REFRESH_MUTEX: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();

fn refresh_mutex() -> &'static Mutex<()> {
    TOKEN_REFRESH_MUTEX.get_or_init(|| Mutex::new(()))
}

/// Expired, unparseable, missing, or within 60 seconds of expiry.
pub fn is_token_expired(token: &GoogleToken) -> bool {
    match token.expiry.as_deref().and_then(crate::util::parse_ts) {
        Some(expiry) => expiry <= chrono::Utc::now() + chrono::Duration::seconds(60),
        None => true,
    }
}

/// Exchange the refresh token for a new access token and persist it to `path`.
pub async fn refresh_access_token(
    token: &GoogleToken,
    path: &Path,
) -> Result<GoogleToken, GoogleApiError> {
    let _guard = refresh_mutex().lock().await;

    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or(GoogleApiError::AuthExpired)?;

    let mut form = vec![
        ("client_id", token.client_id.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = token.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let client = reqwest::Client::new();
    let resp = send_with_retry(
        client.post(&token.token_uri).form(&form),
        &RetryPolicy::default(),
    )
    .await?;
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(map_refresh_error(status.as_u16(), &body_text));
    }
    let body: serde_json::Value = serde_json::from_str(&body_text)?;

    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| GoogleApiError::RefreshFailed("No access_token in response".into()))?;
    let expires_in = body["expires_in"].as_i64().unwrap_or(3600);
    let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in);

    let mut new_token = token.clone();
    new_token.token = access_token.to_string();
    new_token.expiry = Some(crate::util::format_ts(expiry));

    token_store::save_token(path, &new_token)?;
    log::info!("Refreshed Google access token (expires {})", expiry);
    Ok(new_token)
}

fn map_refresh_error(status: u16, body: &str) -> GoogleApiError {
    let lowered = body.to_lowercase();
    if (status == 400 || status == 401)
        && (lowered.contains("invalid_grant") || lowered.contains("token has been expired"))
    {
        return GoogleApiError::AuthExpired;
    }
    GoogleApiError::RefreshFailed(format!("HTTP {}: {}", status, body))
}

/// Load the token at `path`, refreshing it first if it is about to expire.
pub async fn get_valid_access_token(path: &Path) -> Result<String, GoogleApiError> {
    let token = token_store::load_token(path)?;
    if is_token_expired(&token) {
        let refreshed = refresh_access_token(&token, path).await?;
        Ok(refreshed.token)
    } else {
        Ok(token.token)
    }
}
