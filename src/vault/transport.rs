//! Client side of the vault server protocol.
//!
//! Endpoints (JSON over HTTPS, bearer auth):
//! - `POST /v1/changes` `{device_id, changes: [..]}` → `{ack_seq}`
//! - `GET  /v1/changes?since=<seq>` → `{changes: [{seq, entity, entity_id, op, payload}]}`
//! - `POST /v1/auth/refresh` `{refresh_token}` → `{token, refresh_token, expires_at}`
//!
//! Status mapping: 401 → `Auth`, other 4xx → `Rejected`, 5xx and network
//! failures (including timeouts) → `Transport`. No retries happen here; a
//! failed cycle is simply run again later.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::{ChangeOp, OutboxItem};
use crate::error::SyncError;

/// One outbox item as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushItem {
    pub seq: i64,
    pub entity: String,
    pub entity_id: String,
    pub op: ChangeOp,
    /// Sealed payload (base64).
    pub payload: String,
}

impl From<&OutboxItem> for PushItem {
    fn from(item: &OutboxItem) -> Self {
        Self {
            seq: item.seq,
            entity: item.entity.clone(),
            entity_id: item.entity_id.clone(),
            op: item.op,
            payload: item.payload.clone(),
        }
    }
}

/// A change envelope from the server's ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Server-assigned, strictly increasing.
    pub seq: i64,
    pub entity: String,
    pub entity_id: String,
    pub op: ChangeOp,
    #[serde(default)]
    pub payload: String,
}

/// New credentials from a token refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[async_trait]
pub trait VaultTransport: Send + Sync {
    /// Upload a batch in `seq` order. Returns the highest acknowledged seq.
    async fn push(&self, auth_token: &str, device_id: &str, batch: &[PushItem])
        -> Result<i64, SyncError>;

    /// Changes with `seq > since_seq`, in server order.
    async fn pull(&self, auth_token: &str, since_seq: i64) -> Result<Vec<RemoteChange>, SyncError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, SyncError>;
}

#[derive(Serialize)]
struct PushRequest<'a> {
    device_id: &'a str,
    changes: &'a [PushItem],
}

#[derive(Deserialize)]
struct PushResponse {
    ack_seq: i64,
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(default)]
    changes: Vec<RemoteChange>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// reqwest-backed transport.
pub struct HttpVaultTransport {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpVaultTransport {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut base_url = url::Url::parse(server_url.trim())
            .map_err(|e| SyncError::Config(format!("invalid vault server URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid vault endpoint {path}: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Transport(format!("request timed out: {err}"))
    } else {
        SyncError::Transport(err.to_string())
    }
}

/// Map a non-success status to the sync error taxonomy.
pub(crate) fn error_for_status(status: u16, body: String) -> SyncError {
    match status {
        401 => SyncError::Auth(if body.is_empty() { "unauthorized".to_string() } else { body }),
        400..=499 => SyncError::Rejected {
            status,
            message: body,
        },
        _ => SyncError::Transport(format!("server returned HTTP {status}: {body}")),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(error_for_status(status.as_u16(), body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| SyncError::Transport(format!("invalid server response: {e}")))
}

#[async_trait]
impl VaultTransport for HttpVaultTransport {
    async fn push(
        &self,
        auth_token: &str,
        device_id: &str,
        batch: &[PushItem],
    ) -> Result<i64, SyncError> {
        let response = self
            .client
            .post(self.endpoint("v1/changes")?)
            .bearer_auth(auth_token)
            .json(&PushRequest {
                device_id,
                changes: batch,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let body: PushResponse = read_json(response).await?;
        Ok(body.ack_seq)
    }

    async fn pull(&self, auth_token: &str, since_seq: i64) -> Result<Vec<RemoteChange>, SyncError> {
        let response = self
            .client
            .get(self.endpoint("v1/changes")?)
            .bearer_auth(auth_token)
            .query(&[("since", since_seq.to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        let body: PullResponse = read_json(response).await?;
        Ok(body.changes)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, SyncError> {
        let response = self
            .client
            .post(self.endpoint("v1/auth/refresh")?)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(transport_error)?;
        read_json(response).await.map_err(|e| match e {
            SyncError::Rejected { status, message } => {
                SyncError::Auth(format!("refresh rejected (HTTP {status}): {message}"))
            }
            other => other,
        })
    }
}
