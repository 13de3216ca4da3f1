//! Error types for vault sync and provider import.
//!
//! Errors are classified by recoverability:
//! - Retryable: network failures, server 5xx, a cycle already running
//! - NonRetryable: bad payloads, unresolved references, storage failures
//! - RequiresUserAction: auth rejected, permanent server or provider refusal

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed inbound payload: JSON, id, timestamp or enum value.
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// A mandatory reference could not be resolved (deal without company).
    #[error("Unresolved reference: {0}")]
    RefResolution(String),

    /// Encryption or decryption failure.
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Retryable
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Another sync cycle is already running")]
    CycleInProgress,

    // Requires user action
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server refused a request with a 4xx other than 401.
    #[error("Rejected by server (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The provider no longer accepts the saved sync token (HTTP 410).
    #[error("Provider sync token expired")]
    ProviderTokenExpired,

    #[error("Provider error: {0}")]
    ProviderPermanent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true if running the cycle again later may succeed on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Cancelled | SyncError::CycleInProgress
        )
    }

    /// Returns true if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Rejected { .. }
                | SyncError::ProviderPermanent(_)
                | SyncError::Config(_)
        )
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            SyncError::Payload(_) | SyncError::RefResolution(_) => {
                "A remote change could not be applied. The cursor was not advanced."
            }
            SyncError::Codec(_) => "Check that every device shares the same vault key.",
            SyncError::Storage(_) => "Check file permissions and disk space.",
            SyncError::Transport(_) => "Check your internet connection and try again.",
            SyncError::Cancelled => "Run sync again.",
            SyncError::CycleInProgress => "Wait for the running sync to finish.",
            SyncError::Auth(_) => "Sign in to the vault again.",
            SyncError::Rejected { .. } => "The server refused the request. Check the server logs.",
            SyncError::ProviderTokenExpired => "Run the import again for a full window fetch.",
            SyncError::ProviderPermanent(_) => "Reconnect the provider account.",
            SyncError::Config(_) => "Check your configuration in ~/.pcrm/config.json",
        }
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Serializable error representation for status output
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorReport {
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&SyncError> for SyncErrorReport {
    fn from(err: &SyncError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        SyncErrorReport {
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
