//! Observers injected into the sync engine.

use serde::Serialize;

use crate::state::SharedDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Refresh,
    Push,
    Pull,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Refresh => "refresh",
            SyncPhase::Push => "push",
            SyncPhase::Pull => "pull",
        }
    }
}

/// Progress reported during a sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    PhaseStarted { phase: SyncPhase },
    PhaseFinished { phase: SyncPhase, items: usize },
    /// A batch was accepted by the server and removed from the outbox.
    BatchPushed { count: usize, acked_seq: i64 },
    /// One remote change was applied (or deliberately skipped).
    ChangeApplied { seq: i64, entity: String, entity_id: String, ignored: bool },
    CursorCommitted { seq: i64 },
    Error { phase: SyncPhase, message: String },
}

/// Receives progress events. Implementations must be cheap; they run inline.
pub trait EventSink: Send + Sync {
    fn on_progress(&self, event: &SyncEvent);
}

/// Default sink: writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn on_progress(&self, event: &SyncEvent) {
        match event {
            SyncEvent::PhaseStarted { phase } => log::debug!("vault {}: started", phase.as_str()),
            SyncEvent::PhaseFinished { phase, items } => {
                log::info!("vault {}: finished ({} items)", phase.as_str(), items)
            }
            SyncEvent::BatchPushed { count, acked_seq } => {
                log::info!("vault push: {} items acknowledged up to seq {}", count, acked_seq)
            }
            SyncEvent::ChangeApplied {
                seq,
                entity,
                entity_id,
                ignored,
            } => {
                if *ignored {
                    log::debug!("vault pull: seq {} {} {} skipped", seq, entity, entity_id);
                } else {
                    log::debug!("vault pull: seq {} {} {} applied", seq, entity, entity_id);
                }
            }
            SyncEvent::CursorCommitted { seq } => log::info!("vault pull: cursor at {}", seq),
            SyncEvent::Error { phase, message } => {
                log::warn!("vault {} failed: {}", phase.as_str(), message)
            }
        }
    }
}

/// Told about every successful bearer token refresh.
pub trait TokenObserver: Send + Sync {
    fn on_token_refresh(&self, token: &str, refresh_token: &str, expires_at: Option<&str>);
}

/// Default observer: persists refreshed tokens to the `vault_state` row.
pub struct DbTokenObserver {
    db: SharedDb,
}

impl DbTokenObserver {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl TokenObserver for DbTokenObserver {
    fn on_token_refresh(&self, token: &str, refresh_token: &str, expires_at: Option<&str>) {
        if let Err(e) = self
            .db
            .lock()
            .update_vault_tokens(token, refresh_token, expires_at)
        {
            log::warn!("Failed to persist refreshed vault token: {}", e);
        }
    }
}
