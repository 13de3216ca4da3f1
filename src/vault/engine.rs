//! Bidirectional vault sync.
//!
//! One cycle:
//! 1. Refresh the bearer token if it expires within the refresh window.
//! 2. Push: drain the outbox in `seq` order, batch by batch, acknowledging
//!    what the server accepted.
//! 3. Pull: fetch changes after `last_synced_seq`, decrypt, and apply each
//!    one in its own transaction.
//! 4. Commit the cursor once the whole pulled batch has applied.
//!
//! A failure anywhere aborts the cycle with the outbox and cursor intact.
//! Applies are idempotent, so a cycle that dies halfway simply replays on the
//! next run. Only one cycle runs per process at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::state::SharedDb;
use crate::types::VaultConfig;
use crate::util::{now_ts, parse_ts};

use super::crypto::{envelope_aad, VaultKey};
use super::events::{DbTokenObserver, EventSink, LogEventSink, SyncEvent, SyncPhase, TokenObserver};
use super::payload::{Change, Payload};
use super::reconcile::{apply_change, ApplyOutcome};
use super::transport::{HttpVaultTransport, PushItem, RemoteChange, VaultTransport};

static SYNC_CYCLE_LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();

/// The process-wide guard that keeps sync cycles from overlapping.
fn process_cycle_lock() -> Arc<Mutex<()>> {
    SYNC_CYCLE_LOCK
        .get_or_init(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Cooperative cancellation, checked between changes and between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub refreshed: bool,
    pub pushed: usize,
    pub applied: usize,
    pub ignored: usize,
    pub cursor: i64,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub initialized: bool,
    pub device_id: Option<String>,
    pub pending: i64,
    pub last_synced_seq: i64,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
}

/// Credentials in use for the current cycle.
struct Session {
    token: String,
    refresh_token: String,
    refreshed: bool,
}

pub struct SyncEngine {
    db: SharedDb,
    transport: Arc<dyn VaultTransport>,
    sink: Arc<dyn EventSink>,
    token_observer: Arc<dyn TokenObserver>,
    batch_size: usize,
    refresh_window_secs: i64,
    cycle_lock: Arc<Mutex<()>>,
}

impl SyncEngine {
    /// Engine with the log sink and tokens persisted to `vault_state`.
    pub fn new(db: SharedDb, transport: Arc<dyn VaultTransport>) -> Self {
        let defaults = VaultConfig::default();
        Self {
            token_observer: Arc::new(DbTokenObserver::new(db.clone())),
            db,
            transport,
            sink: Arc::new(LogEventSink),
            batch_size: defaults.batch_size,
            refresh_window_secs: defaults.refresh_window_secs,
            cycle_lock: process_cycle_lock(),
        }
    }

    /// Engine talking HTTP to the configured vault server.
    pub fn from_config(db: SharedDb, config: &VaultConfig) -> Result<Self, SyncError> {
        if !config.enabled {
            return Err(SyncError::Config("vault sync is disabled".to_string()));
        }
        let transport = HttpVaultTransport::new(
            &config.server_url,
            std::time::Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self::new(db, Arc::new(transport))
            .with_batch_size(config.batch_size)
            .with_refresh_window(config.refresh_window_secs))
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_token_observer(mut self, observer: Arc<dyn TokenObserver>) -> Self {
        self.token_observer = observer;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_refresh_window(mut self, secs: i64) -> Self {
        self.refresh_window_secs = secs.max(0);
        self
    }

    /// Give this engine its own cycle guard so parallel tests don't collide.
    #[cfg(test)]
    pub(crate) fn with_private_cycle_lock(mut self) -> Self {
        self.cycle_lock = Arc::new(Mutex::new(()));
        self
    }

    /// Run one full cycle. Fails fast with `CycleInProgress` if another
    /// cycle holds the guard. The outcome is recorded in `vault_state.last_error`.
    pub async fn run_cycle(&self, cancel: &CancelFlag) -> Result<CycleReport, SyncError> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| SyncError::CycleInProgress)?;

        let result = self.cycle(cancel).await;

        let recorded = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.db.lock().record_vault_error(recorded.as_deref()) {
            log::warn!("Failed to record vault sync outcome: {}", e);
        }
        result
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let db = self.db.lock();
        let pending = db.outbox_pending_count()?;
        let status = match db.get_vault_state()? {
            Some(state) => SyncStatus {
                initialized: true,
                device_id: Some(state.device_id),
                pending,
                last_synced_seq: state.last_synced_seq,
                last_push_at: state.last_push_at,
                last_pull_at: state.last_pull_at,
                last_error: state.last_error,
            },
            None => SyncStatus {
                initialized: false,
                device_id: None,
                pending,
                last_synced_seq: 0,
                last_push_at: None,
                last_pull_at: None,
                last_error: None,
            },
        };
        Ok(status)
    }

    async fn cycle(&self, cancel: &CancelFlag) -> Result<CycleReport, SyncError> {
        let state = self
            .db
            .lock()
            .get_vault_state()?
            .ok_or_else(|| SyncError::Config("vault is not initialized on this device".to_string()))?;
        let key = VaultKey::from_hex_seed(&state.key_seed, &state.user_id)?;

        let mut session = Session {
            token: state.auth_token.clone(),
            refresh_token: state.refresh_token.clone(),
            refreshed: false,
        };
        if self.token_needs_refresh(&session.token, state.auth_expires_at.as_deref()) {
            self.refresh(&mut session).await?;
        }

        let pushed = self
            .push_phase(&mut session, &state.device_id, cancel)
            .await
            .map_err(|e| self.fail(SyncPhase::Push, e))?;

        let (applied, ignored, cursor) = self
            .pull_phase(&mut session, &key, state.last_synced_seq, cancel)
            .await
            .map_err(|e| self.fail(SyncPhase::Pull, e))?;

        Ok(CycleReport {
            refreshed: session.refreshed,
            pushed,
            applied,
            ignored,
            cursor,
        })
    }

    fn fail(&self, phase: SyncPhase, err: SyncError) -> SyncError {
        self.sink.on_progress(&SyncEvent::Error {
            phase,
            message: err.to_string(),
        });
        err
    }

    fn token_needs_refresh(&self, token: &str, expires_at: Option<&str>) -> bool {
        if token.is_empty() {
            return true;
        }
        match expires_at.and_then(parse_ts) {
            Some(expiry) => (expiry - Utc::now()).num_seconds() <= self.refresh_window_secs,
            None => false,
        }
    }

    async fn refresh(&self, session: &mut Session) -> Result<(), SyncError> {
        self.sink.on_progress(&SyncEvent::PhaseStarted {
            phase: SyncPhase::Refresh,
        });
        if session.refresh_token.is_empty() {
            return Err(self.fail(
                SyncPhase::Refresh,
                SyncError::Auth("no refresh token stored; sign in again".to_string()),
            ));
        }
        let grant = self
            .transport
            .refresh_token(&session.refresh_token)
            .await
            .map_err(|e| self.fail(SyncPhase::Refresh, e))?;

        self.token_observer
            .on_token_refresh(&grant.token, &grant.refresh_token, grant.expires_at.as_deref());
        session.token = grant.token;
        session.refresh_token = grant.refresh_token;
        session.refreshed = true;

        self.sink.on_progress(&SyncEvent::PhaseFinished {
            phase: SyncPhase::Refresh,
            items: 1,
        });
        Ok(())
    }

    async fn push_batch(
        &self,
        session: &mut Session,
        device_id: &str,
        items: &[PushItem],
    ) -> Result<i64, SyncError> {
        match self.transport.push(&session.token, device_id, items).await {
            Err(SyncError::Auth(reason)) if !session.refreshed => {
                log::info!("Vault rejected token during push ({}); refreshing", reason);
                self.refresh(session).await?;
                self.transport.push(&session.token, device_id, items).await
            }
            other => other,
        }
    }

    async fn pull_changes(
        &self,
        session: &mut Session,
        since_seq: i64,
    ) -> Result<Vec<RemoteChange>, SyncError> {
        match self.transport.pull(&session.token, since_seq).await {
            Err(SyncError::Auth(reason)) if !session.refreshed => {
                log::info!("Vault rejected token during pull ({}); refreshing", reason);
                self.refresh(session).await?;
                self.transport.pull(&session.token, since_seq).await
            }
            other => other,
        }
    }

    async fn push_phase(
        &self,
        session: &mut Session,
        device_id: &str,
        cancel: &CancelFlag,
    ) -> Result<usize, SyncError> {
        self.sink.on_progress(&SyncEvent::PhaseStarted {
            phase: SyncPhase::Push,
        });
        let mut pushed = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let batch = self.db.lock().outbox_dequeue_batch(self.batch_size)?;
            let (first_seq, last_seq) = match (batch.first(), batch.last()) {
                (Some(first), Some(last)) => (first.seq, last.seq),
                _ => break,
            };

            let items: Vec<PushItem> = batch.iter().map(PushItem::from).collect();
            let acked = self.push_batch(session, device_id, &items).await?;
            if acked < first_seq {
                return Err(SyncError::Transport(format!(
                    "server acknowledged seq {acked} but the batch starts at {first_seq}"
                )));
            }

            let up_to = acked.min(last_seq);
            let removed = {
                let db = self.db.lock();
                let removed = db.outbox_acknowledge(up_to)?;
                db.record_vault_push(&now_ts())?;
                removed
            };
            pushed += removed;
            self.sink.on_progress(&SyncEvent::BatchPushed {
                count: removed,
                acked_seq: up_to,
            });
        }
        self.sink.on_progress(&SyncEvent::PhaseFinished {
            phase: SyncPhase::Push,
            items: pushed,
        });
        Ok(pushed)
    }

    async fn pull_phase(
        &self,
        session: &mut Session,
        key: &VaultKey,
        since_seq: i64,
        cancel: &CancelFlag,
    ) -> Result<(usize, usize, i64), SyncError> {
        self.sink.on_progress(&SyncEvent::PhaseStarted {
            phase: SyncPhase::Pull,
        });
        let changes = self.pull_changes(session, since_seq).await?;

        let mut staged = since_seq;
        let (mut applied, mut ignored) = (0, 0);
        for remote in changes {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if remote.seq <= staged {
                log::debug!("Skipping already-seen change seq {}", remote.seq);
                continue;
            }

            let change = decode_remote(key, &remote)?;
            let outcome = {
                let db = self.db.lock();
                db.with_transaction(|tx| apply_change(tx, &change))?
            };
            match outcome {
                ApplyOutcome::Applied => applied += 1,
                ApplyOutcome::Ignored => ignored += 1,
            }
            staged = remote.seq;
            self.sink.on_progress(&SyncEvent::ChangeApplied {
                seq: remote.seq,
                entity: remote.entity,
                entity_id: remote.entity_id,
                ignored: outcome == ApplyOutcome::Ignored,
            });
        }

        self.db.lock().commit_vault_cursor(staged, &now_ts())?;
        if staged > since_seq {
            self.sink
                .on_progress(&SyncEvent::CursorCommitted { seq: staged });
        }
        self.sink.on_progress(&SyncEvent::PhaseFinished {
            phase: SyncPhase::Pull,
            items: applied + ignored,
        });
        Ok((applied, ignored, staged))
    }
}

/// Decrypt and parse one envelope.
fn decode_remote(key: &VaultKey, remote: &RemoteChange) -> Result<Change, SyncError> {
    let payload = if remote.payload.trim().is_empty() {
        None
    } else {
        let aad = envelope_aad(&remote.entity, remote.op, &remote.entity_id);
        let plaintext = key.open(&aad, &remote.payload)?;
        let payload = Payload::decode(&remote.entity, &plaintext)?;
        if !payload.id().is_empty() && payload.id() != remote.entity_id {
            log::warn!(
                "Change seq {} envelope id {} differs from payload id {}",
                remote.seq,
                remote.entity_id,
                payload.id()
            );
        }
        Some(payload)
    };
    Ok(Change {
        entity: remote.entity.clone(),
        entity_id: remote.entity_id.clone(),
        op: remote.op,
        payload,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{ChangeOp, VaultState};
    use crate::util::format_ts;
    use crate::vault::payload::{CompanyPayload, DealPayload, TAG_COMPANY, TAG_DEAL};
    use crate::vault::transport::TokenGrant;

    pub(crate) const SEED: &str =
        "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";
    const CO1: &str = "00000000-0000-4000-8000-0000000000c1";
    const D1: &str = "00000000-0000-4000-8000-0000000000d1";

    /// In-memory vault server.
    #[derive(Default)]
    pub(crate) struct StubTransport {
        pub pushes: parking_lot::Mutex<Vec<Vec<PushItem>>>,
        pub push_errors: parking_lot::Mutex<VecDeque<SyncError>>,
        pub pull_errors: parking_lot::Mutex<VecDeque<SyncError>>,
        pub remote: parking_lot::Mutex<Vec<RemoteChange>>,
        pub pull_calls: AtomicUsize,
        pub refreshes: AtomicUsize,
    }

    #[async_trait]
    impl VaultTransport for StubTransport {
        async fn push(
            &self,
            _auth_token: &str,
            _device_id: &str,
            batch: &[PushItem],
        ) -> Result<i64, SyncError> {
            if let Some(err) = self.push_errors.lock().pop_front() {
                return Err(err);
            }
            self.pushes.lock().push(batch.to_vec());
            Ok(batch.last().map(|i| i.seq).unwrap_or(0))
        }

        async fn pull(
            &self,
            _auth_token: &str,
            since_seq: i64,
        ) -> Result<Vec<RemoteChange>, SyncError> {
            self.pull_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.pull_errors.lock().pop_front() {
                return Err(err);
            }
            Ok(self
                .remote
                .lock()
                .iter()
                .filter(|c| c.seq > since_seq)
                .cloned()
                .collect())
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<TokenGrant, SyncError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenGrant {
                token: format!("token-{n}"),
                refresh_token: format!("refresh-{n}"),
                expires_at: Some(format_ts(Utc::now() + chrono::Duration::hours(1))),
            })
        }
    }

    /// Records every event it sees.
    #[derive(Default)]
    pub(crate) struct RecordingSink(pub parking_lot::Mutex<Vec<SyncEvent>>);

    impl EventSink for RecordingSink {
        fn on_progress(&self, event: &SyncEvent) {
            self.0.lock().push(event.clone());
        }
    }

    pub(crate) fn vault_db(expires_at: Option<String>) -> SharedDb {
        let db = test_db();
        db.init_vault_state(&VaultState {
            user_id: "user-1".into(),
            device_id: "device-1".into(),
            auth_token: "token-0".into(),
            auth_expires_at: expires_at,
            refresh_token: "refresh-0".into(),
            key_seed: SEED.into(),
            last_synced_seq: 0,
            last_push_at: None,
            last_pull_at: None,
            last_error: None,
        })
        .unwrap();
        Arc::new(parking_lot::Mutex::new(db))
    }

    fn far_future() -> Option<String> {
        Some("2099-01-01T00:00:00Z".to_string())
    }

    fn engine(db: &SharedDb, transport: &Arc<StubTransport>) -> SyncEngine {
        SyncEngine::new(db.clone(), transport.clone()).with_private_cycle_lock()
    }

    fn sealed(seq: i64, payload: Payload) -> RemoteChange {
        let key = VaultKey::from_hex_seed(SEED, "user-1").unwrap();
        let entity = payload.tag().to_string();
        let entity_id = payload.id().to_string();
        let aad = envelope_aad(&entity, ChangeOp::Upsert, &entity_id);
        RemoteChange {
            seq,
            entity,
            entity_id,
            op: ChangeOp::Upsert,
            payload: key.seal(&aad, &payload.encode().unwrap()).unwrap(),
        }
    }

    fn deal_change(seq: i64) -> RemoteChange {
        sealed(
            seq,
            Payload::Deal(DealPayload {
                id: D1.into(),
                title: "Renewal".into(),
                amount: 5_000,
                currency: "USD".into(),
                stage: crate::db::DealStage::Prospecting,
                company_id: CO1.into(),
                company_name: "Acme".into(),
                contact_id: String::new(),
                contact_name: String::new(),
                expected_close_date: None,
            }),
        )
    }

    fn company_change(seq: i64) -> RemoteChange {
        sealed(
            seq,
            Payload::Company(CompanyPayload {
                id: CO1.into(),
                name: "Acme Corp".into(),
                domain: String::new(),
                industry: String::new(),
                notes: String::new(),
            }),
        )
    }

    #[tokio::test]
    async fn test_push_drains_outbox_in_batches() {
        let db = vault_db(far_future());
        for i in 0..5 {
            db.lock()
                .outbox_enqueue("contact", &format!("c-{i}"), ChangeOp::Upsert, "sealed")
                .unwrap();
        }
        let transport = Arc::new(StubTransport::default());
        let report = engine(&db, &transport)
            .with_batch_size(2)
            .run_cycle(&CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.pushed, 5);
        let sizes: Vec<usize> = transport.pushes.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(db.lock().outbox_pending_count().unwrap(), 0);
        assert!(db.lock().get_vault_state().unwrap().unwrap().last_push_at.is_some());
    }

    #[tokio::test]
    async fn test_remote_deal_before_company() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        transport.remote.lock().extend([deal_change(1), company_change(2)]);

        let report = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.cursor, 2);

        let db = db.lock();
        assert_eq!(db.get_company(CO1).unwrap().unwrap().name, "Acme Corp");
        assert_eq!(db.get_deal(D1).unwrap().unwrap().company_id, CO1);
        assert_eq!(db.get_vault_state().unwrap().unwrap().last_synced_seq, 2);
    }

    #[tokio::test]
    async fn test_transient_push_failure_preserves_outbox() {
        let db = vault_db(far_future());
        db.lock()
            .outbox_enqueue("contact", "c-1", ChangeOp::Upsert, "sealed")
            .unwrap();
        let transport = Arc::new(StubTransport::default());
        transport
            .push_errors
            .lock()
            .push_back(SyncError::Transport("connection reset".into()));

        let err = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(db.lock().outbox_pending_count().unwrap(), 1);
        assert_eq!(transport.pull_calls.load(Ordering::SeqCst), 0);
        let state = db.lock().get_vault_state().unwrap().unwrap();
        assert!(state.last_error.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_permanent_push_failure_surfaces() {
        let db = vault_db(far_future());
        db.lock()
            .outbox_enqueue("contact", "c-1", ChangeOp::Upsert, "sealed")
            .unwrap();
        let transport = Arc::new(StubTransport::default());
        transport.push_errors.lock().push_back(SyncError::Rejected {
            status: 422,
            message: "bad batch".into(),
        });

        let err = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(err.requires_user_action());
        assert_eq!(db.lock().outbox_pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_push_refreshes_once() {
        let db = vault_db(far_future());
        db.lock()
            .outbox_enqueue("contact", "c-1", ChangeOp::Upsert, "sealed")
            .unwrap();
        let transport = Arc::new(StubTransport::default());
        transport
            .push_errors
            .lock()
            .push_back(SyncError::Auth("401".into()));

        let report = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap();
        assert!(report.refreshed);
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 1);
        let state = db.lock().get_vault_state().unwrap().unwrap();
        assert_eq!(state.auth_token, "token-1");
        assert_eq!(state.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_auth_error() {
        let db = vault_db(far_future());
        db.lock()
            .outbox_enqueue("contact", "c-1", ChangeOp::Upsert, "sealed")
            .unwrap();
        let transport = Arc::new(StubTransport::default());
        transport.push_errors.lock().extend([
            SyncError::Auth("401".into()),
            SyncError::Auth("401 again".into()),
        ]);

        let err = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(transport.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(db.lock().outbox_pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_refreshed_first() {
        let db = vault_db(Some(format_ts(Utc::now() + chrono::Duration::seconds(60))));
        let transport = Arc::new(StubTransport::default());
        let report = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap();
        assert!(report.refreshed);

        let db2 = vault_db(far_future());
        let report = engine(&db2, &transport).run_cycle(&CancelFlag::new()).await.unwrap();
        assert!(!report.refreshed);
    }

    #[tokio::test]
    async fn test_decrypt_failure_keeps_cursor() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        let mut tampered = company_change(2);
        tampered.entity_id = "00000000-0000-4000-8000-0000000000ff".into();
        transport.remote.lock().extend([deal_change(1), tampered]);

        let err = engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Codec(_)));
        let state = db.lock().get_vault_state().unwrap().unwrap();
        assert_eq!(state.last_synced_seq, 0);
        // The first change was applied; replaying it later is harmless.
        assert!(db.lock().get_deal(D1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replayed_batch_is_idempotent() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        transport.remote.lock().extend([deal_change(1), company_change(2)]);
        engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap();
        let before = db.lock().get_deal(D1).unwrap().unwrap();

        // Simulate a crash before the cursor commit.
        db.lock().commit_vault_cursor(0, &now_ts()).unwrap();
        engine(&db, &transport).run_cycle(&CancelFlag::new()).await.unwrap();

        let db = db.lock();
        let after = db.get_deal(D1).unwrap().unwrap();
        assert_eq!(before.created_at, after.created_at);
        assert_eq!(before.last_activity_at, after.last_activity_at);
        assert_eq!(db.list_companies().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_cursor_advance() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        transport.remote.lock().push(company_change(1));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = engine(&db, &transport).run_cycle(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(db.lock().get_vault_state().unwrap().unwrap().last_synced_seq, 0);
        assert!(db.lock().get_company(CO1).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_refused() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        let engine = engine(&db, &transport);
        let held = engine.cycle_lock.clone();
        let _guard = held.lock().await;

        let err = engine.run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::CycleInProgress));
    }

    #[tokio::test]
    async fn test_uninitialized_vault_is_config_error() {
        let db: SharedDb = Arc::new(parking_lot::Mutex::new(test_db()));
        let transport = Arc::new(StubTransport::default());
        let engine = engine(&db, &transport);
        let err = engine.run_cycle(&CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(!engine.status().unwrap().initialized);
    }

    #[tokio::test]
    async fn test_events_and_status() {
        let db = vault_db(far_future());
        let transport = Arc::new(StubTransport::default());
        transport.remote.lock().push(company_change(3));
        let sink = Arc::new(RecordingSink::default());
        let engine = engine(&db, &transport).with_event_sink(sink.clone());
        engine.run_cycle(&CancelFlag::new()).await.unwrap();

        let events = sink.0.lock().clone();
        assert!(events.contains(&SyncEvent::CursorCommitted { seq: 3 }));
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ChangeApplied { entity, ignored: false, .. } if entity == TAG_COMPANY
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            SyncEvent::ChangeApplied { entity, .. } if entity == TAG_DEAL
        )));

        let status = engine.status().unwrap();
        assert_eq!(status.last_synced_seq, 3);
        assert_eq!(status.pending, 0);
        assert!(status.last_pull_at.is_some());
        assert!(status.last_error.is_none());
    }
}
