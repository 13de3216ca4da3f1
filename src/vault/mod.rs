//! End-to-end encrypted sync with the vault server.
//!
//! Local writes land in the outbox sealed with the account key; the engine
//! pushes them, pulls everyone else's changes, and hands those to the
//! reconciler.

pub mod crypto;
pub mod engine;
pub mod events;
pub mod payload;
pub mod reconcile;
pub mod transport;

pub use crypto::{envelope_aad, generate_seed_hex, VaultKey};
pub use engine::{CancelFlag, CycleReport, SyncEngine, SyncStatus};
pub use events::{DbTokenObserver, EventSink, LogEventSink, SyncEvent, SyncPhase, TokenObserver};
pub use payload::{Change, Payload};
pub use reconcile::{apply_change, ApplyOutcome};
pub use transport::{HttpVaultTransport, RemoteChange, VaultTransport};
