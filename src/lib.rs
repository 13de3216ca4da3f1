//! Personal CRM sync core.
//!
//! - `db`: the local SQLite store every other layer writes through
//! - `services`: local edits, each committed together with its outbox row
//! - `vault`: end-to-end encrypted push/pull against the vault server
//! - `importers`: paginated pulls from Google calendar, contacts and mail

pub mod db;
pub mod error;
pub mod google_api;
pub mod importers;
pub mod matcher;
mod migrations;
pub mod services;
pub mod state;
pub mod types;
pub mod util;
pub mod vault;

pub use error::{ErrorType, SyncError, SyncErrorReport};
