//! Shared type definitions for the database layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),
}

/// A row from the `contacts` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbContact {
    pub id: String,
    pub name: String,
    /// Normalized (trimmed, lowercase). Empty when unknown.
    pub email: String,
    pub phone: String,
    pub company_id: Option<String>,
    pub notes: String,
    pub last_contacted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbContact {
    /// A contact with only an id and name; everything else empty.
    pub fn named(id: &str, name: &str) -> Self {
        let now = crate::util::now_ts();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            email: String::new(),
            phone: String::new(),
            company_id: None,
            notes: String::new(),
            last_contacted_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// A row from the `companies` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCompany {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub industry: String,
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
}

impl DbCompany {
    pub fn named(id: &str, name: &str) -> Self {
        let now = crate::util::now_ts();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            domain: String::new(),
            industry: String::new(),
            notes: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Pipeline stage of a deal. `Unknown` marks a locally synthesized placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    Prospecting,
    Qualification,
    Proposal,
    Negotiation,
    ClosedWon,
    ClosedLost,
    Unknown,
}

impl DealStage {
    /// String label for SQL storage and the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::Prospecting => "prospecting",
            DealStage::Qualification => "qualification",
            DealStage::Proposal => "proposal",
            DealStage::Negotiation => "negotiation",
            DealStage::ClosedWon => "closed_won",
            DealStage::ClosedLost => "closed_lost",
            DealStage::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "prospecting" => Some(DealStage::Prospecting),
            "qualification" => Some(DealStage::Qualification),
            "proposal" => Some(DealStage::Proposal),
            "negotiation" => Some(DealStage::Negotiation),
            "closed_won" => Some(DealStage::ClosedWon),
            "closed_lost" => Some(DealStage::ClosedLost),
            "unknown" => Some(DealStage::Unknown),
            _ => None,
        }
    }
}

/// A row from the `deals` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbDeal {
    pub id: String,
    pub title: String,
    /// Minor currency units (cents for USD).
    pub amount: i64,
    pub currency: String,
    pub stage: DealStage,
    pub company_id: String,
    pub contact_id: Option<String>,
    pub expected_close_date: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
    pub updated_at: String,
}

/// A row from the `deal_notes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbDealNote {
    pub id: String,
    pub deal_id: String,
    pub content: String,
    pub created_at: String,
}

/// A row from the `relationships` table, always stored with
/// `contact_id_1 < contact_id_2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbRelationship {
    pub id: String,
    pub contact_id_1: String,
    pub contact_id_2: String,
    pub relationship_type: String,
    pub context: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    Meeting,
    Call,
    Email,
    Message,
    Event,
}

impl InteractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionType::Meeting => "meeting",
            InteractionType::Call => "call",
            InteractionType::Email => "email",
            InteractionType::Message => "message",
            InteractionType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "meeting" => Some(InteractionType::Meeting),
            "call" => Some(InteractionType::Call),
            "email" => Some(InteractionType::Email),
            "message" => Some(InteractionType::Message),
            "event" => Some(InteractionType::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

/// A row from the `interaction_logs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbInteraction {
    pub id: String,
    pub contact_id: String,
    pub interaction_type: InteractionType,
    pub interacted_at: String,
    pub sentiment: Option<Sentiment>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub created_at: String,
}

/// A row from the `contact_cadence` table. Scoring itself happens elsewhere;
/// the sync core only stores what it is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCadence {
    pub contact_id: String,
    pub cadence_days: i64,
    pub relationship_strength: f64,
    pub priority_score: f64,
    pub updated_at: String,
}

/// Operation carried by an outbox item or a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Upsert => "upsert",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "upsert" => Some(ChangeOp::Upsert),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// A row from the `outbox` table. `payload` is the sealed (encrypted) body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub seq: i64,
    pub entity: String,
    pub entity_id: String,
    pub op: ChangeOp,
    pub payload: String,
    pub enqueued_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Idle,
    Syncing,
    Error,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Idle => "idle",
            ProviderStatus::Syncing => "syncing",
            ProviderStatus::Error => "error",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "syncing" => ProviderStatus::Syncing,
            "error" => ProviderStatus::Error,
            _ => ProviderStatus::Idle,
        }
    }
}

/// A row from `provider_sync_state` (one per external provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSyncState {
    pub service_name: String,
    pub status: ProviderStatus,
    pub last_sync_time: Option<String>,
    pub last_sync_token: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from `provider_sync_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSyncLogEntry {
    pub id: String,
    pub source_service: String,
    pub source_external_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata_json: Option<String>,
}

/// The single `vault_state` row: this device's identity, tokens, and cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultState {
    pub user_id: String,
    pub device_id: String,
    pub auth_token: String,
    pub auth_expires_at: Option<String>,
    pub refresh_token: String,
    /// Hex-encoded shared seed the payload key is derived from.
    pub key_seed: String,
    pub last_synced_seq: i64,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
}
