//! Wire shapes for vault changes.
//!
//! Each entity tag selects one payload struct. All keys are snake_case;
//! unknown keys are ignored on read. Optional strings travel as `""`,
//! optional timestamps are omitted. Reference ids are advisory when they do
//! not parse; the denormalized `*_name` fields exist so the reconciler can
//! build placeholders for rows that have not arrived yet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::{
    ChangeOp, DbCadence, DbCompany, DbContact, DbDeal, DbDealNote, DbInteraction,
    DbRelationship, DealStage, InteractionType, Sentiment,
};
use crate::error::SyncError;

pub const TAG_CONTACT: &str = "contact";
pub const TAG_COMPANY: &str = "company";
pub const TAG_DEAL: &str = "deal";
pub const TAG_DEAL_NOTE: &str = "deal_note";
pub const TAG_RELATIONSHIP: &str = "relationship";
pub const TAG_INTERACTION_LOG: &str = "interaction_log";
pub const TAG_CONTACT_CADENCE: &str = "contact_cadence";
pub const TAG_SUGGESTION: &str = "suggestion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPayload {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub company_id: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contacted_at: Option<String>,
}

impl ContactPayload {
    pub fn from_row(contact: &DbContact, company_name: &str) -> Self {
        Self {
            id: contact.id.clone(),
            name: contact.name.clone(),
            email: contact.email.clone(),
            phone: contact.phone.clone(),
            company_id: contact.company_id.clone().unwrap_or_default(),
            company_name: company_name.to_string(),
            notes: contact.notes.clone(),
            last_contacted_at: contact.last_contacted_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyPayload {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub industry: String,
    #[serde(default)]
    pub notes: String,
}

impl CompanyPayload {
    pub fn from_row(company: &DbCompany) -> Self {
        Self {
            id: company.id.clone(),
            name: company.name.clone(),
            domain: company.domain.clone(),
            industry: company.industry.clone(),
            notes: company.notes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealPayload {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Minor currency units.
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    pub stage: DealStage,
    #[serde(default)]
    pub company_id: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub contact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_close_date: Option<String>,
}

impl DealPayload {
    pub fn from_row(deal: &DbDeal, company_name: &str, contact_name: &str) -> Self {
        Self {
            id: deal.id.clone(),
            title: deal.title.clone(),
            amount: deal.amount,
            currency: deal.currency.clone(),
            stage: deal.stage,
            company_id: deal.company_id.clone(),
            company_name: company_name.to_string(),
            contact_id: deal.contact_id.clone().unwrap_or_default(),
            contact_name: contact_name.to_string(),
            expected_close_date: deal.expected_close_date.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealNotePayload {
    pub id: String,
    pub deal_id: String,
    #[serde(default)]
    pub deal_title: String,
    #[serde(default)]
    pub deal_company_id: String,
    #[serde(default)]
    pub deal_company_name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: String,
}

impl DealNotePayload {
    pub fn from_row(note: &DbDealNote, deal: &DbDeal, company_name: &str) -> Self {
        Self {
            id: note.id.clone(),
            deal_id: note.deal_id.clone(),
            deal_title: deal.title.clone(),
            deal_company_id: deal.company_id.clone(),
            deal_company_name: company_name.to_string(),
            content: note.content.clone(),
            created_at: note.created_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    pub id: String,
    #[serde(default)]
    pub contact_id_1: String,
    #[serde(default)]
    pub contact_id_2: String,
    #[serde(default)]
    pub contact_1_name: String,
    #[serde(default)]
    pub contact_2_name: String,
    #[serde(default)]
    pub relationship_type: String,
    #[serde(default)]
    pub context: String,
}

impl RelationshipPayload {
    pub fn from_row(rel: &DbRelationship, name_1: &str, name_2: &str) -> Self {
        Self {
            id: rel.id.clone(),
            contact_id_1: rel.contact_id_1.clone(),
            contact_id_2: rel.contact_id_2.clone(),
            contact_1_name: name_1.to_string(),
            contact_2_name: name_2.to_string(),
            relationship_type: rel.relationship_type.clone(),
            context: rel.context.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionLogPayload {
    pub id: String,
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub contact_name: String,
    pub interaction_type: InteractionType,
    #[serde(default)]
    pub interacted_at: String,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl InteractionLogPayload {
    pub fn from_row(log: &DbInteraction, contact_name: &str) -> Self {
        Self {
            id: log.id.clone(),
            contact_id: log.contact_id.clone(),
            contact_name: contact_name.to_string(),
            interaction_type: log.interaction_type,
            interacted_at: log.interacted_at.clone(),
            sentiment: log.sentiment,
            metadata: log.metadata.clone(),
        }
    }
}

/// Keyed by contact: `id` is the contact id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCadencePayload {
    pub id: String,
    #[serde(default)]
    pub contact_name: String,
    #[serde(default)]
    pub cadence_days: i64,
    #[serde(default)]
    pub relationship_strength: f64,
    #[serde(default)]
    pub priority_score: f64,
}

impl ContactCadencePayload {
    pub fn from_row(cadence: &DbCadence, contact_name: &str) -> Self {
        Self {
            id: cadence.contact_id.clone(),
            contact_name: contact_name.to_string(),
            cadence_days: cadence.cadence_days,
            relationship_strength: cadence.relationship_strength,
            priority_score: cadence.priority_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionPayload {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub source_service: String,
    #[serde(default)]
    pub status: String,
}

/// A decoded entity payload, selected by its entity tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Contact(ContactPayload),
    Company(CompanyPayload),
    Deal(DealPayload),
    DealNote(DealNotePayload),
    Relationship(RelationshipPayload),
    InteractionLog(InteractionLogPayload),
    ContactCadence(ContactCadencePayload),
    Suggestion(SuggestionPayload),
    /// A tag this build does not know. Carried through so it can be skipped.
    Unknown { tag: String },
}

fn from_json<T: serde::de::DeserializeOwned>(tag: &str, bytes: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::Payload(format!("{tag}: {e}")))
}

impl Payload {
    pub fn tag(&self) -> &str {
        match self {
            Payload::Contact(_) => TAG_CONTACT,
            Payload::Company(_) => TAG_COMPANY,
            Payload::Deal(_) => TAG_DEAL,
            Payload::DealNote(_) => TAG_DEAL_NOTE,
            Payload::Relationship(_) => TAG_RELATIONSHIP,
            Payload::InteractionLog(_) => TAG_INTERACTION_LOG,
            Payload::ContactCadence(_) => TAG_CONTACT_CADENCE,
            Payload::Suggestion(_) => TAG_SUGGESTION,
            Payload::Unknown { tag } => tag,
        }
    }

    /// The id carried inside the payload (empty for unknown tags).
    pub fn id(&self) -> &str {
        match self {
            Payload::Contact(p) => &p.id,
            Payload::Company(p) => &p.id,
            Payload::Deal(p) => &p.id,
            Payload::DealNote(p) => &p.id,
            Payload::Relationship(p) => &p.id,
            Payload::InteractionLog(p) => &p.id,
            Payload::ContactCadence(p) => &p.id,
            Payload::Suggestion(p) => &p.id,
            Payload::Unknown { .. } => "",
        }
    }

    /// Parse plaintext JSON for `tag`. Unknown tags decode to [`Payload::Unknown`]
    /// without looking at the bytes.
    pub fn decode(tag: &str, bytes: &[u8]) -> Result<Self, SyncError> {
        let payload = match tag {
            TAG_CONTACT => Payload::Contact(from_json(tag, bytes)?),
            TAG_COMPANY => Payload::Company(from_json(tag, bytes)?),
            TAG_DEAL => Payload::Deal(from_json(tag, bytes)?),
            TAG_DEAL_NOTE => Payload::DealNote(from_json(tag, bytes)?),
            TAG_RELATIONSHIP => Payload::Relationship(from_json(tag, bytes)?),
            TAG_INTERACTION_LOG => Payload::InteractionLog(from_json(tag, bytes)?),
            TAG_CONTACT_CADENCE => Payload::ContactCadence(from_json(tag, bytes)?),
            TAG_SUGGESTION => Payload::Suggestion(from_json(tag, bytes)?),
            other => Payload::Unknown {
                tag: other.to_string(),
            },
        };
        Ok(payload)
    }

    /// Serialize to plaintext JSON.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let bytes = match self {
            Payload::Contact(p) => serde_json::to_vec(p),
            Payload::Company(p) => serde_json::to_vec(p),
            Payload::Deal(p) => serde_json::to_vec(p),
            Payload::DealNote(p) => serde_json::to_vec(p),
            Payload::Relationship(p) => serde_json::to_vec(p),
            Payload::InteractionLog(p) => serde_json::to_vec(p),
            Payload::ContactCadence(p) => serde_json::to_vec(p),
            Payload::Suggestion(p) => serde_json::to_vec(p),
            Payload::Unknown { tag } => {
                return Err(SyncError::Payload(format!("cannot encode unknown entity '{tag}'")))
            }
        };
        bytes.map_err(|e| SyncError::Payload(e.to_string()))
    }
}

/// One decrypted inbound change, ready for the reconciler.
///
/// `payload` is `None` for deletes that carry no body.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub entity: String,
    pub entity_id: String,
    pub op: ChangeOp,
    pub payload: Option<Payload>,
}

impl Change {
    pub fn upsert(payload: Payload) -> Self {
        Self {
            entity: payload.tag().to_string(),
            entity_id: payload.id().to_string(),
            op: ChangeOp::Upsert,
            payload: Some(payload),
        }
    }

    pub fn delete(entity: &str, entity_id: &str) -> Self {
        Self {
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            op: ChangeOp::Delete,
            payload: None,
        }
    }
}
