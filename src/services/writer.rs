// Local mutation service.
// Every write stores the entity row and its sealed outbox item in one
// transaction, so a change is either fully recorded for sync or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{
    ChangeOp, CrmDb, DbCadence, DbCompany, DbContact, DbDeal, DbDealNote, DbInteraction,
    DbRelationship, InteractionType, Sentiment,
};
use crate::error::SyncError;
use crate::state::SharedDb;
use crate::types::Config;
use crate::util::{canonical_ts, now_ts};
use crate::vault::crypto::{envelope_aad, VaultKey};
use crate::vault::engine::{CancelFlag, SyncEngine};
use crate::vault::payload::{
    Change, CompanyPayload, ContactCadencePayload, ContactPayload, DealNotePayload, DealPayload,
    InteractionLogPayload, Payload, RelationshipPayload, TAG_COMPANY, TAG_CONTACT, TAG_DEAL,
    TAG_RELATIONSHIP,
};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::Payload(format!("{field} is required")));
    }
    Ok(())
}

fn company_name(db: &CrmDb, id: Option<&str>) -> Result<String, SyncError> {
    match id {
        Some(id) => Ok(db.get_company(id)?.map(|c| c.name).unwrap_or_default()),
        None => Ok(String::new()),
    }
}

fn contact_name(db: &CrmDb, id: Option<&str>) -> Result<String, SyncError> {
    match id {
        Some(id) => Ok(db.get_contact(id)?.map(|c| c.name).unwrap_or_default()),
        None => Ok(String::new()),
    }
}

fn existing_contact(db: &CrmDb, id: &str) -> Result<DbContact, SyncError> {
    db.get_contact(id)?
        .ok_or_else(|| SyncError::RefResolution(format!("contact {id} not found")))
}

fn existing_company(db: &CrmDb, id: &str) -> Result<DbCompany, SyncError> {
    db.get_company(id)?
        .ok_or_else(|| SyncError::RefResolution(format!("company {id} not found")))
}

fn existing_deal(db: &CrmDb, id: &str) -> Result<DbDeal, SyncError> {
    db.get_deal(id)?
        .ok_or_else(|| SyncError::RefResolution(format!("deal {id} not found")))
}

/// Writes local changes and queues them for the vault.
pub struct LocalWriter {
    db: SharedDb,
    key: VaultKey,
    auto_sync: Option<Arc<SyncEngine>>,
}

impl LocalWriter {
    pub fn new(db: SharedDb, key: VaultKey) -> Self {
        Self {
            db,
            key,
            auto_sync: None,
        }
    }

    /// Writer keyed from this device's `vault_state` row.
    pub fn from_vault_state(db: SharedDb) -> Result<Self, SyncError> {
        let state = db
            .lock()
            .get_vault_state()?
            .ok_or_else(|| SyncError::Config("vault is not initialized on this device".to_string()))?;
        let key = VaultKey::from_hex_seed(&state.key_seed, &state.user_id)?;
        Ok(Self::new(db, key))
    }

    /// Writer for the configured device. With `autoSyncOnWrite` set and the
    /// vault enabled, every write is followed by a sync cycle.
    pub fn from_config(db: SharedDb, config: &Config) -> Result<Self, SyncError> {
        let writer = Self::from_vault_state(db.clone())?;
        if !(config.auto_sync_on_write && config.vault.enabled) {
            return Ok(writer);
        }
        let engine = SyncEngine::from_config(db, &config.vault)?;
        Ok(writer.with_auto_sync(Arc::new(engine)))
    }

    /// Kick off a sync cycle after each successful write.
    pub fn with_auto_sync(mut self, engine: Arc<SyncEngine>) -> Self {
        self.auto_sync = Some(engine);
        self
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    /// Insert a contact. A blank id is replaced with a fresh UUID.
    pub fn create_contact(&self, mut contact: DbContact) -> Result<DbContact, SyncError> {
        require("contact name", &contact.name)?;
        if contact.id.trim().is_empty() {
            contact.id = new_id();
        }
        let now = now_ts();
        contact.created_at = now.clone();
        contact.updated_at = now;
        self.save_contact(contact)
    }

    pub fn update_contact(&self, contact: &DbContact) -> Result<DbContact, SyncError> {
        require("contact name", &contact.name)?;
        existing_contact(&self.db.lock(), &contact.id)?;
        self.save_contact(contact.clone())
    }

    fn save_contact(&self, contact: DbContact) -> Result<DbContact, SyncError> {
        self.write(|tx| {
            tx.upsert_contact(&contact)?;
            let stored = existing_contact(tx, &contact.id)?;
            let company = company_name(tx, stored.company_id.as_deref())?;
            let change = Change::upsert(Payload::Contact(ContactPayload::from_row(&stored, &company)));
            Ok((stored, Some(change)))
        })
    }

    /// Returns false (and queues nothing) when the contact did not exist.
    pub fn delete_contact(&self, id: &str) -> Result<bool, SyncError> {
        self.write(|tx| {
            let deleted = tx.delete_contact(id)?;
            Ok((deleted, deleted.then(|| Change::delete(TAG_CONTACT, id))))
        })
    }

    // =========================================================================
    // Companies
    // =========================================================================

    pub fn create_company(&self, mut company: DbCompany) -> Result<DbCompany, SyncError> {
        require("company name", &company.name)?;
        if company.id.trim().is_empty() {
            company.id = new_id();
        }
        self.save_company(company)
    }

    pub fn update_company(&self, company: &DbCompany) -> Result<DbCompany, SyncError> {
        require("company name", &company.name)?;
        existing_company(&self.db.lock(), &company.id)?;
        self.save_company(company.clone())
    }

    fn save_company(&self, company: DbCompany) -> Result<DbCompany, SyncError> {
        self.write(|tx| {
            tx.upsert_company(&company)?;
            let stored = existing_company(tx, &company.id)?;
            let change = Change::upsert(Payload::Company(CompanyPayload::from_row(&stored)));
            Ok((stored, Some(change)))
        })
    }

    /// Deleting a company also removes its deals locally; peers do the same
    /// through the same foreign keys.
    pub fn delete_company(&self, id: &str) -> Result<bool, SyncError> {
        self.write(|tx| {
            let deleted = tx.delete_company(id)?;
            Ok((deleted, deleted.then(|| Change::delete(TAG_COMPANY, id))))
        })
    }

    // =========================================================================
    // Deals
    // =========================================================================

    pub fn create_deal(&self, mut deal: DbDeal) -> Result<DbDeal, SyncError> {
        require("deal title", &deal.title)?;
        if deal.id.trim().is_empty() {
            deal.id = new_id();
        }
        let now = now_ts();
        deal.created_at = now.clone();
        deal.last_activity_at = now;
        self.save_deal(deal)
    }

    pub fn update_deal(&self, deal: &DbDeal) -> Result<DbDeal, SyncError> {
        require("deal title", &deal.title)?;
        existing_deal(&self.db.lock(), &deal.id)?;
        self.save_deal(deal.clone())
    }

    fn save_deal(&self, mut deal: DbDeal) -> Result<DbDeal, SyncError> {
        deal.currency = match deal.currency.trim() {
            "" => "USD".to_string(),
            c => c.to_uppercase(),
        };
        self.write(|tx| {
            existing_company(tx, &deal.company_id)?;
            if let Some(contact_id) = deal.contact_id.as_deref() {
                existing_contact(tx, contact_id)?;
            }
            tx.upsert_deal(&deal)?;
            let stored = existing_deal(tx, &deal.id)?;
            let company = company_name(tx, Some(&stored.company_id))?;
            let contact = contact_name(tx, stored.contact_id.as_deref())?;
            let change = Change::upsert(Payload::Deal(DealPayload::from_row(
                &stored, &company, &contact,
            )));
            Ok((stored, Some(change)))
        })
    }

    pub fn delete_deal(&self, id: &str) -> Result<bool, SyncError> {
        self.write(|tx| {
            let deleted = tx.delete_deal(id)?;
            Ok((deleted, deleted.then(|| Change::delete(TAG_DEAL, id))))
        })
    }

    /// Append a note. Advances the deal's activity and its contact's
    /// `last_contacted_at`.
    pub fn add_deal_note(&self, deal_id: &str, content: &str) -> Result<DbDealNote, SyncError> {
        require("note content", content)?;
        self.write(|tx| {
            let deal = existing_deal(tx, deal_id)?;
            let note = DbDealNote {
                id: new_id(),
                deal_id: deal.id.clone(),
                content: content.to_string(),
                created_at: now_ts(),
            };
            tx.add_deal_note(&note)?;
            let company = company_name(tx, Some(&deal.company_id))?;
            let change = Change::upsert(Payload::DealNote(DealNotePayload::from_row(
                &note, &deal, &company,
            )));
            Ok((note, Some(change)))
        })
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Insert or update a relationship. The pair is stored canonically; a
    /// blank id is replaced with a fresh UUID.
    pub fn upsert_relationship(&self, mut rel: DbRelationship) -> Result<DbRelationship, SyncError> {
        require("relationship type", &rel.relationship_type)?;
        if rel.contact_id_1 == rel.contact_id_2 {
            return Err(SyncError::Payload(format!(
                "contact {} cannot be related to itself",
                rel.contact_id_1
            )));
        }
        if rel.id.trim().is_empty() {
            rel.id = new_id();
        }
        self.write(|tx| {
            let first = existing_contact(tx, &rel.contact_id_1)?;
            let second = existing_contact(tx, &rel.contact_id_2)?;
            let stored = tx.upsert_relationship(&rel)?;
            let (name_1, name_2) = if stored.contact_id_1 == first.id {
                (first.name, second.name)
            } else {
                (second.name, first.name)
            };
            let change = Change::upsert(Payload::Relationship(RelationshipPayload::from_row(
                &stored, &name_1, &name_2,
            )));
            Ok((stored, Some(change)))
        })
    }

    pub fn delete_relationship(&self, id: &str) -> Result<bool, SyncError> {
        self.write(|tx| {
            let deleted = tx.delete_relationship(id)?;
            Ok((deleted, deleted.then(|| Change::delete(TAG_RELATIONSHIP, id))))
        })
    }

    // =========================================================================
    // Interactions and cadence
    // =========================================================================

    /// Record an interaction and advance the contact's `last_contacted_at`.
    pub fn log_interaction(
        &self,
        contact_id: &str,
        interaction_type: InteractionType,
        interacted_at: &str,
        sentiment: Option<Sentiment>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<DbInteraction, SyncError> {
        let interacted_at = canonical_ts(interacted_at).ok_or_else(|| {
            SyncError::Payload(format!("interacted_at: '{interacted_at}' is not a valid timestamp"))
        })?;
        self.write(|tx| {
            let contact = existing_contact(tx, contact_id)?;
            let log = DbInteraction {
                id: new_id(),
                contact_id: contact.id.clone(),
                interaction_type,
                interacted_at,
                sentiment,
                metadata,
                created_at: now_ts(),
            };
            tx.insert_interaction(&log)?;
            let change = Change::upsert(Payload::InteractionLog(InteractionLogPayload::from_row(
                &log,
                &contact.name,
            )));
            Ok((log, Some(change)))
        })
    }

    pub fn set_cadence(&self, cadence: &DbCadence) -> Result<DbCadence, SyncError> {
        if cadence.cadence_days <= 0 {
            return Err(SyncError::Payload(format!(
                "cadence_days must be positive, got {}",
                cadence.cadence_days
            )));
        }
        self.write(|tx| {
            let contact = existing_contact(tx, &cadence.contact_id)?;
            tx.upsert_cadence(cadence)?;
            let stored = tx.get_cadence(&contact.id)?.ok_or_else(|| {
                SyncError::Storage(format!("cadence for {} vanished after write", contact.id))
            })?;
            let change = Change::upsert(Payload::ContactCadence(ContactCadencePayload::from_row(
                &stored,
                &contact.name,
            )));
            Ok((stored, Some(change)))
        })
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Run `f` and enqueue the change it returns, all in one transaction.
    fn write<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&CrmDb) -> Result<(T, Option<Change>), SyncError>,
    {
        let (value, queued) = {
            let db = self.db.lock();
            db.with_transaction(|tx| {
                let (value, change) = f(tx)?;
                let queued = match change {
                    Some(change) => Some(self.enqueue(tx, &change)?),
                    None => None,
                };
                Ok::<_, SyncError>((value, queued))
            })?
        };
        if let Some(seq) = queued {
            log::debug!("Queued local change as outbox seq {}", seq);
            self.after_write();
        }
        Ok(value)
    }

    fn enqueue(&self, db: &CrmDb, change: &Change) -> Result<i64, SyncError> {
        let sealed = match &change.payload {
            Some(payload) => {
                let aad = envelope_aad(&change.entity, change.op, &change.entity_id);
                self.key.seal(&aad, &payload.encode()?)?
            }
            None => String::new(),
        };
        debug_assert!(change.op == ChangeOp::Delete || !sealed.is_empty());
        Ok(db.outbox_enqueue(&change.entity, &change.entity_id, change.op, &sealed)?)
    }

    fn after_write(&self) {
        let Some(engine) = self.auto_sync.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let cancel = CancelFlag::new();
                    if let Err(e) = engine.run_cycle(&cancel).await {
                        log::warn!("Sync after local write failed (change stays queued): {}", e);
                    }
                });
            }
            Err(_) => {
                log::warn!("Sync on write skipped: no async runtime; change stays queued");
            }
        }
    }
}
