//! Apply one inbound vault change to the local store.
//!
//! Every apply is idempotent: upserts are keyed by id, deletes tolerate
//! missing rows, notes and interactions are write-once, and timestamps only
//! move forward. Rows referenced before they arrive are created as
//! placeholders (incoming id, best-effort name, everything else empty) and
//! filled in by the later upsert of the same id.
//!
//! Callers run [`apply_change`] inside a transaction scoped to the change.

use crate::db::{
    ChangeOp, CrmDb, DbCadence, DbCompany, DbContact, DbDeal, DbDealNote, DbInteraction,
    DbRelationship,
};
use crate::error::SyncError;
use crate::util::{canonical_ts, now_ts};

use super::payload::{
    Change, CompanyPayload, ContactCadencePayload, ContactPayload, DealNotePayload, DealPayload,
    InteractionLogPayload, Payload, RelationshipPayload,
};

/// What applying a change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store was written (or already matched).
    Applied,
    /// Nothing to do for this entity/op.
    Ignored,
}

/// Parse a required id. Returns the canonical lowercase hyphenated form.
fn parse_id(field: &str, value: &str) -> Result<String, SyncError> {
    uuid::Uuid::parse_str(value.trim())
        .map(|u| u.to_string())
        .map_err(|_| SyncError::Payload(format!("{field}: '{value}' is not a valid UUID")))
}

/// Parse an optional reference id. Anything that does not parse counts as absent.
fn parse_ref(value: &str) -> Option<String> {
    uuid::Uuid::parse_str(value.trim()).ok().map(|u| u.to_string())
}

/// Parse a required timestamp into canonical form.
fn parse_required_ts(field: &str, value: &str) -> Result<String, SyncError> {
    canonical_ts(value)
        .ok_or_else(|| SyncError::Payload(format!("{field}: '{value}' is not a valid timestamp")))
}

/// Parse an optional timestamp: blank is `None`, malformed is an error.
fn parse_optional_ts(field: &str, value: Option<&str>) -> Result<Option<String>, SyncError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => parse_required_ts(field, v).map(Some),
    }
}

/// Apply a decrypted change. See the module docs for the per-entity rules.
pub fn apply_change(db: &CrmDb, change: &Change) -> Result<ApplyOutcome, SyncError> {
    match change.op {
        ChangeOp::Upsert => match &change.payload {
            Some(Payload::Contact(p)) => upsert_contact(db, p),
            Some(Payload::Company(p)) => upsert_company(db, p),
            Some(Payload::Deal(p)) => upsert_deal(db, p),
            Some(Payload::DealNote(p)) => upsert_deal_note(db, p),
            Some(Payload::Relationship(p)) => upsert_relationship(db, p),
            Some(Payload::InteractionLog(p)) => upsert_interaction(db, p),
            Some(Payload::ContactCadence(p)) => upsert_cadence(db, p),
            Some(Payload::Suggestion(p)) => {
                log::debug!("Ignoring remote suggestion {}", p.id);
                Ok(ApplyOutcome::Ignored)
            }
            Some(Payload::Unknown { tag }) => {
                log::debug!("Ignoring change for unknown entity '{}'", tag);
                Ok(ApplyOutcome::Ignored)
            }
            None => Err(SyncError::Payload(format!(
                "upsert of {} {} has no payload",
                change.entity, change.entity_id
            ))),
        },
        ChangeOp::Delete => apply_delete(db, &change.entity, &change.entity_id),
    }
}

fn apply_delete(db: &CrmDb, entity: &str, entity_id: &str) -> Result<ApplyOutcome, SyncError> {
    use super::payload::{TAG_COMPANY, TAG_CONTACT, TAG_DEAL, TAG_RELATIONSHIP};

    let deleted = match entity {
        TAG_CONTACT => db.delete_contact(&parse_id("contact.id", entity_id)?)?,
        TAG_COMPANY => db.delete_company(&parse_id("company.id", entity_id)?)?,
        TAG_DEAL => db.delete_deal(&parse_id("deal.id", entity_id)?)?,
        TAG_RELATIONSHIP => db.delete_relationship(&parse_id("relationship.id", entity_id)?)?,
        // Notes and interactions are append-only; cadence and suggestions
        // are owned locally.
        other => {
            log::debug!("Delete of {} {} is a no-op", other, entity_id);
            return Ok(ApplyOutcome::Ignored);
        }
    };
    if !deleted {
        log::debug!("Delete of {} {}: already gone", entity, entity_id);
    }
    Ok(ApplyOutcome::Applied)
}

fn upsert_contact(db: &CrmDb, p: &ContactPayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("contact.id", &p.id)?;
    let last_contacted_at =
        parse_optional_ts("contact.last_contacted_at", p.last_contacted_at.as_deref())?;

    let company_id = match parse_ref(&p.company_id) {
        Some(company_id) => Some(db.ensure_company(&company_id, &p.company_name)?.id),
        None if !p.company_name.trim().is_empty() => {
            db.find_company_by_name(&p.company_name)?.map(|c| c.id)
        }
        None => None,
    };

    let existing = db.get_contact(&id)?;
    let now = now_ts();
    let contact = DbContact {
        id: id.clone(),
        name: p.name.clone(),
        email: p.email.clone(),
        phone: p.phone.clone(),
        company_id,
        notes: p.notes.clone(),
        last_contacted_at: last_contacted_at.clone(),
        created_at: existing.map(|c| c.created_at).unwrap_or_else(|| now.clone()),
        updated_at: now,
    };
    db.upsert_contact(&contact)?;

    if let Some(at) = last_contacted_at {
        db.bump_contact_last_contacted(&id, &at)?;
    }
    Ok(ApplyOutcome::Applied)
}

fn upsert_company(db: &CrmDb, p: &CompanyPayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("company.id", &p.id)?;
    let now = now_ts();
    let created_at = db
        .get_company(&id)?
        .map(|c| c.created_at)
        .unwrap_or_else(|| now.clone());
    db.upsert_company(&DbCompany {
        id,
        name: p.name.clone(),
        domain: p.domain.clone(),
        industry: p.industry.clone(),
        notes: p.notes.clone(),
        created_at,
        updated_at: now,
    })?;
    Ok(ApplyOutcome::Applied)
}

/// Resolve the company a deal belongs to: by id (creating a placeholder when
/// missing), else by existing name. A deal with neither is unresolvable.
fn resolve_company_for_deal(
    db: &CrmDb,
    company_id: &str,
    company_name: &str,
) -> Result<String, SyncError> {
    if let Some(id) = parse_ref(company_id) {
        return Ok(db.ensure_company(&id, company_name)?.id);
    }
    if !company_name.trim().is_empty() {
        return match db.find_company_by_name(company_name)? {
            Some(company) => Ok(company.id),
            None => Err(SyncError::RefResolution(format!(
                "no company named '{}' and no usable company_id",
                company_name.trim()
            ))),
        };
    }
    Err(SyncError::RefResolution(
        "deal has neither company_id nor company_name".to_string(),
    ))
}

/// Resolve an optional contact reference: by id (placeholder allowed), else
/// by existing name. Never creates a contact from a name alone.
fn resolve_optional_contact(
    db: &CrmDb,
    contact_id: &str,
    contact_name: &str,
) -> Result<Option<String>, SyncError> {
    if let Some(id) = parse_ref(contact_id) {
        return Ok(Some(db.ensure_contact(&id, contact_name)?.id));
    }
    if contact_name.trim().is_empty() {
        return Ok(None);
    }
    Ok(db.find_contacts_by_name(contact_name)?.into_iter().next().map(|c| c.id))
}

fn upsert_deal(db: &CrmDb, p: &DealPayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("deal.id", &p.id)?;
    let expected_close_date =
        parse_optional_ts("deal.expected_close_date", p.expected_close_date.as_deref())?;
    let company_id = resolve_company_for_deal(db, &p.company_id, &p.company_name)?;
    let contact_id = resolve_optional_contact(db, &p.contact_id, &p.contact_name)?;

    let now = now_ts();
    let (created_at, last_activity_at) = match db.get_deal(&id)? {
        Some(existing) => (existing.created_at, existing.last_activity_at),
        None => (now.clone(), now.clone()),
    };
    let currency = p.currency.trim();
    db.upsert_deal(&DbDeal {
        id,
        title: p.title.trim().to_string(),
        amount: p.amount,
        currency: if currency.is_empty() { "USD".to_string() } else { currency.to_uppercase() },
        stage: p.stage,
        company_id,
        contact_id,
        expected_close_date,
        created_at,
        last_activity_at,
        updated_at: now,
    })?;
    Ok(ApplyOutcome::Applied)
}

fn upsert_deal_note(db: &CrmDb, p: &DealNotePayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("deal_note.id", &p.id)?;
    let deal_id = parse_id("deal_note.deal_id", &p.deal_id)?;
    let created_at = match parse_optional_ts("deal_note.created_at", Some(&p.created_at))? {
        Some(ts) => ts,
        None => now_ts(),
    };

    if db.get_deal(&deal_id)?.is_none() {
        let company_id = match parse_ref(&p.deal_company_id) {
            Some(company_id) => db.ensure_company(&company_id, &p.deal_company_name)?.id,
            None if !p.deal_company_name.trim().is_empty() => {
                db.ensure_company_by_name(&p.deal_company_name)?.id
            }
            None => {
                return Err(SyncError::RefResolution(format!(
                    "note {id} references unknown deal {deal_id} without a company"
                )))
            }
        };
        db.ensure_deal(&deal_id, &p.deal_title, &company_id)?;
        log::info!("Synthesized placeholder deal {} for note {}", deal_id, id);
    }

    db.add_deal_note(&DbDealNote {
        id,
        deal_id,
        content: p.content.clone(),
        created_at,
    })?;
    Ok(ApplyOutcome::Applied)
}

/// Resolve one side of a relationship: id (placeholder allowed), then
/// existing name, then a fresh placeholder carrying the name.
fn resolve_relationship_side(
    db: &CrmDb,
    side: &str,
    contact_id: &str,
    name: &str,
) -> Result<String, SyncError> {
    if let Some(id) = parse_ref(contact_id) {
        return Ok(db.ensure_contact(&id, name)?.id);
    }
    if name.trim().is_empty() {
        return Err(SyncError::Payload(format!(
            "relationship {side} has neither a valid id nor a name"
        )));
    }
    if let Some(existing) = db.find_contacts_by_name(name)?.into_iter().next() {
        return Ok(existing.id);
    }
    let fresh = uuid::Uuid::new_v4().to_string();
    log::debug!("Creating placeholder contact {} for '{}'", fresh, name.trim());
    Ok(db.ensure_contact(&fresh, name)?.id)
}

fn upsert_relationship(db: &CrmDb, p: &RelationshipPayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("relationship.id", &p.id)?;
    let c1 = resolve_relationship_side(db, "contact_1", &p.contact_id_1, &p.contact_1_name)?;
    let c2 = resolve_relationship_side(db, "contact_2", &p.contact_id_2, &p.contact_2_name)?;
    if c1 == c2 {
        return Err(SyncError::Payload(format!(
            "relationship {id} links contact {c1} to itself"
        )));
    }

    let now = now_ts();
    let created_at = db
        .get_relationship(&id)?
        .map(|r| r.created_at)
        .unwrap_or_else(|| now.clone());
    db.upsert_relationship(&DbRelationship {
        id,
        contact_id_1: c1,
        contact_id_2: c2,
        relationship_type: p.relationship_type.clone(),
        context: p.context.clone(),
        created_at,
        updated_at: now,
    })?;
    Ok(ApplyOutcome::Applied)
}

fn upsert_interaction(db: &CrmDb, p: &InteractionLogPayload) -> Result<ApplyOutcome, SyncError> {
    let id = parse_id("interaction_log.id", &p.id)?;
    let interacted_at = parse_required_ts("interaction_log.interacted_at", &p.interacted_at)?;

    let contact_id = match parse_ref(&p.contact_id) {
        Some(contact_id) => db.ensure_contact(&contact_id, &p.contact_name)?.id,
        None => match db.find_contacts_by_name(&p.contact_name)?.into_iter().next() {
            Some(contact) => contact.id,
            None => {
                return Err(SyncError::RefResolution(format!(
                    "interaction {id} has no usable contact_id and no contact named '{}'",
                    p.contact_name.trim()
                )))
            }
        },
    };

    db.insert_interaction(&DbInteraction {
        id,
        contact_id,
        interaction_type: p.interaction_type,
        interacted_at,
        sentiment: p.sentiment,
        metadata: p.metadata.clone(),
        created_at: now_ts(),
    })?;
    Ok(ApplyOutcome::Applied)
}

fn upsert_cadence(db: &CrmDb, p: &ContactCadencePayload) -> Result<ApplyOutcome, SyncError> {
    let contact_id = parse_id("contact_cadence.id", &p.id)?;
    db.ensure_contact(&contact_id, &p.contact_name)?;
    db.upsert_cadence(&DbCadence {
        contact_id,
        cadence_days: p.cadence_days,
        relationship_strength: p.relationship_strength,
        priority_score: p.priority_score,
        updated_at: now_ts(),
    })?;
    Ok(ApplyOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{DealStage, InteractionType};
    use crate::vault::payload::{SuggestionPayload, TAG_CONTACT, TAG_DEAL_NOTE};

    const CO1: &str = "00000000-0000-4000-8000-0000000000c1";
    const D1: &str = "00000000-0000-4000-8000-0000000000d1";
    const U1: &str = "00000000-0000-4000-8000-000000000001";
    const U2: &str = "00000000-0000-4000-8000-000000000002";

    fn apply(db: &CrmDb, change: Change) -> Result<ApplyOutcome, SyncError> {
        db.with_transaction(|tx| apply_change(tx, &change))
    }

    fn contact_payload(id: &str, name: &str, email: &str) -> ContactPayload {
        ContactPayload {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            phone: String::new(),
            company_id: String::new(),
            company_name: String::new(),
            notes: String::new(),
            last_contacted_at: None,
        }
    }

    fn deal_payload(company_id: &str, company_name: &str) -> DealPayload {
        DealPayload {
            id: D1.into(),
            title: "Renewal".into(),
            amount: 120_000,
            currency: "usd".into(),
            stage: DealStage::Negotiation,
            company_id: company_id.into(),
            company_name: company_name.into(),
            contact_id: String::new(),
            contact_name: String::new(),
            expected_close_date: None,
        }
    }

    fn interaction_payload(id: &str, at: &str) -> InteractionLogPayload {
        InteractionLogPayload {
            id: id.into(),
            contact_id: U1.into(),
            contact_name: "Alice".into(),
            interaction_type: InteractionType::Call,
            interacted_at: at.into(),
            sentiment: None,
            metadata: None,
        }
    }

    #[test]
    fn test_deal_before_company() {
        let db = test_db();
        apply(&db, Change::upsert(Payload::Deal(deal_payload(CO1, "Acme")))).unwrap();
        assert_eq!(db.get_company(CO1).unwrap().unwrap().name, "Acme");

        apply(
            &db,
            Change::upsert(Payload::Company(CompanyPayload {
                id: CO1.into(),
                name: "Acme Corp".into(),
                domain: "acme.com".into(),
                industry: String::new(),
                notes: String::new(),
            })),
        )
        .unwrap();

        assert_eq!(db.get_company(CO1).unwrap().unwrap().name, "Acme Corp");
        let deal = db.get_deal(D1).unwrap().unwrap();
        assert_eq!(deal.company_id, CO1);
        assert_eq!(deal.currency, "USD");
    }

    #[test]
    fn test_expected_close_date_stored_canonical() {
        let db = test_db();
        let mut payload = deal_payload(CO1, "Acme");
        payload.expected_close_date = Some("2026-03-31T09:00:00+02:00".into());
        apply(&db, Change::upsert(Payload::Deal(payload.clone()))).unwrap();
        let deal = db.get_deal(D1).unwrap().unwrap();
        assert_eq!(deal.expected_close_date.as_deref(), Some("2026-03-31T07:00:00Z"));

        payload.expected_close_date = Some(" 2026-04-30 ".into());
        apply(&db, Change::upsert(Payload::Deal(payload))).unwrap();
        let deal = db.get_deal(D1).unwrap().unwrap();
        assert_eq!(deal.expected_close_date.as_deref(), Some("2026-04-30T00:00:00Z"));
    }

    #[test]
    fn test_placeholder_company_named_by_id_when_name_blank() {
        let db = test_db();
        apply(&db, Change::upsert(Payload::Deal(deal_payload(CO1, "")))).unwrap();
        assert_eq!(db.get_company(CO1).unwrap().unwrap().name, CO1);
    }

    #[test]
    fn test_deal_by_unknown_company_name_fails() {
        let db = test_db();
        let err = apply(&db, Change::upsert(Payload::Deal(deal_payload("", "Nobody Inc")))).unwrap_err();
        assert!(matches!(err, SyncError::RefResolution(_)));
        let err = apply(&db, Change::upsert(Payload::Deal(deal_payload("", "")))).unwrap_err();
        assert!(matches!(err, SyncError::RefResolution(_)));
        assert!(db.get_deal(D1).unwrap().is_none());
    }

    #[test]
    fn test_deal_by_existing_company_name() {
        let db = test_db();
        db.ensure_company(CO1, "Acme").unwrap();
        apply(&db, Change::upsert(Payload::Deal(deal_payload("not-a-uuid", "ACME")))).unwrap();
        assert_eq!(db.get_deal(D1).unwrap().unwrap().company_id, CO1);
    }

    #[test]
    fn test_deal_replay_is_idempotent() {
        let db = test_db();
        let change = Change::upsert(Payload::Deal(deal_payload(CO1, "Acme")));
        apply(&db, change.clone()).unwrap();
        let first = db.get_deal(D1).unwrap().unwrap();
        apply(&db, change).unwrap();
        let second = db.get_deal(D1).unwrap().unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.last_activity_at, second.last_activity_at);
        assert_eq!(first.title, second.title);
        assert_eq!(db.list_companies().unwrap().len(), 1);
    }

    #[test]
    fn test_deal_note_synthesizes_placeholders() {
        let db = test_db();
        let note_id = "00000000-0000-4000-8000-0000000000a1";
        let deal_id = "00000000-0000-4000-8000-0000000000d9";
        let company_id = "00000000-0000-4000-8000-0000000000c9";
        let t = "2025-03-01T12:00:00Z";
        apply(
            &db,
            Change::upsert(Payload::DealNote(DealNotePayload {
                id: note_id.into(),
                deal_id: deal_id.into(),
                deal_title: "X".into(),
                deal_company_id: company_id.into(),
                deal_company_name: "Y".into(),
                content: "hi".into(),
                created_at: t.into(),
            })),
        )
        .unwrap();

        assert_eq!(db.get_company(company_id).unwrap().unwrap().name, "Y");
        let deal = db.get_deal(deal_id).unwrap().unwrap();
        assert_eq!(deal.title, "X");
        assert_eq!(deal.stage, DealStage::Unknown);
        assert_eq!(deal.currency, "USD");
        assert!(deal.last_activity_at.as_str() >= t);
        let notes = db.list_deal_notes(deal_id).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, note_id);

        // Notes are append-only.
        assert_eq!(
            apply(&db, Change::delete(TAG_DEAL_NOTE, note_id)).unwrap(),
            ApplyOutcome::Ignored
        );
        assert_eq!(db.list_deal_notes(deal_id).unwrap().len(), 1);
    }

    #[test]
    fn test_relationship_canonicalized() {
        let db = test_db();
        apply(
            &db,
            Change::upsert(Payload::Relationship(RelationshipPayload {
                id: "00000000-0000-4000-8000-0000000000f1".into(),
                contact_id_1: U2.into(),
                contact_id_2: U1.into(),
                contact_1_name: "Two".into(),
                contact_2_name: "One".into(),
                relationship_type: "colleague".into(),
                context: "met at conf".into(),
            })),
        )
        .unwrap();

        let rel = db
            .get_relationship("00000000-0000-4000-8000-0000000000f1")
            .unwrap()
            .unwrap();
        assert_eq!(rel.contact_id_1, U1);
        assert_eq!(rel.contact_id_2, U2);
        assert_eq!(db.get_contact(U2).unwrap().unwrap().name, "Two");
    }

    #[test]
    fn test_relationship_side_by_name_creates_placeholder() {
        let db = test_db();
        db.ensure_contact(U1, "One").unwrap();
        apply(
            &db,
            Change::upsert(Payload::Relationship(RelationshipPayload {
                id: "00000000-0000-4000-8000-0000000000f2".into(),
                contact_id_1: U1.into(),
                contact_id_2: String::new(),
                contact_1_name: String::new(),
                contact_2_name: "Dana Scully".into(),
                relationship_type: "friend".into(),
                context: String::new(),
            })),
        )
        .unwrap();
        let dana = db.find_contacts_by_name("dana scully").unwrap();
        assert_eq!(dana.len(), 1);
        assert_eq!(db.list_relationships_for_contact(&dana[0].id).unwrap().len(), 1);
    }

    #[test]
    fn test_self_relationship_rejected() {
        let db = test_db();
        let err = apply(
            &db,
            Change::upsert(Payload::Relationship(RelationshipPayload {
                id: "00000000-0000-4000-8000-0000000000f3".into(),
                contact_id_1: U1.into(),
                contact_id_2: U1.into(),
                contact_1_name: String::new(),
                contact_2_name: String::new(),
                relationship_type: "friend".into(),
                context: String::new(),
            })),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
        // The placeholder created before the check was rolled back.
        assert!(db.get_contact(U1).unwrap().is_none());
    }

    #[test]
    fn test_interactions_in_any_order_keep_max() {
        let db = test_db();
        let ids = [
            ("00000000-0000-4000-8000-0000000001a2", "2025-05-01T00:00:00Z"),
            ("00000000-0000-4000-8000-0000000001a3", "2025-07-01T09:30:00+02:00"),
            ("00000000-0000-4000-8000-0000000001a1", "2025-03-01T00:00:00Z"),
        ];
        for (id, at) in ids {
            apply(&db, Change::upsert(Payload::InteractionLog(interaction_payload(id, at)))).unwrap();
        }
        // Replays change nothing.
        apply(&db, Change::upsert(Payload::InteractionLog(interaction_payload(ids[0].0, ids[0].1)))).unwrap();

        let contact = db.get_contact(U1).unwrap().unwrap();
        assert_eq!(contact.last_contacted_at.as_deref(), Some("2025-07-01T07:30:00Z"));
        assert_eq!(db.list_interactions_for_contact(U1).unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_timestamp_is_payload_error() {
        let db = test_db();
        let err = apply(
            &db,
            Change::upsert(Payload::InteractionLog(interaction_payload(
                "00000000-0000-4000-8000-0000000001b1",
                "last tuesday",
            ))),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
        assert!(db.get_contact(U1).unwrap().is_none());
    }

    #[test]
    fn test_bad_uuid_is_payload_error() {
        let db = test_db();
        let err = apply(&db, Change::upsert(Payload::Contact(contact_payload("c1", "Alice", "")))).unwrap_err();
        assert!(matches!(err, SyncError::Payload(_)));
    }

    #[test]
    fn test_contact_upsert_and_delete_are_idempotent() {
        let db = test_db();
        let mut payload = contact_payload(U1, "Alice", "Alice@Acme.com");
        payload.last_contacted_at = Some("2025-01-02T03:04:05Z".into());
        let change = Change::upsert(Payload::Contact(payload));
        apply(&db, change.clone()).unwrap();
        let once = db.get_contact(U1).unwrap().unwrap();
        apply(&db, change).unwrap();
        let twice = db.get_contact(U1).unwrap().unwrap();
        assert_eq!(once.email, "alice@acme.com");
        assert_eq!(once.created_at, twice.created_at);
        assert_eq!(once.last_contacted_at, twice.last_contacted_at);

        assert_eq!(apply(&db, Change::delete(TAG_CONTACT, U1)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(apply(&db, Change::delete(TAG_CONTACT, U1)).unwrap(), ApplyOutcome::Applied);
        assert!(db.get_contact(U1).unwrap().is_none());
    }

    #[test]
    fn test_contact_company_by_name_is_lookup_only() {
        let db = test_db();
        let mut payload = contact_payload(U1, "Alice", "");
        payload.company_name = "Initech".into();
        apply(&db, Change::upsert(Payload::Contact(payload.clone()))).unwrap();
        assert_eq!(db.get_contact(U1).unwrap().unwrap().company_id, None);
        assert!(db.list_companies().unwrap().is_empty());

        db.ensure_company(CO1, "Initech").unwrap();
        apply(&db, Change::upsert(Payload::Contact(payload))).unwrap();
        assert_eq!(db.get_contact(U1).unwrap().unwrap().company_id.as_deref(), Some(CO1));
    }

    #[test]
    fn test_cadence_creates_placeholder_contact() {
        let db = test_db();
        apply(
            &db,
            Change::upsert(Payload::ContactCadence(ContactCadencePayload {
                id: U1.into(),
                contact_name: "Alice".into(),
                cadence_days: 21,
                relationship_strength: 0.7,
                priority_score: 3.0,
            })),
        )
        .unwrap();
        assert_eq!(db.get_contact(U1).unwrap().unwrap().name, "Alice");
        assert_eq!(db.get_cadence(U1).unwrap().unwrap().cadence_days, 21);
    }

    #[test]
    fn test_suggestion_and_unknown_are_ignored() {
        let db = test_db();
        let suggestion = Payload::Suggestion(SuggestionPayload {
            id: "s-1".into(),
            kind: "follow_up".into(),
            content: "Call Alice".into(),
            confidence: 0.9,
            source_service: "local".into(),
            status: "pending".into(),
        });
        assert_eq!(apply(&db, Change::upsert(suggestion)).unwrap(), ApplyOutcome::Ignored);
        let unknown = Payload::Unknown { tag: "calendar_hold".into() };
        assert_eq!(apply(&db, Change::upsert(unknown)).unwrap(), ApplyOutcome::Ignored);
    }
}
