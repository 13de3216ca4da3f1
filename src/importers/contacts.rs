//! Contacts import: external address-book entries merged into local contacts.

use async_trait::async_trait;

use super::{
    run_pull_cycle, ExternalItem, FetchRequest, ImportedEntity, ItemOutcome, ProviderPage,
    ProviderSource, PullOptions, PullReport, CONTACTS_SERVICE,
};
use crate::db::{CrmDb, DbContact};
use crate::error::SyncError;
use crate::google_api::people::{ConnectionsQuery, PeopleApi, PersonRecord};
use crate::matcher::IdentityMatcher;
use crate::state::SharedDb;
use crate::util::{collapse_whitespace, email_local_part, normalize_email};
use crate::vault::CancelFlag;

/// One address-book entry as the importer sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalContact {
    pub external_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub notes: String,
}

impl ExternalItem for ExternalContact {
    fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl From<PersonRecord> for ExternalContact {
    fn from(person: PersonRecord) -> Self {
        Self {
            external_id: person.resource_name,
            name: person.name,
            email: person.email,
            phone: person.phone,
            company: person.organization,
            notes: person.biography,
        }
    }
}

/// Fill empty local fields from `record`. Returns true if anything changed.
///
/// A local value is never overwritten. `company` is resolved separately since
/// it needs the store.
pub fn conservative_merge(local: &mut DbContact, record: &ExternalContact) -> bool {
    fn fill(local: &mut String, incoming: &str) -> bool {
        let incoming = incoming.trim();
        if local.trim().is_empty() && !incoming.is_empty() {
            *local = incoming.to_string();
            true
        } else {
            false
        }
    }

    let mut changed = fill(&mut local.name, &collapse_whitespace(&record.name));
    changed |= fill(&mut local.email, &normalize_email(&record.email));
    changed |= fill(&mut local.phone, &record.phone);
    changed |= fill(&mut local.notes, &record.notes);
    changed
}

/// Match `record` against the local contacts and merge or create.
pub fn import_contact(db: &CrmDb, record: &ExternalContact) -> Result<ItemOutcome, SyncError> {
    let matcher = IdentityMatcher::load(db)?;

    if let Some(found) = matcher.find(&record.name, &record.email) {
        let mut contact = found.contact;
        let mut changed = conservative_merge(&mut contact, record);
        if contact.company_id.is_none() && !record.company.trim().is_empty() {
            contact.company_id = Some(db.ensure_company_by_name(&record.company)?.id);
            changed = true;
        }
        if !changed {
            return Ok(ItemOutcome::Skipped);
        }
        db.upsert_contact(&contact)?;
        log::debug!(
            "Merged external contact {} into {} ({:?} match)",
            record.external_id,
            contact.id,
            found.method
        );
        return Ok(ItemOutcome::Updated);
    }

    let name = match collapse_whitespace(&record.name) {
        n if !n.is_empty() => n,
        _ => email_local_part(&record.email).to_string(),
    };
    if name.is_empty() {
        log::debug!("Skipping external contact {} with no name or email", record.external_id);
        return Ok(ItemOutcome::Skipped);
    }

    let mut contact = DbContact::named(&uuid::Uuid::new_v4().to_string(), &name);
    contact.email = normalize_email(&record.email);
    contact.phone = record.phone.trim().to_string();
    contact.notes = record.notes.trim().to_string();
    if !record.company.trim().is_empty() {
        contact.company_id = Some(db.ensure_company_by_name(&record.company)?.id);
    }
    db.upsert_contact(&contact)?;

    Ok(ItemOutcome::Created(ImportedEntity {
        entity_type: "contact",
        entity_id: contact.id,
        metadata: None,
    }))
}

/// Pull address-book changes from `source` into the local contacts.
pub async fn pull_contacts<S>(
    db: &SharedDb,
    source: &S,
    options: &PullOptions,
    cancel: &CancelFlag,
) -> Result<PullReport, SyncError>
where
    S: ProviderSource<Item = ExternalContact> + ?Sized,
{
    run_pull_cycle(db, source, options, cancel, import_contact).await
}

/// Google People connections as a [`ProviderSource`].
///
/// People has no time filter: a window request lists every connection.
/// Deleted connections are dropped.
pub struct GooglePeopleSource {
    api: PeopleApi,
}

impl GooglePeopleSource {
    pub fn new(access_token: &str) -> Self {
        Self {
            api: PeopleApi::new(access_token),
        }
    }
}

#[async_trait]
impl ProviderSource for GooglePeopleSource {
    type Item = ExternalContact;

    fn service(&self) -> &'static str {
        CONTACTS_SERVICE
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ProviderPage<ExternalContact>, SyncError> {
        let query = ConnectionsQuery {
            sync_token: match request {
                FetchRequest::Token(token) => Some(token.clone()),
                FetchRequest::Window { .. } => None,
            },
            page_token: page_token.map(String::from),
            page_size,
        };
        let page = self.api.list_connections(&query).await?;
        Ok(ProviderPage {
            items: page
                .people
                .into_iter()
                .filter(|p| !p.deleted)
                .map(ExternalContact::from)
                .collect(),
            next_page_token: page.next_page_token,
            next_sync_token: page.next_sync_token,
            total: page.total_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{shared, StubSource};
    use super::*;
    use crate::db::test_utils::test_db;

    fn external(id: &str, name: &str, email: &str) -> ExternalContact {
        ExternalContact {
            external_id: id.into(),
            name: name.into(),
            email: email.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_conservative_merge_fills_only_empty_fields() {
        let db = test_db();
        let mut bob = DbContact::named("c-bob", "Bob");
        bob.email = "bob@x.io".into();
        bob.notes = "old".into();
        db.upsert_contact(&bob).unwrap();

        let mut record = external("people/c1", "Bob", "bob@x.io");
        record.phone = "555".into();
        let outcome = import_contact(&db, &record).unwrap();
        assert_eq!(outcome, ItemOutcome::Updated);

        let contacts = db.list_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].phone, "555");
        assert_eq!(contacts[0].notes, "old");
    }

    #[test]
    fn test_merge_never_overwrites() {
        let mut local = DbContact::named("c1", "Bob");
        local.phone = "111".into();
        let mut record = external("x", "Robert", "bob@x.io");
        record.phone = "222".into();
        assert!(conservative_merge(&mut local, &record));
        assert_eq!(local.name, "Bob");
        assert_eq!(local.phone, "111");
        assert_eq!(local.email, "bob@x.io");

        assert!(!conservative_merge(&mut local, &record));
    }

    #[test]
    fn test_create_attaches_company_by_name() {
        let db = test_db();
        let existing = db.ensure_company_by_name("Acme Corp").unwrap();

        let mut record = external("people/c2", "Carol  Diaz", "Carol@Acme.com");
        record.company = "acme corp".into();
        let outcome = import_contact(&db, &record).unwrap();
        let ItemOutcome::Created(entity) = outcome else {
            panic!("expected a created contact");
        };

        let contact = db.get_contact(&entity.entity_id).unwrap().unwrap();
        assert_eq!(contact.name, "Carol Diaz");
        assert_eq!(contact.email, "carol@acme.com");
        assert_eq!(contact.company_id.as_deref(), Some(existing.id.as_str()));
        assert_eq!(db.list_companies().unwrap().len(), 1);
    }

    #[test]
    fn test_name_falls_back_to_email_local_part() {
        let db = test_db();
        let outcome = import_contact(&db, &external("people/c3", " ", "dana@startup.io")).unwrap();
        let ItemOutcome::Created(entity) = outcome else {
            panic!("expected a created contact");
        };
        assert_eq!(db.get_contact(&entity.entity_id).unwrap().unwrap().name, "dana");

        let outcome = import_contact(&db, &external("people/c4", "", "")).unwrap();
        assert_eq!(outcome, ItemOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_pull_logs_created_contacts_only() {
        let db = shared(test_db());
        let mut bob = DbContact::named("c-bob", "Bob");
        bob.email = "bob@x.io".into();
        db.lock().upsert_contact(&bob).unwrap();

        let mut merged = external("people/c1", "Bob", "bob@x.io");
        merged.phone = "555".into();
        let source = StubSource::new(
            CONTACTS_SERVICE,
            vec![Ok(ProviderPage::last(
                vec![merged, external("people/c2", "Erin", "erin@y.io")],
                Some("sync-1".into()),
            ))],
        );

        let report = pull_contacts(&db, &source, &PullOptions::default(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 1);

        let db = db.lock();
        let log = db.list_provider_log(CONTACTS_SERVICE).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].source_external_id, "people/c2");
        assert_eq!(log[0].entity_type, "contact");
        assert_eq!(db.list_contacts().unwrap().len(), 2);
    }
}
