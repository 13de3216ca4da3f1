//! Mail import: every counterpart on a message becomes a contact (matched by
//! email or created) with an `email` interaction at the message date.
//!
//! Business domains also yield a company, named after the domain. Consumer
//! mailbox domains (gmail.com, outlook.com, ...) never do.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    run_pull_cycle, ExternalItem, FetchRequest, ImportSettings, ImportedEntity, ItemOutcome,
    ProviderPage, ProviderSource, PullOptions, PullReport, MAIL_SERVICE,
};
use crate::db::{CrmDb, DbContact, DbInteraction, InteractionType};
use crate::error::SyncError;
use crate::google_api::gmail::{GmailApi, MailMessage, MessagesQuery};
use crate::matcher::IdentityMatcher;
use crate::state::SharedDb;
use crate::util::{
    collapse_whitespace, email_domain, email_local_part, format_ts, is_consumer_domain,
    normalize_email, now_ts,
};
use crate::vault::CancelFlag;

/// One message reduced to what the importer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMessage {
    pub external_id: String,
    /// `(display_name, email)`, sender first.
    pub participants: Vec<(String, String)>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl ExternalItem for ExternalMessage {
    fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl From<MailMessage> for ExternalMessage {
    fn from(message: MailMessage) -> Self {
        let participants = message
            .participants()
            .into_iter()
            .map(|m| (m.name.clone(), m.email.clone()))
            .collect();
        Self {
            external_id: message.id,
            participants,
            sent_at: message.sent_at,
        }
    }
}

/// Find the contact owning `email`, or create one.
///
/// A new contact is named `display_name`, falling back to the email's local
/// part, and is attached to the company derived from a non-consumer domain.
/// An existing contact without a company gets the derived one. Returns the
/// contact and whether it was created; `None` for a blank address.
pub fn find_or_create_email_contact(
    db: &CrmDb,
    matcher: &IdentityMatcher,
    display_name: &str,
    email: &str,
    extra_consumer_domains: &[String],
) -> Result<Option<(DbContact, bool)>, SyncError> {
    let email = normalize_email(email);
    if email.is_empty() || !email.contains('@') {
        return Ok(None);
    }

    let derive_company = || -> Result<Option<String>, SyncError> {
        let domain = email_domain(&email);
        if is_consumer_domain(&domain, extra_consumer_domains) {
            return Ok(None);
        }
        Ok(db.ensure_company_from_domain(&domain)?.map(|c| c.id))
    };

    if let Some(found) = matcher.find("", &email) {
        let mut contact = found.contact;
        if contact.company_id.is_none() {
            if let Some(company_id) = derive_company()? {
                contact.company_id = Some(company_id);
                db.upsert_contact(&contact)?;
            }
        }
        return Ok(Some((contact, false)));
    }

    let name = match collapse_whitespace(display_name) {
        n if !n.is_empty() && !n.contains('@') => n,
        _ => email_local_part(&email).to_string(),
    };
    let mut contact = DbContact::named(&uuid::Uuid::new_v4().to_string(), &name);
    contact.company_id = derive_company()?;
    contact.email = email;
    db.upsert_contact(&contact)?;
    log::debug!("Created contact {} from mail address", contact.id);
    Ok(Some((contact, true)))
}

/// Log one interaction per counterpart, skipping the account owner.
///
/// The matcher is rebuilt per address so a contact created for an earlier
/// participant is found again rather than duplicated.
pub(super) fn log_counterpart_interactions(
    db: &CrmDb,
    participants: &[(String, String)],
    interaction_type: InteractionType,
    at: DateTime<Utc>,
    metadata: BTreeMap<String, serde_json::Value>,
    settings: &ImportSettings,
) -> Result<ItemOutcome, SyncError> {
    let at = format_ts(at);
    let mut interaction_ids = Vec::new();
    let mut contact_ids = Vec::new();

    for (name, email) in participants {
        if settings.is_owner(email) {
            continue;
        }
        let matcher = IdentityMatcher::load(db)?;
        let Some((contact, _)) = find_or_create_email_contact(
            db,
            &matcher,
            name,
            email,
            &settings.extra_consumer_domains,
        )?
        else {
            continue;
        };
        if contact_ids.contains(&contact.id) {
            continue;
        }

        let interaction = DbInteraction {
            id: uuid::Uuid::new_v4().to_string(),
            contact_id: contact.id.clone(),
            interaction_type,
            interacted_at: at.clone(),
            sentiment: None,
            metadata: Some(metadata.clone()),
            created_at: now_ts(),
        };
        db.insert_interaction(&interaction)?;
        interaction_ids.push(interaction.id);
        contact_ids.push(contact.id);
    }

    let Some(first) = interaction_ids.first().cloned() else {
        return Ok(ItemOutcome::Skipped);
    };
    Ok(ItemOutcome::Created(ImportedEntity {
        entity_type: "interaction_log",
        entity_id: first,
        metadata: Some(serde_json::json!({
            "interactionIds": interaction_ids,
            "contactIds": contact_ids,
        })),
    }))
}

/// Record an `email` interaction for each counterpart on `message`.
pub fn import_message(
    db: &CrmDb,
    message: &ExternalMessage,
    settings: &ImportSettings,
) -> Result<ItemOutcome, SyncError> {
    let Some(sent_at) = message.sent_at else {
        log::debug!("Skipping message {} with no date", message.external_id);
        return Ok(ItemOutcome::Skipped);
    };
    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!(MAIL_SERVICE));
    metadata.insert("messageId".to_string(), serde_json::json!(message.external_id));

    log_counterpart_interactions(
        db,
        &message.participants,
        InteractionType::Email,
        sent_at,
        metadata,
        settings,
    )
}

pub async fn pull_mail<S>(
    db: &SharedDb,
    source: &S,
    options: &PullOptions,
    settings: &ImportSettings,
    cancel: &CancelFlag,
) -> Result<PullReport, SyncError>
where
    S: ProviderSource<Item = ExternalMessage> + ?Sized,
{
    run_pull_cycle(db, source, options, cancel, |tx: &CrmDb, message: &ExternalMessage| {
        import_message(tx, message, settings)
    })
    .await
}

/// Gmail as a [`ProviderSource`]. The sync token is Gmail's `historyId`.
pub struct GmailSource {
    api: GmailApi,
}

impl GmailSource {
    pub fn new(access_token: &str) -> Self {
        Self {
            api: GmailApi::new(access_token),
        }
    }
}

#[async_trait]
impl ProviderSource for GmailSource {
    type Item = ExternalMessage;

    fn service(&self) -> &'static str {
        MAIL_SERVICE
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ProviderPage<ExternalMessage>, SyncError> {
        let mut query = MessagesQuery {
            page_token: page_token.map(String::from),
            page_size,
            ..Default::default()
        };
        match request {
            FetchRequest::Token(history_id) => query.history_id = Some(history_id.clone()),
            FetchRequest::Window { since, until } => {
                query.after = Some(*since);
                query.before = Some(*until);
            }
        }
        let page = self.api.list_messages(&query).await?;
        Ok(ProviderPage {
            items: page.messages.into_iter().map(ExternalMessage::from).collect(),
            next_page_token: page.next_page_token,
            next_sync_token: page.next_history_id,
            total: page.total_estimate,
        })
    }
}
