//! External provider imports: one pull cycle per provider.
//!
//! Every provider follows the same loop: mark the state row `syncing`, fetch
//! pages either by saved sync token or by a time window, dedup each record
//! against `provider_sync_log`, then save the new sync token and go `idle`.
//! A token the provider no longer accepts falls back once to a window fetch.
//!
//! Provider-specific mapping lives in the submodules; network access sits
//! behind [`ProviderSource`] so the cycle runs against stubs in tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};

use crate::db::{CrmDb, ProviderSyncLogEntry};
use crate::error::SyncError;
use crate::state::SharedDb;
use crate::types::Config;
use crate::util::{format_ts, parse_ts};
use crate::vault::CancelFlag;

pub mod calendar;
pub mod contacts;
pub mod mail;

pub use calendar::{import_event, ExternalEvent, GoogleCalendarSource};
pub use contacts::{conservative_merge, import_contact, ExternalContact, GooglePeopleSource};
pub use mail::{find_or_create_email_contact, import_message, ExternalMessage, GmailSource};

pub const CALENDAR_SERVICE: &str = "google_calendar";
pub const CONTACTS_SERVICE: &str = "google_contacts";
pub const MAIL_SERVICE: &str = "gmail";

// =============================================================================
// Source contract
// =============================================================================

/// What to ask the provider for.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    /// Everything between `since` and `until`, oldest first.
    Window {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
    /// Changes since a previously issued sync token.
    Token(String),
}

/// One page returned by a provider.
#[derive(Debug, Clone)]
pub struct ProviderPage<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
    /// Present on the final page only.
    pub next_sync_token: Option<String>,
    /// Total item count when the provider reports one.
    pub total: Option<u64>,
}

impl<T> ProviderPage<T> {
    pub fn last(items: Vec<T>, next_sync_token: Option<String>) -> Self {
        Self {
            items,
            next_page_token: None,
            next_sync_token,
            total: None,
        }
    }
}

/// A record with a provider-stable identifier.
pub trait ExternalItem {
    fn external_id(&self) -> &str;
}

#[async_trait]
pub trait ProviderSource: Send + Sync {
    type Item: ExternalItem + Send + Sync;

    /// `service_name` of the `provider_sync_state` row.
    fn service(&self) -> &'static str;

    /// Fetch one page. A stale sync token must surface as
    /// [`SyncError::ProviderTokenExpired`].
    async fn fetch_page(
        &self,
        request: &FetchRequest,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ProviderPage<Self::Item>, SyncError>;
}

// =============================================================================
// Pull cycle
// =============================================================================

/// What processing one record did to the local store.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// A new row was created; it is recorded in the dedup log.
    Created(ImportedEntity),
    /// An existing row was merged into. Not logged, so later edits upstream
    /// are picked up again.
    Updated,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedEntity {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Ignore any saved token and fetch the full window.
    pub initial: bool,
    pub window_months: u32,
    pub page_size: u32,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            initial: false,
            window_months: 6,
            page_size: 250,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub service: String,
    pub pages: u32,
    pub fetched: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub duplicates: u64,
    /// The saved token was rejected and a window fetch was used instead.
    pub fell_back: bool,
    pub sync_token: Option<String>,
}

/// Start of the default window: `months` calendar months before `now`.
pub fn window_start(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months))
        .unwrap_or_else(|| now - Duration::days(30 * i64::from(months)))
}

/// 1-based page number from the provider's total and the items not yet
/// fetched before this page. Without a total, `counter` is used as is.
pub fn page_number(total: Option<u64>, remaining: u64, page_size: u32, counter: u32) -> u64 {
    match total {
        Some(total) if total > 0 && page_size > 0 => {
            total.saturating_sub(remaining) / u64::from(page_size) + 1
        }
        _ => u64::from(counter),
    }
}

/// Run one pull cycle for `source`, feeding each new record to `process`.
///
/// `process` runs inside the transaction that writes the dedup log entry, so
/// a record and its log row commit together. Any error leaves the provider
/// state as `error` with the message; the sync token is only saved after the
/// last page was processed.
pub async fn run_pull_cycle<S, F>(
    db: &SharedDb,
    source: &S,
    options: &PullOptions,
    cancel: &CancelFlag,
    mut process: F,
) -> Result<PullReport, SyncError>
where
    S: ProviderSource + ?Sized,
    F: FnMut(&CrmDb, &S::Item) -> Result<ItemOutcome, SyncError>,
{
    let service = source.service();
    db.lock().mark_provider_syncing(service)?;

    match pull_pages(db, source, options, cancel, &mut process).await {
        Ok(report) => {
            log::info!(
                "{}: pull finished ({} fetched, {} created, {} updated, {} duplicates)",
                service,
                report.fetched,
                report.created,
                report.updated,
                report.duplicates
            );
            Ok(report)
        }
        Err(e) => {
            log::warn!("{}: pull failed: {}", service, e);
            if let Err(mark_err) = db.lock().mark_provider_error(service, &e.to_string()) {
                log::warn!("{}: could not record error state: {}", service, mark_err);
            }
            Err(e)
        }
    }
}

async fn pull_pages<S, F>(
    db: &SharedDb,
    source: &S,
    options: &PullOptions,
    cancel: &CancelFlag,
    process: &mut F,
) -> Result<PullReport, SyncError>
where
    S: ProviderSource + ?Sized,
    F: FnMut(&CrmDb, &S::Item) -> Result<ItemOutcome, SyncError>,
{
    let service = source.service();
    let state = db.lock().get_provider_sync_state(service)?;
    let started = Utc::now();
    let default_since = window_start(started, options.window_months);

    let saved_token = state
        .as_ref()
        .and_then(|s| s.last_sync_token.clone())
        .filter(|t| !t.trim().is_empty());
    let mut request = match saved_token {
        Some(token) if !options.initial => FetchRequest::Token(token),
        _ => FetchRequest::Window {
            since: default_since,
            until: started,
        },
    };

    let mut report = PullReport {
        service: service.to_string(),
        ..Default::default()
    };
    let mut page_token: Option<String> = None;
    let mut fetched_before_page: u64 = 0;

    let next_sync_token = loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let page = match source
            .fetch_page(&request, page_token.as_deref(), options.page_size)
            .await
        {
            Ok(page) => page,
            Err(SyncError::ProviderTokenExpired)
                if !report.fell_back && matches!(request, FetchRequest::Token(_)) =>
            {
                let since = state
                    .as_ref()
                    .and_then(|s| s.last_sync_time.as_deref())
                    .and_then(parse_ts)
                    .unwrap_or(default_since);
                log::warn!(
                    "{}: sync token expired, refetching window from {}",
                    service,
                    format_ts(since)
                );
                report.fell_back = true;
                report.pages = 0;
                fetched_before_page = 0;
                page_token = None;
                request = FetchRequest::Window {
                    since,
                    until: Utc::now(),
                };
                continue;
            }
            Err(e) => return Err(e),
        };

        report.pages += 1;
        let count = page.items.len() as u64;
        let remaining = page.total.map(|t| t.saturating_sub(fetched_before_page)).unwrap_or(0);
        log::info!(
            "{}: page {} ({} items{})",
            service,
            page_number(page.total, remaining, options.page_size, report.pages),
            count,
            page.total.map(|t| format!(" of {t}")).unwrap_or_default()
        );

        for item in &page.items {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            ingest(db, service, item, process, &mut report)?;
        }
        fetched_before_page += count;
        report.fetched += count;

        match page.next_page_token {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => break page.next_sync_token,
        }
    };

    let next_sync_token = next_sync_token.filter(|t| !t.is_empty());
    {
        let db = db.lock();
        db.with_transaction(|tx| {
            if let Some(token) = &next_sync_token {
                tx.save_provider_sync_token(service, token, &format_ts(started))?;
            }
            tx.mark_provider_idle(service)?;
            Ok::<_, SyncError>(())
        })?;
    }
    report.sync_token = next_sync_token;
    Ok(report)
}

fn ingest<T, F>(
    db: &SharedDb,
    service: &str,
    item: &T,
    process: &mut F,
    report: &mut PullReport,
) -> Result<(), SyncError>
where
    T: ExternalItem,
    F: FnMut(&CrmDb, &T) -> Result<ItemOutcome, SyncError>,
{
    let external_id = item.external_id();
    if external_id.trim().is_empty() {
        report.skipped += 1;
        return Ok(());
    }

    let outcome = {
        let db = db.lock();
        db.with_transaction(|tx| {
            if tx.provider_log_exists(service, external_id)? {
                return Ok::<_, SyncError>(None);
            }
            let outcome = process(tx, item)?;
            if let ItemOutcome::Created(entity) = &outcome {
                tx.insert_provider_log(&ProviderSyncLogEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    source_service: service.to_string(),
                    source_external_id: external_id.to_string(),
                    entity_type: entity.entity_type.to_string(),
                    entity_id: entity.entity_id.clone(),
                    metadata_json: entity.metadata.as_ref().map(|m| m.to_string()),
                })?;
            }
            Ok(Some(outcome))
        })?
    };

    match outcome {
        None => report.duplicates += 1,
        Some(ItemOutcome::Created(_)) => report.created += 1,
        Some(ItemOutcome::Updated) => report.updated += 1,
        Some(ItemOutcome::Skipped) => report.skipped += 1,
    }
    Ok(())
}

// =============================================================================
// Google runner
// =============================================================================

/// Settings shared by the per-record processors.
#[derive(Debug, Clone, Default)]
pub struct ImportSettings {
    /// Addresses belonging to the account owner; never turned into contacts.
    pub owner_emails: Vec<String>,
    pub extra_consumer_domains: Vec<String>,
}

impl ImportSettings {
    pub fn is_owner(&self, email: &str) -> bool {
        let email = crate::util::normalize_email(email);
        self.owner_emails
            .iter()
            .any(|owner| crate::util::normalize_email(owner) == email)
    }
}

/// Run a pull cycle for every enabled Google provider, one after another.
///
/// A provider failure is recorded in its state row and reported; the others
/// still run.
pub async fn run_google_imports(
    db: &SharedDb,
    config: &Config,
    initial: bool,
    cancel: &CancelFlag,
) -> Result<Vec<(&'static str, Result<PullReport, SyncError>)>, SyncError> {
    if !config.google.enabled {
        return Err(SyncError::Config("Google import is not enabled".to_string()));
    }
    let token_path = crate::state::google_token_path(config);
    let access_token = crate::google_api::get_valid_access_token(&token_path)
        .await
        .map_err(|e| match e {
            crate::google_api::GoogleApiError::TokenNotFound(_)
            | crate::google_api::GoogleApiError::AuthExpired => {
                SyncError::Auth(format!("Google account needs to be reconnected: {e}"))
            }
            other => SyncError::from(other),
        })?;

    let settings = ImportSettings {
        owner_emails: crate::google_api::token_store::peek_account_email(&token_path)
            .filter(|email| email.contains('@'))
            .into_iter()
            .collect(),
        extra_consumer_domains: config.providers.extra_consumer_domains.clone(),
    };
    let options = PullOptions {
        initial,
        window_months: config.providers.window_months,
        page_size: config.providers.page_size,
    };

    let mut results = Vec::new();
    if config.providers.contacts {
        let source = GooglePeopleSource::new(&access_token);
        results.push((
            CONTACTS_SERVICE,
            contacts::pull_contacts(db, &source, &options, cancel).await,
        ));
    }
    if config.providers.calendar {
        let source = GoogleCalendarSource::new(&access_token);
        results.push((
            CALENDAR_SERVICE,
            calendar::pull_calendar(db, &source, &options, &settings, cancel).await,
        ));
    }
    if config.providers.mail {
        let source = GmailSource::new(&access_token);
        results.push((
            MAIL_SERVICE,
            mail::pull_mail(db, &source, &options, &settings, cancel).await,
        ));
    }
    Ok(results)
}
