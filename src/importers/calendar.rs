//! Calendar import: each held event becomes a `meeting` interaction for every
//! external attendee.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::mail::log_counterpart_interactions;
use super::{
    run_pull_cycle, ExternalItem, FetchRequest, ImportSettings, ItemOutcome, ProviderPage,
    ProviderSource, PullOptions, PullReport, CALENDAR_SERVICE,
};
use crate::db::{CrmDb, InteractionType};
use crate::error::SyncError;
use crate::google_api::calendar::{CalendarApi, CalendarEvent, EventsQuery};
use crate::state::SharedDb;
use crate::util::parse_ts;
use crate::vault::CancelFlag;

#[derive(Debug, Clone, PartialEq)]
pub struct EventAttendee {
    pub name: String,
    pub email: String,
    /// The calendar owner's own attendance.
    pub is_self: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalEvent {
    pub external_id: String,
    pub summary: String,
    pub start: Option<DateTime<Utc>>,
    pub attendees: Vec<EventAttendee>,
    pub cancelled: bool,
}

impl ExternalItem for ExternalEvent {
    fn external_id(&self) -> &str {
        &self.external_id
    }
}

impl From<CalendarEvent> for ExternalEvent {
    fn from(event: CalendarEvent) -> Self {
        Self {
            start: parse_ts(&event.start),
            external_id: event.id,
            summary: event.summary,
            attendees: event
                .attendees
                .into_iter()
                .map(|a| EventAttendee {
                    name: a.display_name,
                    email: a.email,
                    is_self: a.is_self,
                })
                .collect(),
            cancelled: event.cancelled,
        }
    }
}

/// Record a `meeting` interaction per external attendee of `event`.
///
/// Cancelled, undated and upcoming events are skipped, as are the owner's
/// own entries. An upcoming event leaves no dedup row, so it is imported once
/// a later pull sees it after it started.
pub fn import_event(
    db: &CrmDb,
    event: &ExternalEvent,
    settings: &ImportSettings,
) -> Result<ItemOutcome, SyncError> {
    if event.cancelled {
        return Ok(ItemOutcome::Skipped);
    }
    let Some(start) = event.start else {
        log::debug!("Skipping event {} with no start time", event.external_id);
        return Ok(ItemOutcome::Skipped);
    };
    if start > Utc::now() {
        log::debug!("Skipping upcoming event {}", event.external_id);
        return Ok(ItemOutcome::Skipped);
    }

    let attendees: Vec<(String, String)> = event
        .attendees
        .iter()
        .filter(|a| !a.is_self)
        .map(|a| (a.name.clone(), a.email.clone()))
        .collect();

    let mut metadata = BTreeMap::new();
    metadata.insert("source".to_string(), serde_json::json!(CALENDAR_SERVICE));
    metadata.insert("eventId".to_string(), serde_json::json!(event.external_id));
    if !event.summary.is_empty() {
        metadata.insert("title".to_string(), serde_json::json!(event.summary));
    }

    log_counterpart_interactions(
        db,
        &attendees,
        InteractionType::Meeting,
        start,
        metadata,
        settings,
    )
}

pub async fn pull_calendar<S>(
    db: &SharedDb,
    source: &S,
    options: &PullOptions,
    settings: &ImportSettings,
    cancel: &CancelFlag,
) -> Result<PullReport, SyncError>
where
    S: ProviderSource<Item = ExternalEvent> + ?Sized,
{
    run_pull_cycle(db, source, options, cancel, |tx: &CrmDb, event: &ExternalEvent| {
        import_event(tx, event, settings)
    })
    .await
}

/// The primary Google calendar as a [`ProviderSource`].
pub struct GoogleCalendarSource {
    api: CalendarApi,
}

impl GoogleCalendarSource {
    pub fn new(access_token: &str) -> Self {
        Self {
            api: CalendarApi::new(access_token),
        }
    }
}

#[async_trait]
impl ProviderSource for GoogleCalendarSource {
    type Item = ExternalEvent;

    fn service(&self) -> &'static str {
        CALENDAR_SERVICE
    }

    async fn fetch_page(
        &self,
        request: &FetchRequest,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ProviderPage<ExternalEvent>, SyncError> {
        let mut query = EventsQuery {
            page_token: page_token.map(String::from),
            page_size,
            ..Default::default()
        };
        match request {
            FetchRequest::Token(token) => query.sync_token = Some(token.clone()),
            FetchRequest::Window { since, until } => {
                query.time_min = Some(*since);
                query.time_max = Some(*until);
            }
        }
        let page = self.api.list_events(&query).await?;
        Ok(ProviderPage {
            items: page.events.into_iter().map(ExternalEvent::from).collect(),
            next_page_token: page.next_page_token,
            next_sync_token: page.next_sync_token,
            total: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::tests::{shared, StubSource};
    use super::*;
    use crate::db::test_utils::test_db;

    fn attendee(name: &str, email: &str, is_self: bool) -> EventAttendee {
        EventAttendee {
            name: name.into(),
            email: email.into(),
            is_self,
        }
    }

    fn event(id: &str) -> ExternalEvent {
        ExternalEvent {
            external_id: id.into(),
            summary: "Quarterly review".into(),
            start: Some(Utc.with_ymd_and_hms(2025, 2, 8, 14, 0, 0).unwrap()),
            attendees: vec![
                attendee("Me", "me@mine.com", true),
                attendee("Bob Lee", "bob@customer.com", false),
                attendee("", "pat@gmail.com", false),
            ],
            cancelled: false,
        }
    }

    #[test]
    fn test_event_logs_meeting_per_external_attendee() {
        let db = test_db();
        let outcome = import_event(&db, &event("ev1"), &ImportSettings::default()).unwrap();
        let ItemOutcome::Created(entity) = outcome else {
            panic!("expected interactions");
        };
        let ids = entity.metadata.unwrap()["interactionIds"].as_array().unwrap().len();
        assert_eq!(ids, 2);

        let contacts = db.list_contacts().unwrap();
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().all(|c| c.email != "me@mine.com"));

        let bob = db.find_contact_by_email("bob@customer.com").unwrap().unwrap();
        assert_eq!(bob.name, "Bob Lee");
        assert!(bob.company_id.is_some());
        let pat = db.find_contact_by_email("pat@gmail.com").unwrap().unwrap();
        assert_eq!(pat.name, "pat");
        assert!(pat.company_id.is_none());

        let logs = db.list_interactions_for_contact(&bob.id).unwrap();
        assert_eq!(logs[0].interaction_type, InteractionType::Meeting);
        assert_eq!(logs[0].interacted_at, "2025-02-08T14:00:00Z");
    }

    #[test]
    fn test_cancelled_event_is_skipped() {
        let db = test_db();
        let mut cancelled = event("ev2");
        cancelled.cancelled = true;
        assert_eq!(
            import_event(&db, &cancelled, &ImportSettings::default()).unwrap(),
            ItemOutcome::Skipped
        );
        assert!(db.list_contacts().unwrap().is_empty());
    }

    #[test]
    fn test_upcoming_event_is_skipped() {
        let db = test_db();
        let mut upcoming = event("ev3");
        upcoming.start = Some(Utc::now() + chrono::Duration::days(30));
        assert_eq!(
            import_event(&db, &upcoming, &ImportSettings::default()).unwrap(),
            ItemOutcome::Skipped
        );
        assert!(db.find_contact_by_email("bob@customer.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upcoming_event_imported_once_held() {
        let db = shared(test_db());
        let mut upcoming = event("ev4");
        upcoming.start = Some(Utc::now() + chrono::Duration::days(30));
        let source = StubSource::new(
            CALENDAR_SERVICE,
            vec![Ok(ProviderPage::last(vec![upcoming], Some("cal-1".into())))],
        );
        let report = pull_calendar(
            &db,
            &source,
            &PullOptions::default(),
            &ImportSettings::default(),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!((report.created, report.skipped), (0, 1));
        assert!(db.lock().list_provider_log(CALENDAR_SERVICE).unwrap().is_empty());

        // The same event, now in the past, comes back on the next token pull.
        let source = StubSource::new(
            CALENDAR_SERVICE,
            vec![Ok(ProviderPage::last(vec![event("ev4")], Some("cal-2".into())))],
        );
        let report = pull_calendar(
            &db,
            &source,
            &PullOptions::default(),
            &ImportSettings::default(),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.created, 1);

        let db = db.lock();
        let bob = db.find_contact_by_email("bob@customer.com").unwrap().unwrap();
        assert_eq!(bob.last_contacted_at.as_deref(), Some("2025-02-08T14:00:00Z"));
    }

    #[test]
    fn test_from_calendar_event_parses_start() {
        let raw = CalendarEvent {
            id: "e".into(),
            summary: "Sync".into(),
            start: "2026-02-08T09:00:00-05:00".into(),
            end: String::new(),
            organizer: String::new(),
            attendees: vec![],
            is_all_day: false,
            cancelled: false,
        };
        let event = ExternalEvent::from(raw);
        assert_eq!(event.start, Some(Utc.with_ymd_and_hms(2026, 2, 8, 14, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_pull_calendar_saves_sync_token() {
        let db = shared(test_db());
        let source = StubSource::new(
            CALENDAR_SERVICE,
            vec![Ok(ProviderPage::last(vec![event("ev1")], Some("cal-sync".into())))],
        );
        let report = pull_calendar(
            &db,
            &source,
            &PullOptions::default(),
            &ImportSettings::default(),
            &CancelFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.created, 1);

        let db = db.lock();
        let state = db.get_provider_sync_state(CALENDAR_SERVICE).unwrap().unwrap();
        assert_eq!(state.last_sync_token.as_deref(), Some("cal-sync"));
        let log = db.list_provider_log(CALENDAR_SERVICE).unwrap();
        assert_eq!(log[0].source_external_id, "ev1");
    }
}
