//! Google Calendar API v3: incremental event listing.
//!
//! Two request shapes:
//! - window: `timeMin`/`timeMax`, `singleEvents=true`, `orderBy=startTime`
//! - sync token: `syncToken` only (Google rejects it combined with the above)
//!
//! The last page of either carries `nextSyncToken`. A stale token answers
//! 410 Gone, surfaced as [`GoogleApiError::SyncTokenExpired`].

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{check_status, send_with_retry, GoogleApiError, RetryPolicy};
use crate::util::format_ts;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

// ============================================================================
// API response types (deserialized from Google Calendar JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListResponse {
    #[serde(default)]
    items: Vec<GoogleEventRaw>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    summary: Option<String>,
    start: Option<EventDateTime>,
    end: Option<EventDateTime>,
    #[serde(default)]
    attendees: Vec<AttendeeRaw>,
    organizer: Option<Organizer>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventDateTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendeeRaw {
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    response_status: Option<String>,
    #[serde(default)]
    resource: Option<bool>,
    #[serde(rename = "self", default)]
    is_self: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Organizer {
    #[serde(default)]
    email: String,
}

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CalendarAttendee {
    pub email: String,
    pub display_name: String,
    pub is_self: bool,
    pub response_status: String,
}

/// A normalized calendar event. Resource rooms are dropped from `attendees`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: String,
    pub start: String,
    pub end: String,
    pub organizer: String,
    pub attendees: Vec<CalendarAttendee>,
    pub is_all_day: bool,
    pub cancelled: bool,
}

/// Parameters for one events page.
#[derive(Debug, Clone, Default)]
pub struct EventsQuery {
    pub sync_token: Option<String>,
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct EventsPage {
    pub events: Vec<CalendarEvent>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
}

// ============================================================================
// Calendar API
// ============================================================================

pub struct CalendarApi {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl CalendarApi {
    pub fn new(access_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: access_token.to_string(),
        }
    }

    /// Point at another server (local fakes).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch one page of primary-calendar events.
    pub async fn list_events(&self, query: &EventsQuery) -> Result<EventsPage, GoogleApiError> {
        let params = build_query(query);
        let resp = send_with_retry(
            self.client
                .get(format!("{}/calendars/primary/events", self.base_url))
                .bearer_auth(&self.access_token)
                .query(&params),
            &RetryPolicy::default(),
        )
        .await?;
        let body: EventListResponse = check_status(resp).await?.json().await?;

        Ok(EventsPage {
            events: body.items.into_iter().map(normalize_event).collect(),
            next_page_token: body.next_page_token,
            next_sync_token: body.next_sync_token,
        })
    }
}

fn build_query(query: &EventsQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("maxResults", query.page_size.to_string())];
    match &query.sync_token {
        Some(token) => params.push(("syncToken", token.clone())),
        None => {
            params.push(("singleEvents", "true".to_string()));
            params.push(("orderBy", "startTime".to_string()));
            if let Some(min) = query.time_min {
                params.push(("timeMin", format_ts(min)));
            }
            if let Some(max) = query.time_max {
                params.push(("timeMax", format_ts(max)));
            }
        }
    }
    if let Some(page) = &query.page_token {
        params.push(("pageToken", page.clone()));
    }
    params
}

fn normalize_event(item: GoogleEventRaw) -> CalendarEvent {
    let when = |dt: &Option<EventDateTime>| {
        dt.as_ref()
            .and_then(|s| s.date_time.as_deref().or(s.date.as_deref()))
            .unwrap_or("")
            .to_string()
    };
    let is_all_day = item
        .start
        .as_ref()
        .map(|s| s.date_time.is_none() && s.date.is_some())
        .unwrap_or(false);

    let attendees = item
        .attendees
        .into_iter()
        .filter(|a| a.resource != Some(true) && !a.email.is_empty())
        .map(|a| CalendarAttendee {
            email: a.email,
            display_name: a.display_name.unwrap_or_default(),
            is_self: a.is_self == Some(true),
            response_status: a.response_status.unwrap_or_default(),
        })
        .collect();

    CalendarEvent {
        start: when(&item.start),
        end: when(&item.end),
        id: item.id,
        summary: item.summary.unwrap_or_else(|| "(No title)".to_string()),
        organizer: item.organizer.map(|o| o.email).unwrap_or_default(),
        attendees,
        is_all_day,
        cancelled: item.status.as_deref() == Some("cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_event_normalization() {
        let json = r#"{
            "items": [
                {
                    "id": "event123",
                    "summary": "Quarterly review",
                    "start": {"dateTime": "2026-02-08T09:00:00-05:00"},
                    "end": {"dateTime": "2026-02-08T09:30:00-05:00"},
                    "attendees": [
                        {"email": "me@mine.com", "self": true, "responseStatus": "accepted"},
                        {"email": "bob@customer.com", "displayName": "Bob Lee"},
                        {"email": "room@resource.calendar.google.com", "resource": true}
                    ],
                    "organizer": {"email": "me@mine.com"}
                },
                {"id": "gone", "status": "cancelled"}
            ],
            "nextSyncToken": "sync-1"
        }"#;

        let resp: EventListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.next_sync_token.as_deref(), Some("sync-1"));
        let events: Vec<CalendarEvent> = resp.items.into_iter().map(normalize_event).collect();

        assert_eq!(events[0].attendees.len(), 2);
        assert!(events[0].attendees[0].is_self);
        assert_eq!(events[0].attendees[1].display_name, "Bob Lee");
        assert_eq!(events[0].start, "2026-02-08T09:00:00-05:00");
        assert!(!events[0].cancelled);
        assert!(events[1].cancelled);
        assert_eq!(events[1].summary, "(No title)");
    }

    #[test]
    fn test_all_day_event_detection() {
        let json = r#"{
            "id": "allday1",
            "summary": "Offsite",
            "start": {"date": "2026-02-08"},
            "end": {"date": "2026-02-09"}
        }"#;
        let raw: GoogleEventRaw = serde_json::from_str(json).unwrap();
        let event = normalize_event(raw);
        assert!(event.is_all_day);
        assert_eq!(event.start, "2026-02-08");
    }

    #[test]
    fn test_window_query_shape() {
        let query = EventsQuery {
            time_min: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            time_max: Some(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()),
            page_size: 250,
            ..Default::default()
        };
        let params = build_query(&query);
        assert!(params.contains(&("timeMin", "2025-01-01T00:00:00Z".to_string())));
        assert!(params.contains(&("singleEvents", "true".to_string())));
        assert!(params.contains(&("orderBy", "startTime".to_string())));
        assert!(params.contains(&("maxResults", "250".to_string())));
    }

    #[test]
    fn test_token_query_omits_window() {
        let query = EventsQuery {
            sync_token: Some("tok".into()),
            time_min: Some(Utc::now()),
            page_token: Some("p2".into()),
            page_size: 250,
            ..Default::default()
        };
        let params = build_query(&query);
        assert!(params.contains(&("syncToken", "tok".to_string())));
        assert!(params.contains(&("pageToken", "p2".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "timeMin" || *k == "orderBy"));
    }
}
