//! Gmail API v1: message metadata for correspondent import.
//!
//! - Window mode lists `after:<epoch> before:<epoch>` messages; the last page
//!   reports the mailbox's current `historyId` as the next sync token.
//! - Token mode walks `users.history.list` from the saved `historyId`.
//!   Gmail answers 404 for a history id it no longer keeps, which is mapped
//!   to [`GoogleApiError::SyncTokenExpired`].
//!
//! Only From/To/Cc headers and the internal date are fetched.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{check_status, send_with_retry, GoogleApiError, RetryPolicy};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageStub,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    #[serde(default)]
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

// ============================================================================
// Public types
// ============================================================================

/// A parsed `Name <email>` pair. `name` may be empty.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Mailbox {
    pub name: String,
    pub email: String,
}

/// Correspondents and date of one message.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MailMessage {
    pub id: String,
    pub from: Vec<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl MailMessage {
    /// Every address on the message, sender first, without duplicates.
    pub fn participants(&self) -> Vec<&Mailbox> {
        let mut seen = std::collections::HashSet::new();
        self.from
            .iter()
            .chain(&self.to)
            .chain(&self.cc)
            .filter(|m| seen.insert(m.email.to_lowercase()))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessagesQuery {
    /// Saved `historyId`; when set the window is ignored.
    pub history_id: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MessagesPage {
    pub messages: Vec<MailMessage>,
    pub next_page_token: Option<String>,
    pub next_history_id: Option<String>,
    pub total_estimate: Option<u64>,
}

// ============================================================================
// Gmail API
// ============================================================================

pub struct GmailApi {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GmailApi {
    pub fn new(access_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: access_token.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GoogleApiError> {
        let resp = send_with_retry(
            self.client
                .get(format!("{}/{}", self.base_url, path))
                .bearer_auth(&self.access_token)
                .query(params),
            &RetryPolicy::default(),
        )
        .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    /// One page of messages with their correspondent headers.
    pub async fn list_messages(&self, query: &MessagesQuery) -> Result<MessagesPage, GoogleApiError> {
        let (ids, next_page_token, next_history_id, total_estimate) = match &query.history_id {
            Some(history_id) => self.history_page(history_id, query).await?,
            None => self.window_page(query).await?,
        };

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_message(&id).await {
                Ok(message) => messages.push(message),
                // Deleted between listing and fetch.
                Err(GoogleApiError::ApiError { status: 404, .. }) => {
                    log::debug!("Skipping vanished message {}", id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(MessagesPage {
            messages,
            next_page_token,
            next_history_id,
            total_estimate,
        })
    }

    async fn window_page(
        &self,
        query: &MessagesQuery,
    ) -> Result<(Vec<String>, Option<String>, Option<String>, Option<u64>), GoogleApiError> {
        let mut terms = Vec::new();
        if let Some(after) = query.after {
            terms.push(format!("after:{}", after.timestamp()));
        }
        if let Some(before) = query.before {
            terms.push(format!("before:{}", before.timestamp()));
        }
        let mut params = vec![
            ("q", terms.join(" ")),
            ("maxResults", query.page_size.to_string()),
        ];
        if let Some(page) = &query.page_token {
            params.push(("pageToken", page.clone()));
        }

        let list: MessageListResponse = self.get_json("messages", &params).await?;
        let next_history_id = if list.next_page_token.is_none() {
            let profile: ProfileResponse = self.get_json("profile", &[]).await?;
            Some(profile.history_id).filter(|h| !h.is_empty())
        } else {
            None
        };
        Ok((
            list.messages.into_iter().map(|m| m.id).collect(),
            list.next_page_token,
            next_history_id,
            list.result_size_estimate,
        ))
    }

    async fn history_page(
        &self,
        history_id: &str,
        query: &MessagesQuery,
    ) -> Result<(Vec<String>, Option<String>, Option<String>, Option<u64>), GoogleApiError> {
        let mut params = vec![
            ("startHistoryId", history_id.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("maxResults", query.page_size.to_string()),
        ];
        if let Some(page) = &query.page_token {
            params.push(("pageToken", page.clone()));
        }

        let list: HistoryListResponse = match self.get_json("history", &params).await {
            Err(GoogleApiError::ApiError { status: 404, .. }) => {
                return Err(GoogleApiError::SyncTokenExpired)
            }
            other => other?,
        };
        let ids = list
            .history
            .into_iter()
            .flat_map(|h| h.messages_added)
            .map(|added| added.message.id)
            .collect();
        let next_history_id = if list.next_page_token.is_none() {
            list.history_id
        } else {
            None
        };
        Ok((ids, list.next_page_token, next_history_id, None))
    }

    async fn fetch_message(&self, id: &str) -> Result<MailMessage, GoogleApiError> {
        let params = [
            ("format", "metadata".to_string()),
            ("metadataHeaders", "From".to_string()),
            ("metadataHeaders", "To".to_string()),
            ("metadataHeaders", "Cc".to_string()),
        ];
        let detail: MessageDetail = self.get_json(&format!("messages/{id}"), &params).await?;
        Ok(parse_message(detail))
    }
}

fn parse_message(detail: MessageDetail) -> MailMessage {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);
    let addresses = |name: &str| -> Vec<Mailbox> {
        headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .flat_map(|h| parse_email_addresses(&h.value))
            .collect()
    };

    let sent_at = detail
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    MailMessage {
        from: addresses("From"),
        to: addresses("To"),
        cc: addresses("Cc"),
        id: detail.id,
        sent_at,
    }
}

/// Parse a header value like `"Alice" <alice@co.com>, bob@co.com`.
pub fn parse_email_addresses(header: &str) -> Vec<Mailbox> {
    let mut results = Vec::new();
    for part in header.split(',') {
        let trimmed = part.trim();
        if let (Some(lt), Some(gt)) = (trimmed.find('<'), trimmed.rfind('>')) {
            if lt < gt {
                let email = trimmed[lt + 1..gt].trim().to_string();
                let name = trimmed[..lt].trim().trim_matches('"').trim().to_string();
                if email.contains('@') {
                    results.push(Mailbox { name, email });
                }
            }
        } else if trimmed.contains('@') {
            results.push(Mailbox {
                name: String::new(),
                email: trimmed.to_string(),
            });
        }
    }
    results
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_addresses() {
        let parsed = parse_email_addresses(r#""Jane Doe" <jane@customer.com>, bob@x.io, junk"#);
        assert_eq!(
            parsed,
            vec![
                Mailbox {
                    name: "Jane Doe".into(),
                    email: "jane@customer.com".into()
                },
                Mailbox {
                    name: String::new(),
                    email: "bob@x.io".into()
                },
            ]
        );
    }

    #[test]
    fn test_message_detail_parsing() {
        let json = r#"{
            "id": "msg123",
            "internalDate": "1735689600000",
            "payload": {
                "headers": [
                    {"name": "From", "value": "Jane Doe <jane@customer.com>"},
                    {"name": "To", "value": "me@mine.com, Bob <bob@customer.com>"},
                    {"name": "Cc", "value": "jane@customer.com"}
                ]
            }
        }"#;
        let detail: MessageDetail = serde_json::from_str(json).unwrap();
        let message = parse_message(detail);

        assert_eq!(message.id, "msg123");
        assert_eq!(
            message.sent_at.map(crate::util::format_ts).as_deref(),
            Some("2025-01-01T00:00:00Z")
        );
        let emails: Vec<&str> = message
            .participants()
            .into_iter()
            .map(|m| m.email.as_str())
            .collect();
        assert_eq!(emails, vec!["jane@customer.com", "me@mine.com", "bob@customer.com"]);
    }

    #[test]
    fn test_history_response_parsing() {
        let json = r#"{
            "history": [
                {"messagesAdded": [{"message": {"id": "m1", "threadId": "t"}}]},
                {"id": "2"}
            ],
            "historyId": "9000"
        }"#;
        let resp: HistoryListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.history.len(), 2);
        assert_eq!(resp.history[0].messages_added[0].message.id, "m1");
        assert_eq!(resp.history_id.as_deref(), Some("9000"));
    }

    #[test]
    fn test_message_list_empty() {
        let json = r#"{"resultSizeEstimate": 0}"#;
        let resp: MessageListResponse = serde_json::from_str(json).unwrap();
        assert!(resp.messages.is_empty());
        assert!(resp.next_page_token.is_none());
    }
}
