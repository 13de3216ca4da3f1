//! Google People API v1: the user's contacts (`people/me/connections`).
//!
//! Every request asks for a sync token; passing it back returns only the
//! connections changed since. An expired token comes back as 410 Gone or as
//! 400 with `EXPIRED_SYNC_TOKEN`, both mapped to
//! [`GoogleApiError::SyncTokenExpired`].

use serde::Deserialize;

use super::{check_status, send_with_retry, GoogleApiError, RetryPolicy};

const DEFAULT_BASE_URL: &str = "https://people.googleapis.com/v1";
const PERSON_FIELDS: &str = "names,emailAddresses,phoneNumbers,organizations,biographies,metadata";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsResponse {
    #[serde(default)]
    connections: Vec<PersonRaw>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
    #[serde(default)]
    total_items: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonRaw {
    #[serde(default)]
    resource_name: String,
    #[serde(default)]
    names: Vec<NameRaw>,
    #[serde(default)]
    email_addresses: Vec<ValueRaw>,
    #[serde(default)]
    phone_numbers: Vec<ValueRaw>,
    #[serde(default)]
    organizations: Vec<OrganizationRaw>,
    #[serde(default)]
    biographies: Vec<ValueRaw>,
    #[serde(default)]
    metadata: Option<PersonMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NameRaw {
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ValueRaw {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct OrganizationRaw {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PersonMetadata {
    #[serde(default)]
    deleted: bool,
}

/// One contact, flattened to the first value of each field.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct PersonRecord {
    /// `people/c123...`, stable per contact.
    pub resource_name: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub organization: String,
    pub biography: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionsQuery {
    pub sync_token: Option<String>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionsPage {
    pub people: Vec<PersonRecord>,
    pub next_page_token: Option<String>,
    pub next_sync_token: Option<String>,
    pub total_items: Option<u64>,
}

pub struct PeopleApi {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl PeopleApi {
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

    pub async fn list_connections(
        &self,
        query: &ConnectionsQuery,
    ) -> Result<ConnectionsPage, GoogleApiError> {
        let mut params = vec![
            ("personFields", PERSON_FIELDS.to_string()),
            ("pageSize", query.page_size.to_string()),
            ("requestSyncToken", "true".to_string()),
        ];
        if let Some(token) = &query.sync_token {
            params.push(("syncToken", token.clone()));
        }
        if let Some(page) = &query.page_token {
            params.push(("pageToken", page.clone()));
        }

        let resp = send_with_retry(
            self.client
                .get(format!("{}/people/me/connections", self.base_url))
                .bearer_auth(&self.access_token)
                .query(&params),
            &RetryPolicy::default(),
        )
        .await?;

        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("EXPIRED_SYNC_TOKEN") {
                return Err(GoogleApiError::SyncTokenExpired);
            }
            return Err(GoogleApiError::ApiError {
                status: 400,
                message: body,
            });
        }
        let body: ConnectionsResponse = check_status(resp).await?.json().await?;

        Ok(ConnectionsPage {
            people: body.connections.into_iter().map(flatten_person).collect(),
            next_page_token: body.next_page_token,
            next_sync_token: body.next_sync_token,
            total_items: body.total_items,
        })
    }
}

fn first<T>(values: Vec<T>, f: impl Fn(T) -> String) -> String {
    values
        .into_iter()
        .map(f)
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

fn flatten_person(raw: PersonRaw) -> PersonRecord {
    PersonRecord {
        resource_name: raw.resource_name,
        name: first(raw.names, |n| n.display_name),
        email: first(raw.email_addresses, |v| v.value),
        phone: first(raw.phone_numbers, |v| v.value),
        organization: first(raw.organizations, |o| o.name),
        biography: first(raw.biographies, |v| v.value),
        deleted: raw.metadata.map(|m| m.deleted).unwrap_or(false),
    }
}
