//! Normalization helpers shared by the matcher, the reconciler, and the importers.
//!
//! Stored timestamps always use the canonical form produced by [`format_ts`]
//! (`YYYY-MM-DDTHH:MM:SSZ`), so SQL comparisons on the text columns order the
//! same way the instants do.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use unicode_normalization::UnicodeNormalization;

/// Consumer mailbox domains. Addresses on these never imply an organization.
pub const CONSUMER_EMAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "ymail.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "msn.com",
    "icloud.com",
    "me.com",
    "mac.com",
    "protonmail.com",
    "proton.me",
    "aol.com",
    "gmx.com",
    "mail.com",
    "yandex.com",
    "zoho.com",
    "fastmail.com",
];

/// Two-label public suffixes stripped as a unit when deriving a company name.
const COMPOUND_SUFFIXES: &[&str] = &["co", "com", "org", "net", "ac", "gov", "edu"];

/// Lowercase and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Trim, collapse internal whitespace, and casefold a display name.
pub fn normalize_name(name: &str) -> String {
    collapse_whitespace(&name.nfkc().collect::<String>()).to_lowercase()
}

/// Trim and collapse runs of whitespace to a single space.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Domain part of an email address, lowercased. Empty when there is none.
pub fn email_domain(email: &str) -> String {
    match email.trim().rsplit_once('@') {
        Some((_, domain)) => domain.trim().to_lowercase(),
        None => String::new(),
    }
}

/// Local part of an email address (everything before the last `@`).
pub fn email_local_part(email: &str) -> &str {
    let trimmed = email.trim();
    match trimmed.rsplit_once('@') {
        Some((local, _)) => local,
        None => trimmed,
    }
}

/// Whether `domain` is a consumer mailbox provider (case-insensitive).
pub fn is_consumer_domain(domain: &str, extra: &[String]) -> bool {
    let domain = domain.trim().to_lowercase();
    if domain.is_empty() {
        return false;
    }
    CONSUMER_EMAIL_DOMAINS.contains(&domain.as_str())
        || extra.iter().any(|d| d.trim().eq_ignore_ascii_case(&domain))
}

/// Derive a company display name from an internet domain.
///
/// Strips the TLD (and a compound suffix such as `co.uk`), splits the rest on
/// `.` and `-`, and title-cases each token.
///
/// Example: "acme-widgets.co.uk" → "Acme Widgets"
pub fn company_name_from_domain(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    let domain = domain.strip_prefix("www.").unwrap_or(&domain);
    let mut labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() > 1 {
        labels.pop();
    }
    if labels.len() > 1 {
        if let Some(last) = labels.last() {
            if COMPOUND_SUFFIXES.contains(last) {
                labels.pop();
            }
        }
    }
    labels
        .iter()
        .flat_map(|label| label.split('-'))
        .filter(|token| !token.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Canonical stored/wire form of a timestamp: RFC 3339, UTC, second precision.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current time in canonical form.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Parse an RFC 3339 timestamp (any offset) or a bare `YYYY-MM-DD` date.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Re-encode a timestamp string in canonical form.
pub fn canonical_ts(value: &str) -> Option<String> {
    parse_ts(value).map(format_ts)
}

/// Write `content` to `path` via a sibling temp file and rename, so readers
/// never observe a half-written file.
pub fn atomic_write_str(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
