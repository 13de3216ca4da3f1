use serde::{Deserialize, Serialize};

/// Configuration stored in ~/.pcrm/config.json
///
/// Every field has a serde default, so an empty `{}` file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Overrides the default database location (`~/.pcrm/pcrm.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Run a vault sync cycle after every local write.
    #[serde(default)]
    pub auto_sync_on_write: bool,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub google: GoogleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Refresh the bearer token when it expires within this many seconds.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    100
}
fn default_refresh_window() -> i64 {
    300
}
fn default_request_timeout() -> u64 {
    30
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            batch_size: default_batch_size(),
            refresh_window_secs: default_refresh_window(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default = "default_true")]
    pub calendar: bool,
    #[serde(default = "default_true")]
    pub contacts: bool,
    #[serde(default = "default_true")]
    pub mail: bool,
    /// Width of the initial (and fallback) time window, in months.
    #[serde(default = "default_window_months")]
    pub window_months: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Domains treated as personal mail on top of the built-in list.
    #[serde(default)]
    pub extra_consumer_domains: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_window_months() -> u32 {
    6
}
fn default_page_size() -> u32 {
    250
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            calendar: true,
            contacts: true,
            mail: true,
            window_months: default_window_months(),
            page_size: default_page_size(),
            extra_consumer_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Overrides `~/.pcrm/google/token.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,
}
