//! Config file handling and the shared state handed to sync components.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::CrmDb;
use crate::types::Config;

/// Shared handle to the local store.
///
/// The guard is synchronous; callers take it for one short unit of work and
/// never hold it across an `.await`.
pub type SharedDb = Arc<Mutex<CrmDb>>;

/// Get the state directory (~/.pcrm)
pub fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".pcrm"))
}

/// Get the canonical config file path (~/.pcrm/config.json)
pub fn config_path() -> Result<PathBuf, String> {
    Ok(state_dir()?.join("config.json"))
}

/// Load configuration from ~/.pcrm/config.json. A missing file yields defaults.
pub fn load_config() -> Result<Config, String> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        log::debug!("No config at {}; using defaults", path.display());
        return Ok(Config::default());
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;

    if config.vault.enabled && config.vault.server_url.trim().is_empty() {
        return Err("Vault sync is enabled but vault.serverUrl is empty".to_string());
    }
    if config.vault.batch_size == 0 {
        return Err("vault.batchSize must be at least 1".to_string());
    }

    Ok(config)
}

/// Write the config to ~/.pcrm/config.json, creating the directory if needed.
pub fn save_config(config: &Config) -> Result<(), String> {
    save_config_to(&config_path()?, config)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    crate::util::atomic_write_str(path, &content).map_err(|e| format!("Failed to write config: {}", e))
}

/// Open the database named by the config (or the default path).
pub fn open_db(config: &Config) -> Result<SharedDb, String> {
    let db = match &config.db_path {
        Some(p) if !p.trim().is_empty() => CrmDb::open_at(PathBuf::from(p)),
        _ => CrmDb::open(),
    }
    .map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(Arc::new(Mutex::new(db)))
}

/// Default Google token location (~/.pcrm/google/token.json) unless overridden.
pub fn google_token_path(config: &Config) -> PathBuf {
    if let Some(p) = &config.google.token_path {
        return PathBuf::from(p);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pcrm")
        .join("google")
        .join("token.json")
}
