//! File-backed OAuth token storage.
//!
//! The token file and its directory are created owner-only on unix.

use std::path::Path;

use super::{GoogleApiError, GoogleToken};

/// Load the Google OAuth token stored at `path`.
pub fn load_token(path: &Path) -> Result<GoogleToken, GoogleApiError> {
    if !path.exists() {
        return Err(GoogleApiError::TokenNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let token: GoogleToken = serde_json::from_str(&content)?;
    Ok(token)
}

/// Persist a Google OAuth token to `path`.
pub fn save_token(path: &Path, token: &GoogleToken) -> Result<(), GoogleApiError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let content = serde_json::to_string_pretty(token)?;
    crate::util::atomic_write_str(path, &content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Remove the stored token. Missing files are fine.
pub fn delete_token(path: &Path) -> Result<(), GoogleApiError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// The connected account's email, if a token is stored.
pub fn peek_account_email(path: &Path) -> Option<String> {
    load_token(path).ok().map(|token| {
        token
            .account
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "connected".to_string())
    })
}
