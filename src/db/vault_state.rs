use rusqlite::{params, OptionalExtension};

use super::*;
use crate::util::now_ts;

impl CrmDb {
    // =========================================================================
    // Vault device state (single row)
    // =========================================================================

    /// Register this device with the vault. Re-initializing replaces the
    /// identity and tokens but keeps the pull cursor.
    pub fn init_vault_state(&self, state: &VaultState) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO vault_state (
                id, user_id, device_id, auth_token, auth_expires_at, refresh_token,
                key_seed, last_synced_seq, updated_at
             ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                device_id = excluded.device_id,
                auth_token = excluded.auth_token,
                auth_expires_at = excluded.auth_expires_at,
                refresh_token = excluded.refresh_token,
                key_seed = excluded.key_seed,
                updated_at = excluded.updated_at",
            params![
                state.user_id,
                state.device_id,
                state.auth_token,
                state.auth_expires_at,
                state.refresh_token,
                state.key_seed,
                state.last_synced_seq,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    pub fn get_vault_state(&self) -> Result<Option<VaultState>, DbError> {
        let state = self
            .conn
            .query_row(
                "SELECT user_id, device_id, auth_token, auth_expires_at, refresh_token, key_seed,
                        last_synced_seq, last_push_at, last_pull_at, last_error
                 FROM vault_state WHERE id = 1",
                [],
                |row| {
                    Ok(VaultState {
                        user_id: row.get(0)?,
                        device_id: row.get(1)?,
                        auth_token: row.get(2)?,
                        auth_expires_at: row.get(3)?,
                        refresh_token: row.get(4)?,
                        key_seed: row.get(5)?,
                        last_synced_seq: row.get(6)?,
                        last_push_at: row.get(7)?,
                        last_pull_at: row.get(8)?,
                        last_error: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn update_vault_tokens(
        &self,
        auth_token: &str,
        refresh_token: &str,
        expires_at: Option<&str>,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE vault_state SET auth_token = ?1, refresh_token = ?2, auth_expires_at = ?3,
                updated_at = ?4
             WHERE id = 1",
            params![auth_token, refresh_token, expires_at, now_ts()],
        )?;
        Ok(())
    }

    /// Commit the pull cursor and stamp `last_pull_at`.
    pub fn commit_vault_cursor(&self, seq: i64, pulled_at: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE vault_state SET last_synced_seq = ?1, last_pull_at = ?2, updated_at = ?2
             WHERE id = 1",
            params![seq, pulled_at],
        )?;
        Ok(())
    }

    pub fn record_vault_push(&self, pushed_at: &str) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE vault_state SET last_push_at = ?1, updated_at = ?1 WHERE id = 1",
            params![pushed_at],
        )?;
        Ok(())
    }

    /// Set or clear the last cycle error shown by status queries.
    pub fn record_vault_error(&self, error: Option<&str>) -> Result<(), DbError> {
        self.conn.execute(
            "UPDATE vault_state SET last_error = ?1, updated_at = ?2 WHERE id = 1",
            params![error, now_ts()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn sample_state() -> VaultState {
        VaultState {
            user_id: "user-1".into(),
            device_id: "device-1".into(),
            auth_token: "tok".into(),
            auth_expires_at: Some("2030-01-01T00:00:00Z".into()),
            refresh_token: "refresh".into(),
            key_seed: "00".repeat(32),
            last_synced_seq: 0,
            last_push_at: None,
            last_pull_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_reinit_keeps_cursor() {
        let db = test_db();
        assert!(db.get_vault_state().unwrap().is_none());
        db.init_vault_state(&sample_state()).unwrap();
        db.commit_vault_cursor(42, "2025-01-01T00:00:00Z").unwrap();

        let mut again = sample_state();
        again.auth_token = "tok-2".into();
        db.init_vault_state(&again).unwrap();

        let stored = db.get_vault_state().unwrap().unwrap();
        assert_eq!(stored.last_synced_seq, 42);
        assert_eq!(stored.auth_token, "tok-2");
        assert_eq!(stored.last_pull_at.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_tokens_and_error() {
        let db = test_db();
        db.init_vault_state(&sample_state()).unwrap();
        db.update_vault_tokens("new", "new-refresh", None).unwrap();
        db.record_vault_error(Some("server said no")).unwrap();

        let stored = db.get_vault_state().unwrap().unwrap();
        assert_eq!(stored.auth_token, "new");
        assert_eq!(stored.refresh_token, "new-refresh");
        assert!(stored.auth_expires_at.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("server said no"));

        db.record_vault_error(None).unwrap();
        assert!(db.get_vault_state().unwrap().unwrap().last_error.is_none());
    }
}
