use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::now_ts;

const STATE_COLUMNS: &str = "service_name, status, last_sync_time, last_sync_token, \
     error_message, created_at, updated_at";

impl CrmDb {
    // =========================================================================
    // Provider sync state and dedup log
    // =========================================================================

    fn map_provider_state_row(row: &Row) -> rusqlite::Result<ProviderSyncState> {
        let status: String = row.get(1)?;
        Ok(ProviderSyncState {
            service_name: row.get(0)?,
            status: ProviderStatus::from_str_lossy(&status),
            last_sync_time: row.get(2)?,
            last_sync_token: row.get(3)?,
            error_message: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn get_provider_sync_state(
        &self,
        service: &str,
    ) -> Result<Option<ProviderSyncState>, DbError> {
        let state = self
            .conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM provider_sync_state WHERE service_name = ?1"),
                params![service],
                Self::map_provider_state_row,
            )
            .optional()?;
        Ok(state)
    }

    pub fn list_provider_sync_states(&self) -> Result<Vec<ProviderSyncState>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM provider_sync_state ORDER BY service_name"
        ))?;
        let rows = stmt.query_map([], Self::map_provider_state_row)?;
        collect_rows(rows)
    }

    fn set_provider_status(
        &self,
        service: &str,
        status: ProviderStatus,
        error_message: Option<&str>,
    ) -> Result<(), DbError> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO provider_sync_state (service_name, status, error_message, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(service_name) DO UPDATE SET
                status = excluded.status,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at",
            params![service, status.as_str(), error_message, now],
        )?;
        Ok(())
    }

    /// Enter `syncing` and clear any previous error.
    pub fn mark_provider_syncing(&self, service: &str) -> Result<(), DbError> {
        self.set_provider_status(service, ProviderStatus::Syncing, None)
    }

    pub fn mark_provider_idle(&self, service: &str) -> Result<(), DbError> {
        self.set_provider_status(service, ProviderStatus::Idle, None)
    }

    pub fn mark_provider_error(&self, service: &str, message: &str) -> Result<(), DbError> {
        let message = if message.trim().is_empty() { "unknown error" } else { message };
        self.set_provider_status(service, ProviderStatus::Error, Some(message))
    }

    /// Persist a newly accepted sync token and stamp `last_sync_time`.
    pub fn save_provider_sync_token(
        &self,
        service: &str,
        token: &str,
        synced_at: &str,
    ) -> Result<(), DbError> {
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO provider_sync_state (
                service_name, status, last_sync_time, last_sync_token, created_at, updated_at
             ) VALUES (?1, 'syncing', ?2, ?3, ?4, ?4)
             ON CONFLICT(service_name) DO UPDATE SET
                last_sync_time = excluded.last_sync_time,
                last_sync_token = excluded.last_sync_token,
                updated_at = excluded.updated_at",
            params![service, synced_at, token, now],
        )?;
        Ok(())
    }

    /// True when `(service, external_id)` has already been ingested.
    pub fn provider_log_exists(&self, service: &str, external_id: &str) -> Result<bool, DbError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM provider_sync_log
                 WHERE source_service = ?1 AND source_external_id = ?2",
                params![service, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record an ingested external record. Returns false if the pair was
    /// already logged.
    pub fn insert_provider_log(&self, entry: &ProviderSyncLogEntry) -> Result<bool, DbError> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO provider_sync_log (
                id, source_service, source_external_id, entity_type, entity_id, metadata_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.source_service,
                entry.source_external_id,
                entry.entity_type,
                entry.entity_id,
                entry.metadata_json,
                now_ts(),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn list_provider_log(&self, service: &str) -> Result<Vec<ProviderSyncLogEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source_service, source_external_id, entity_type, entity_id, metadata_json
             FROM provider_sync_log WHERE source_service = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![service], |row| {
            Ok(ProviderSyncLogEntry {
                id: row.get(0)?,
                source_service: row.get(1)?,
                source_external_id: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                metadata_json: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_status_transitions() {
        let db = test_db();
        assert!(db.get_provider_sync_state("calendar").unwrap().is_none());

        db.mark_provider_syncing("calendar").unwrap();
        db.mark_provider_error("calendar", "boom").unwrap();
        let state = db.get_provider_sync_state("calendar").unwrap().unwrap();
        assert_eq!(state.status, ProviderStatus::Error);
        assert_eq!(state.error_message.as_deref(), Some("boom"));

        db.mark_provider_syncing("calendar").unwrap();
        let state = db.get_provider_sync_state("calendar").unwrap().unwrap();
        assert_eq!(state.status, ProviderStatus::Syncing);
        assert!(state.error_message.is_none());
    }

    #[test]
    fn test_token_survives_status_changes() {
        let db = test_db();
        db.mark_provider_syncing("contacts").unwrap();
        db.save_provider_sync_token("contacts", "tok-1", "2025-01-01T00:00:00Z")
            .unwrap();
        db.mark_provider_idle("contacts").unwrap();

        let state = db.get_provider_sync_state("contacts").unwrap().unwrap();
        assert_eq!(state.status, ProviderStatus::Idle);
        assert_eq!(state.last_sync_token.as_deref(), Some("tok-1"));
        assert_eq!(state.last_sync_time.as_deref(), Some("2025-01-01T00:00:00Z"));
        assert_eq!(db.list_provider_sync_states().unwrap().len(), 1);
    }

    #[test]
    fn test_log_is_unique_per_external_id() {
        let db = test_db();
        let entry = ProviderSyncLogEntry {
            id: "l-1".into(),
            source_service: "contacts".into(),
            source_external_id: "people/1".into(),
            entity_type: "contact".into(),
            entity_id: "c-1".into(),
            metadata_json: None,
        };
        assert!(db.insert_provider_log(&entry).unwrap());
        let dup = ProviderSyncLogEntry { id: "l-2".into(), ..entry };
        assert!(!db.insert_provider_log(&dup).unwrap());
        assert!(db.provider_log_exists("contacts", "people/1").unwrap());
        assert!(!db.provider_log_exists("mail", "people/1").unwrap());
        assert_eq!(db.list_provider_log("contacts").unwrap().len(), 1);
    }
}
