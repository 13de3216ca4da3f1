use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::now_ts;

const INTERACTION_COLUMNS: &str =
    "id, contact_id, interaction_type, interacted_at, sentiment, metadata_json, created_at";

impl CrmDb {
    // =========================================================================
    // Interaction logs and cadence
    // =========================================================================

    fn map_interaction_row(row: &Row) -> rusqlite::Result<DbInteraction> {
        let kind: String = row.get(2)?;
        let sentiment: Option<String> = row.get(4)?;
        let metadata_json: Option<String> = row.get(5)?;
        Ok(DbInteraction {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            interaction_type: InteractionType::parse(&kind).unwrap_or(InteractionType::Event),
            interacted_at: row.get(3)?,
            sentiment: sentiment.as_deref().and_then(Sentiment::parse),
            metadata: metadata_json.and_then(|j| serde_json::from_str(&j).ok()),
            created_at: row.get(6)?,
        })
    }

    pub fn get_interaction(&self, id: &str) -> Result<Option<DbInteraction>, DbError> {
        let interaction = self
            .conn
            .query_row(
                &format!("SELECT {INTERACTION_COLUMNS} FROM interaction_logs WHERE id = ?1"),
                params![id],
                Self::map_interaction_row,
            )
            .optional()?;
        Ok(interaction)
    }

    /// Interactions for a contact, most recent first.
    pub fn list_interactions_for_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<DbInteraction>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interaction_logs
             WHERE contact_id = ?1 ORDER BY interacted_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![contact_id], Self::map_interaction_row)?;
        collect_rows(rows)
    }

    /// Record an interaction and advance the contact's `last_contacted_at`
    /// to `max(existing, interacted_at)`.
    ///
    /// Interaction ids are write-once; re-inserting an existing id changes
    /// nothing and returns `false`.
    pub fn insert_interaction(&self, log: &DbInteraction) -> Result<bool, DbError> {
        let metadata_json = match &log.metadata {
            Some(map) => Some(
                serde_json::to_string(map)
                    .map_err(|e| DbError::Corrupt(format!("interaction metadata: {e}")))?,
            ),
            None => None,
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO interaction_logs (
                id, contact_id, interaction_type, interacted_at, sentiment, metadata_json, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.id,
                log.contact_id,
                log.interaction_type.as_str(),
                log.interacted_at,
                log.sentiment.map(|s| s.as_str()),
                metadata_json,
                log.created_at,
            ],
        )?;
        self.bump_contact_last_contacted(&log.contact_id, &log.interacted_at)?;
        Ok(inserted > 0)
    }

    pub fn get_cadence(&self, contact_id: &str) -> Result<Option<DbCadence>, DbError> {
        let cadence = self
            .conn
            .query_row(
                "SELECT contact_id, cadence_days, relationship_strength, priority_score, updated_at
                 FROM contact_cadence WHERE contact_id = ?1",
                params![contact_id],
                |row| {
                    Ok(DbCadence {
                        contact_id: row.get(0)?,
                        cadence_days: row.get(1)?,
                        relationship_strength: row.get(2)?,
                        priority_score: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(cadence)
    }

    /// Store a cadence row verbatim (keyed by contact id).
    pub fn upsert_cadence(&self, cadence: &DbCadence) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO contact_cadence (
                contact_id, cadence_days, relationship_strength, priority_score, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(contact_id) DO UPDATE SET
                cadence_days = excluded.cadence_days,
                relationship_strength = excluded.relationship_strength,
                priority_score = excluded.priority_score,
                updated_at = excluded.updated_at",
            params![
                cadence.contact_id,
                cadence.cadence_days,
                cadence.relationship_strength,
                cadence.priority_score,
                now_ts(),
            ],
        )?;
        Ok(())
    }
}
