use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::now_ts;

const RELATIONSHIP_COLUMNS: &str =
    "id, contact_id_1, contact_id_2, relationship_type, context, created_at, updated_at";

impl DbRelationship {
    /// Swap the contact pair into canonical orientation (`contact_id_1 < contact_id_2`).
    pub fn canonicalize(&mut self) {
        if self.contact_id_1 > self.contact_id_2 {
            std::mem::swap(&mut self.contact_id_1, &mut self.contact_id_2);
        }
    }
}

impl CrmDb {
    // =========================================================================
    // Relationships
    // =========================================================================

    fn map_relationship_row(row: &Row) -> rusqlite::Result<DbRelationship> {
        Ok(DbRelationship {
            id: row.get(0)?,
            contact_id_1: row.get(1)?,
            contact_id_2: row.get(2)?,
            relationship_type: row.get(3)?,
            context: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn get_relationship(&self, id: &str) -> Result<Option<DbRelationship>, DbError> {
        let rel = self
            .conn
            .query_row(
                &format!("SELECT {RELATIONSHIP_COLUMNS} FROM relationships WHERE id = ?1"),
                params![id],
                Self::map_relationship_row,
            )
            .optional()?;
        Ok(rel)
    }

    pub fn list_relationships_for_contact(
        &self,
        contact_id: &str,
    ) -> Result<Vec<DbRelationship>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
             WHERE contact_id_1 = ?1 OR contact_id_2 = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![contact_id], Self::map_relationship_row)?;
        collect_rows(rows)
    }

    /// Insert or update a relationship by id, storing it in canonical
    /// orientation. Returns the row as stored.
    ///
    /// A different relationship holding the same pair and type is replaced:
    /// only one relationship of a type may exist per unordered pair.
    pub fn upsert_relationship(&self, rel: &DbRelationship) -> Result<DbRelationship, DbError> {
        let mut rel = rel.clone();
        rel.canonicalize();
        rel.relationship_type = rel.relationship_type.trim().to_string();

        let displaced = self.conn.execute(
            "DELETE FROM relationships
             WHERE contact_id_1 = ?1 AND contact_id_2 = ?2 AND relationship_type = ?3 AND id <> ?4",
            params![rel.contact_id_1, rel.contact_id_2, rel.relationship_type, rel.id],
        )?;
        if displaced > 0 {
            log::warn!(
                "Relationship {} replaces an existing '{}' link between {} and {}",
                rel.id,
                rel.relationship_type,
                rel.contact_id_1,
                rel.contact_id_2
            );
        }

        self.conn.execute(
            "INSERT INTO relationships (
                id, contact_id_1, contact_id_2, relationship_type, context, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                contact_id_1 = excluded.contact_id_1,
                contact_id_2 = excluded.contact_id_2,
                relationship_type = excluded.relationship_type,
                context = excluded.context,
                updated_at = excluded.updated_at",
            params![
                rel.id,
                rel.contact_id_1,
                rel.contact_id_2,
                rel.relationship_type,
                rel.context,
                rel.created_at,
                now_ts(),
            ],
        )?;

        self.get_relationship(&rel.id)?
            .ok_or_else(|| DbError::Corrupt(format!("relationship {} vanished after upsert", rel.id)))
    }

    pub fn delete_relationship(&self, id: &str) -> Result<bool, DbError> {
        let n = self
            .conn
            .execute("DELETE FROM relationships WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
