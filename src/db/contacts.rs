use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::{collapse_whitespace, normalize_email, normalize_name, now_ts};

const CONTACT_COLUMNS: &str =
    "id, name, email, phone, company_id, notes, last_contacted_at, created_at, updated_at";

impl CrmDb {
    // =========================================================================
    // Contacts
    // =========================================================================

    fn map_contact_row(row: &Row) -> rusqlite::Result<DbContact> {
        Ok(DbContact {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            company_id: row.get(4)?,
            notes: row.get(5)?,
            last_contacted_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    pub fn get_contact(&self, id: &str) -> Result<Option<DbContact>, DbError> {
        let contact = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id],
                Self::map_contact_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Look up a contact by email (trimmed, case-insensitive).
    pub fn find_contact_by_email(&self, email: &str) -> Result<Option<DbContact>, DbError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Ok(None);
        }
        let contact = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1"),
                params![email],
                Self::map_contact_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// All contacts sharing a normalized name, in insertion order.
    pub fn find_contacts_by_name(&self, name: &str) -> Result<Vec<DbContact>, DbError> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE name_key = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![key], Self::map_contact_row)?;
        collect_rows(rows)
    }

    /// Snapshot of every contact in insertion order.
    pub fn list_contacts(&self) -> Result<Vec<DbContact>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], Self::map_contact_row)?;
        collect_rows(rows)
    }

    /// Insert or update a contact by id.
    ///
    /// - `email` is normalized; if another contact already owns it, this row is
    ///   stored without an email.
    /// - `last_contacted_at` only ever moves forward; a missing value keeps the
    ///   stored one.
    /// - `created_at` is preserved on update.
    pub fn upsert_contact(&self, contact: &DbContact) -> Result<(), DbError> {
        let name = collapse_whitespace(&contact.name);
        let name = if name.is_empty() { contact.id.clone() } else { name };

        let mut email = normalize_email(&contact.email);
        if !email.is_empty() {
            if let Some(owner) = self.find_contact_by_email(&email)? {
                if owner.id != contact.id {
                    log::warn!(
                        "Email {} already belongs to contact {}; storing {} without email",
                        email,
                        owner.id,
                        contact.id
                    );
                    email.clear();
                }
            }
        }

        self.conn.execute(
            "INSERT INTO contacts (
                id, name, name_key, email, phone, company_id, notes,
                last_contacted_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                name_key = excluded.name_key,
                email = excluded.email,
                phone = excluded.phone,
                company_id = excluded.company_id,
                notes = excluded.notes,
                last_contacted_at = CASE
                    WHEN excluded.last_contacted_at IS NULL THEN contacts.last_contacted_at
                    WHEN contacts.last_contacted_at IS NULL
                         OR excluded.last_contacted_at > contacts.last_contacted_at
                        THEN excluded.last_contacted_at
                    ELSE contacts.last_contacted_at
                END,
                updated_at = excluded.updated_at",
            params![
                contact.id,
                name,
                normalize_name(&name),
                email,
                contact.phone,
                contact.company_id,
                contact.notes,
                contact.last_contacted_at,
                contact.created_at,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// Advance `last_contacted_at` to `at` unless it is already later.
    /// Returns true when the row changed.
    pub fn bump_contact_last_contacted(&self, id: &str, at: &str) -> Result<bool, DbError> {
        let n = self.conn.execute(
            "UPDATE contacts SET last_contacted_at = ?2, updated_at = ?3
             WHERE id = ?1 AND (last_contacted_at IS NULL OR last_contacted_at < ?2)",
            params![id, at, now_ts()],
        )?;
        Ok(n > 0)
    }

    /// Return the contact with `id`, creating a placeholder named `name`
    /// (or the id itself when `name` is blank) if it does not exist yet.
    pub fn ensure_contact(&self, id: &str, name: &str) -> Result<DbContact, DbError> {
        if let Some(existing) = self.get_contact(id)? {
            return Ok(existing);
        }
        self.upsert_contact(&DbContact::named(id, name))?;
        log::debug!("Created placeholder contact {}", id);
        self.get_contact(id)?
            .ok_or_else(|| DbError::Corrupt(format!("contact {id} vanished after insert")))
    }

    /// Delete a contact. Returns false when it did not exist.
    pub fn delete_contact(&self, id: &str) -> Result<bool, DbError> {
        let n = self
            .conn
            .execute("DELETE FROM contacts WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_upsert_normalizes_email_and_name() {
        let db = test_db();
        let mut contact = DbContact::named("c-1", "  Alice   Smith ");
        contact.email = " Alice@Acme.COM ".into();
        db.upsert_contact(&contact).unwrap();

        let stored = db.find_contact_by_email("alice@acme.com").unwrap().unwrap();
        assert_eq!(stored.id, "c-1");
        assert_eq!(stored.name, "Alice Smith");
        assert_eq!(db.find_contacts_by_name("alice smith").unwrap().len(), 1);
    }

    #[test]
    fn test_email_collision_drops_incoming_email() {
        let db = test_db();
        let mut first = DbContact::named("c-1", "Alice");
        first.email = "alice@acme.com".into();
        db.upsert_contact(&first).unwrap();

        let mut second = DbContact::named("c-2", "Alice Two");
        second.email = "ALICE@acme.com".into();
        db.upsert_contact(&second).unwrap();

        let stored = db.get_contact("c-2").unwrap().unwrap();
        assert_eq!(stored.email, "");
        assert_eq!(
            db.find_contact_by_email("alice@acme.com").unwrap().unwrap().id,
            "c-1"
        );
    }

    #[test]
    fn test_last_contacted_is_monotonic() {
        let db = test_db();
        let mut contact = DbContact::named("c-1", "Alice");
        contact.last_contacted_at = Some("2025-03-01T00:00:00Z".into());
        db.upsert_contact(&contact).unwrap();

        contact.last_contacted_at = Some("2025-01-01T00:00:00Z".into());
        db.upsert_contact(&contact).unwrap();
        contact.last_contacted_at = None;
        db.upsert_contact(&contact).unwrap();

        assert!(!db
            .bump_contact_last_contacted("c-1", "2025-02-01T00:00:00Z")
            .unwrap());
        assert!(db
            .bump_contact_last_contacted("c-1", "2025-04-01T00:00:00Z")
            .unwrap());

        let stored = db.get_contact("c-1").unwrap().unwrap();
        assert_eq!(stored.last_contacted_at.as_deref(), Some("2025-04-01T00:00:00Z"));
    }

    #[test]
    fn test_delete_contact_reports_missing() {
        let db = test_db();
        db.ensure_contact("c-1", "").unwrap();
        assert_eq!(db.get_contact("c-1").unwrap().unwrap().name, "c-1");
        assert!(db.delete_contact("c-1").unwrap());
        assert!(!db.delete_contact("c-1").unwrap());
    }
}
