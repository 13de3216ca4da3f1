use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::now_ts;

const DEAL_COLUMNS: &str = "id, title, amount, currency, stage, company_id, contact_id, \
     expected_close_date, created_at, last_activity_at, updated_at";

impl DbDeal {
    /// A deal synthesized only so that something can point at it: stage
    /// `unknown`, currency USD, no amount.
    pub fn placeholder(id: &str, title: &str, company_id: &str) -> Self {
        let now = now_ts();
        let title = title.trim();
        Self {
            id: id.to_string(),
            title: if title.is_empty() { id.to_string() } else { title.to_string() },
            amount: 0,
            currency: "USD".to_string(),
            stage: DealStage::Unknown,
            company_id: company_id.to_string(),
            contact_id: None,
            expected_close_date: None,
            created_at: now.clone(),
            last_activity_at: now.clone(),
            updated_at: now,
        }
    }
}

impl CrmDb {
    // =========================================================================
    // Deals and deal notes
    // =========================================================================

    fn map_deal_row(row: &Row) -> rusqlite::Result<DbDeal> {
        let stage: String = row.get(4)?;
        Ok(DbDeal {
            id: row.get(0)?,
            title: row.get(1)?,
            amount: row.get(2)?,
            currency: row.get(3)?,
            stage: DealStage::parse(&stage).ok_or_else(|| corrupt_column(4, "deal stage", &stage))?,
            company_id: row.get(5)?,
            contact_id: row.get(6)?,
            expected_close_date: row.get(7)?,
            created_at: row.get(8)?,
            last_activity_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn get_deal(&self, id: &str) -> Result<Option<DbDeal>, DbError> {
        let deal = self
            .conn
            .query_row(
                &format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = ?1"),
                params![id],
                Self::map_deal_row,
            )
            .optional()
            .map_err(row_error)?;
        Ok(deal)
    }

    /// Insert or update a deal by id.
    ///
    /// `created_at` and `last_activity_at` are kept from the stored row on
    /// update; activity only moves through [`CrmDb::add_deal_note`] and
    /// [`CrmDb::bump_deal_activity`].
    pub fn upsert_deal(&self, deal: &DbDeal) -> Result<(), DbError> {
        let last_activity = if deal.last_activity_at < deal.created_at {
            &deal.created_at
        } else {
            &deal.last_activity_at
        };
        self.conn.execute(
            "INSERT INTO deals (
                id, title, amount, currency, stage, company_id, contact_id,
                expected_close_date, created_at, last_activity_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                amount = excluded.amount,
                currency = excluded.currency,
                stage = excluded.stage,
                company_id = excluded.company_id,
                contact_id = excluded.contact_id,
                expected_close_date = excluded.expected_close_date,
                updated_at = excluded.updated_at",
            params![
                deal.id,
                deal.title,
                deal.amount,
                deal.currency,
                deal.stage.as_str(),
                deal.company_id,
                deal.contact_id,
                deal.expected_close_date,
                deal.created_at,
                last_activity,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    /// Advance a deal's `last_activity_at` to `at` (monotonic max).
    pub fn bump_deal_activity(&self, deal_id: &str, at: &str) -> Result<bool, DbError> {
        let n = self.conn.execute(
            "UPDATE deals SET last_activity_at = ?2, updated_at = ?3
             WHERE id = ?1 AND last_activity_at < ?2",
            params![deal_id, at, now_ts()],
        )?;
        Ok(n > 0)
    }

    /// Return the deal with `id`, creating a placeholder under `company_id`
    /// if it does not exist. The company must already exist.
    pub fn ensure_deal(&self, id: &str, title: &str, company_id: &str) -> Result<DbDeal, DbError> {
        if let Some(existing) = self.get_deal(id)? {
            return Ok(existing);
        }
        self.upsert_deal(&DbDeal::placeholder(id, title, company_id))?;
        log::debug!("Created placeholder deal {} under company {}", id, company_id);
        self.get_deal(id)?
            .ok_or_else(|| DbError::Corrupt(format!("deal {id} vanished after insert")))
    }

    /// Append a note to its deal.
    ///
    /// Notes are append-only: a note id that already exists is left alone and
    /// `false` is returned. A new note bumps the deal's `last_activity_at` and,
    /// when the deal has a contact, that contact's `last_contacted_at` to the
    /// note's `created_at`.
    pub fn add_deal_note(&self, note: &DbDealNote) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO deal_notes (id, deal_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![note.id, note.deal_id, note.content, note.created_at],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        self.bump_deal_activity(&note.deal_id, &note.created_at)?;
        if let Some(contact_id) = self.get_deal(&note.deal_id)?.and_then(|d| d.contact_id) {
            self.bump_contact_last_contacted(&contact_id, &note.created_at)?;
        }
        Ok(true)
    }

    pub fn list_deal_notes(&self, deal_id: &str) -> Result<Vec<DbDealNote>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, deal_id, content, created_at FROM deal_notes
             WHERE deal_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![deal_id], |row| {
            Ok(DbDealNote {
                id: row.get(0)?,
                deal_id: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Delete a deal (its notes cascade). Returns false when it did not exist.
    pub fn delete_deal(&self, id: &str) -> Result<bool, DbError> {
        let n = self
            .conn
            .execute("DELETE FROM deals WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    fn seed_deal(db: &CrmDb, contact: Option<&str>) -> DbDeal {
        db.ensure_company("co-1", "Acme").unwrap();
        let mut deal = DbDeal::placeholder("d-1", "Renewal", "co-1");
        deal.stage = DealStage::Proposal;
        deal.created_at = "2025-01-01T00:00:00Z".into();
        deal.last_activity_at = "2025-01-01T00:00:00Z".into();
        deal.contact_id = contact.map(String::from);
        db.upsert_deal(&deal).unwrap();
        deal
    }

    #[test]
    fn test_upsert_keeps_created_and_activity() {
        let db = test_db();
        let mut deal = seed_deal(&db, None);
        deal.title = "Renewal 2026".into();
        deal.created_at = "2025-09-01T00:00:00Z".into();
        deal.last_activity_at = "2025-09-01T00:00:00Z".into();
        db.upsert_deal(&deal).unwrap();

        let stored = db.get_deal("d-1").unwrap().unwrap();
        assert_eq!(stored.title, "Renewal 2026");
        assert_eq!(stored.stage, DealStage::Proposal);
        assert_eq!(stored.created_at, "2025-01-01T00:00:00Z");
        assert_eq!(stored.last_activity_at, "2025-01-01T00:00:00Z");
    }

    #[test]
    fn test_note_bumps_deal_and_contact() {
        let db = test_db();
        db.ensure_contact("c-1", "Alice").unwrap();
        seed_deal(&db, Some("c-1"));

        let note = DbDealNote {
            id: "n-1".into(),
            deal_id: "d-1".into(),
            content: "Sent proposal".into(),
            created_at: "2025-02-01T10:00:00Z".into(),
        };
        assert!(db.add_deal_note(&note).unwrap());
        assert!(!db.add_deal_note(&note).unwrap());

        let deal = db.get_deal("d-1").unwrap().unwrap();
        assert_eq!(deal.last_activity_at, "2025-02-01T10:00:00Z");
        let contact = db.get_contact("c-1").unwrap().unwrap();
        assert_eq!(contact.last_contacted_at.as_deref(), Some("2025-02-01T10:00:00Z"));
        assert_eq!(db.list_deal_notes("d-1").unwrap().len(), 1);
    }

    #[test]
    fn test_older_note_does_not_regress_activity() {
        let db = test_db();
        seed_deal(&db, None);
        db.bump_deal_activity("d-1", "2025-03-01T00:00:00Z").unwrap();
        db.add_deal_note(&DbDealNote {
            id: "n-old".into(),
            deal_id: "d-1".into(),
            content: String::new(),
            created_at: "2024-12-01T00:00:00Z".into(),
        })
        .unwrap();
        let deal = db.get_deal("d-1").unwrap().unwrap();
        assert_eq!(deal.last_activity_at, "2025-03-01T00:00:00Z");
    }

    #[test]
    fn test_company_delete_cascades_to_deals() {
        let db = test_db();
        seed_deal(&db, None);
        assert!(db.delete_company("co-1").unwrap());
        assert!(db.get_deal("d-1").unwrap().is_none());
        assert!(!db.delete_deal("d-1").unwrap());
    }

    #[test]
    fn test_unknown_stage_is_corrupt() {
        let db = test_db();
        seed_deal(&db, None);
        db.conn_ref()
            .execute_batch(
                "PRAGMA ignore_check_constraints = ON;
                 UPDATE deals SET stage = 'won' WHERE id = 'd-1';
                 PRAGMA ignore_check_constraints = OFF;",
            )
            .unwrap();

        assert!(matches!(db.get_deal("d-1"), Err(DbError::Corrupt(_))));
    }
}
