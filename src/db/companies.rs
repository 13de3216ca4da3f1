use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::util::{company_name_from_domain, normalize_name, now_ts};

const COMPANY_COLUMNS: &str = "id, name, domain, industry, notes, created_at, updated_at";

impl CrmDb {
    // =========================================================================
    // Companies
    // =========================================================================

    fn map_company_row(row: &Row) -> rusqlite::Result<DbCompany> {
        Ok(DbCompany {
            id: row.get(0)?,
            name: row.get(1)?,
            domain: row.get(2)?,
            industry: row.get(3)?,
            notes: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn get_company(&self, id: &str) -> Result<Option<DbCompany>, DbError> {
        let company = self
            .conn
            .query_row(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ?1"),
                params![id],
                Self::map_company_row,
            )
            .optional()?;
        Ok(company)
    }

    /// Look up a company by normalized name (trimmed, whitespace-collapsed, casefolded).
    pub fn find_company_by_name(&self, name: &str) -> Result<Option<DbCompany>, DbError> {
        let key = normalize_name(name);
        if key.is_empty() {
            return Ok(None);
        }
        let company = self
            .conn
            .query_row(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE name_key = ?1"),
                params![key],
                Self::map_company_row,
            )
            .optional()?;
        Ok(company)
    }

    pub fn list_companies(&self) -> Result<Vec<DbCompany>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMPANY_COLUMNS} FROM companies ORDER BY rowid"
        ))?;
        let rows = stmt.query_map([], Self::map_company_row)?;
        collect_rows(rows)
    }

    /// Pick a stored name for `id` that keeps company names unique.
    ///
    /// If another company already owns the normalized name, the name is
    /// suffixed with the first eight characters of `id`, then with a counter
    /// until no other company holds it.
    fn unique_company_name(&self, id: &str, name: &str) -> Result<String, DbError> {
        let trimmed = crate::util::collapse_whitespace(name);
        let name = if trimmed.is_empty() { id.to_string() } else { trimmed };
        let taken = |candidate: &str| -> Result<bool, DbError> {
            Ok(self
                .find_company_by_name(candidate)?
                .is_some_and(|other| other.id != id))
        };
        if !taken(&name)? {
            return Ok(name);
        }

        let short: String = id.chars().take(8).collect();
        let mut renamed = format!("{} ({})", name, short);
        let mut n = 2;
        while taken(&renamed)? {
            renamed = format!("{} ({}-{})", name, short, n);
            n += 1;
        }
        log::warn!(
            "Company name '{}' already in use; storing {} as '{}'",
            name,
            id,
            renamed
        );
        Ok(renamed)
    }

    /// Insert or update a company by id. `created_at` is preserved on update.
    pub fn upsert_company(&self, company: &DbCompany) -> Result<(), DbError> {
        let name = self.unique_company_name(&company.id, &company.name)?;
        let now = now_ts();
        self.conn.execute(
            "INSERT INTO companies (id, name, name_key, domain, industry, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, LOWER(TRIM(?4)), ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                name_key = excluded.name_key,
                domain = excluded.domain,
                industry = excluded.industry,
                notes = excluded.notes,
                updated_at = excluded.updated_at",
            params![
                company.id,
                name,
                normalize_name(&name),
                company.domain,
                company.industry,
                company.notes,
                company.created_at,
                now,
            ],
        )?;
        Ok(())
    }

    /// Return the company with `id`, creating a placeholder named `name`
    /// (or the id itself when `name` is blank) if it does not exist yet.
    pub fn ensure_company(&self, id: &str, name: &str) -> Result<DbCompany, DbError> {
        if let Some(existing) = self.get_company(id)? {
            return Ok(existing);
        }
        let placeholder = DbCompany::named(id, name);
        self.upsert_company(&placeholder)?;
        log::debug!("Created placeholder company {}", id);
        self.get_company(id)?
            .ok_or_else(|| DbError::Corrupt(format!("company {id} vanished after insert")))
    }

    /// Find a company by normalized name, or create one with a fresh id.
    pub fn ensure_company_by_name(&self, name: &str) -> Result<DbCompany, DbError> {
        if let Some(existing) = self.find_company_by_name(name)? {
            return Ok(existing);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.ensure_company(&id, name)
    }

    /// Find or create the company behind an email domain.
    ///
    /// The company name is derived from the domain ("acme-corp.com" → "Acme Corp").
    /// A match by name with no domain recorded gets the domain filled in.
    pub fn ensure_company_from_domain(&self, domain: &str) -> Result<Option<DbCompany>, DbError> {
        let domain = domain.trim().to_lowercase();
        let name = company_name_from_domain(&domain);
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(mut existing) = self.find_company_by_name(&name)? {
            if existing.domain.is_empty() {
                existing.domain = domain;
                self.upsert_company(&existing)?;
            }
            return Ok(Some(existing));
        }
        let mut company = DbCompany::named(&uuid::Uuid::new_v4().to_string(), &name);
        company.domain = domain;
        self.upsert_company(&company)?;
        Ok(Some(company))
    }

    /// Delete a company. Returns false when it did not exist.
    pub fn delete_company(&self, id: &str) -> Result<bool, DbError> {
        let n = self
            .conn
            .execute("DELETE FROM companies WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
