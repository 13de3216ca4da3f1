//! SQLite-backed local store for the CRM and its sync bookkeeping.
//!
//! The database lives at `~/.pcrm/pcrm.db` unless the config overrides it.
//! Every mutation goes through [`CrmDb::with_transaction`]; the sync layers
//! rely on that to keep an entity write and its outbox row in one commit.

use std::path::PathBuf;

use rusqlite::types::Type;
use rusqlite::Connection;

pub mod types;
pub use types::*;

pub mod companies;
pub mod contacts;
pub mod deals;
pub mod interactions;
pub mod outbox;
pub mod provider_sync;
pub mod relationships;
pub mod vault_state;

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// When a transaction is already open on this connection the closure runs
    /// inside a savepoint instead, so helpers can be composed freely.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        let nested = !self.conn.is_autocommit();
        let (begin, commit, rollback) = if nested {
            (
                "SAVEPOINT pcrm_nested",
                "RELEASE pcrm_nested",
                "ROLLBACK TO pcrm_nested; RELEASE pcrm_nested",
            )
        } else {
            ("BEGIN IMMEDIATE", "COMMIT", "ROLLBACK")
        };

        self.conn
            .execute_batch(begin)
            .map_err(|e| E::from(DbError::Sqlite(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch(commit) {
                    let _ = self.conn.execute_batch(rollback);
                    return Err(E::from(DbError::Sqlite(e)));
                }
                Ok(val)
            }
            Err(e) => {
                if let Err(rb) = self.conn.execute_batch(rollback) {
                    log::warn!("Rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Resolve the default database path: `~/.pcrm/pcrm.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".pcrm").join("pcrm.db"))
    }
}

/// Collect a `query_map` iterator into a `Vec`, surfacing the first row error.
pub(crate) fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, DbError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(row_error)?);
    }
    Ok(out)
}

/// Reject a stored text value that does not parse, from inside a row mapper.
pub(crate) fn corrupt_column(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        Box::new(DbError::Corrupt(format!("{what} '{value}'"))),
    )
}

/// Unwrap a [`corrupt_column`] failure back into [`DbError::Corrupt`].
pub(crate) fn row_error(err: rusqlite::Error) -> DbError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(idx, ty, inner) => {
            match inner.downcast::<DbError>() {
                Ok(db_err) => *db_err,
                Err(inner) => DbError::Sqlite(rusqlite::Error::FromSqlConversionFailure(idx, ty, inner)),
            }
        }
        other => DbError::Sqlite(other),
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.upsert_company(&DbCompany::named("co-1", "Acme"))?;
            Err(DbError::Corrupt("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.get_company("co-1").unwrap().is_none());
    }

    #[test]
    fn test_nested_transaction_uses_savepoint() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.upsert_company(&DbCompany::named("co-1", "Acme"))?;
            let inner: Result<(), DbError> = tx.with_transaction(|inner| {
                inner.upsert_company(&DbCompany::named("co-2", "Initech"))?;
                Err(DbError::Corrupt("inner".into()))
            });
            assert!(inner.is_err());
            Ok(())
        });
        assert!(result.is_ok());
        assert!(db.get_company("co-1").unwrap().is_some());
        assert!(db.get_company("co-2").unwrap().is_none());
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = test_db();
        let mut contact = DbContact::named("c-1", "Alice");
        contact.company_id = Some("missing".into());
        assert!(db.upsert_contact(&contact).is_err());
    }
}
