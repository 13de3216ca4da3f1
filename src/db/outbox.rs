use rusqlite::params;

use super::*;
use crate::util::now_ts;

impl CrmDb {
    // =========================================================================
    // Outbox
    // =========================================================================

    /// Append a pending change. Call inside the same transaction as the
    /// local write it describes. Returns the assigned `seq`.
    pub fn outbox_enqueue(
        &self,
        entity: &str,
        entity_id: &str,
        op: ChangeOp,
        payload: &str,
    ) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO outbox (entity, entity_id, op, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity, entity_id, op.as_str(), payload, now_ts()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Up to `limit` pending items in `seq` order. Nothing is removed.
    pub fn outbox_dequeue_batch(&self, limit: usize) -> Result<Vec<OutboxItem>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, entity, entity_id, op, payload, enqueued_at
             FROM outbox ORDER BY seq ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let op: String = row.get(3)?;
            Ok(OutboxItem {
                seq: row.get(0)?,
                entity: row.get(1)?,
                entity_id: row.get(2)?,
                op: ChangeOp::parse(&op).ok_or_else(|| corrupt_column(3, "outbox op", &op))?,
                payload: row.get(4)?,
                enqueued_at: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Remove every item with `seq <= up_to_seq`. Returns how many were removed.
    pub fn outbox_acknowledge(&self, up_to_seq: i64) -> Result<usize, DbError> {
        let n = self
            .conn
            .execute("DELETE FROM outbox WHERE seq <= ?1", params![up_to_seq])?;
        Ok(n)
    }

    pub fn outbox_pending_count(&self) -> Result<i64, DbError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Highest `seq` currently queued, if any.
    pub fn outbox_max_seq(&self) -> Result<Option<i64>, DbError> {
        let seq = self
            .conn
            .query_row("SELECT MAX(seq) FROM outbox", [], |row| row.get(0))?;
        Ok(seq)
    }
}
