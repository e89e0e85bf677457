/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The durable change queue. Entries are appended by the change-capture
//! triggers and drained oldest-first by the sync engine; completed entries
//! are deleted so the table stays bounded. Statistics are SQL aggregates,
//! never a scan-and-count in Rust.

use crate::db::PracticeDb;
use crate::error::*;
use crate::triggers::row_id_expr;
use rusqlite::{named_params, Row};
use serde::{Deserialize, Serialize};
use sql_support::ConnExt;
use sync_guid::Guid;
use tunesync::user_modifiable_tables;
use types::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxOp {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl OutboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOp::Insert => "INSERT",
            OutboxOp::Update => "UPDATE",
            OutboxOp::Delete => "DELETE",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(OutboxOp::Insert),
            "UPDATE" => Ok(OutboxOp::Update),
            "DELETE" => Ok(OutboxOp::Delete),
            other => Err(Error::UnexpectedOutboxValue(format!(
                "operation: {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InProgress => "in_progress",
            OutboxStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "in_progress" => Ok(OutboxStatus::InProgress),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(Error::UnexpectedOutboxValue(format!("status: {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Guid,
    pub table_name: String,
    pub row_id: String,
    pub operation: OutboxOp,
    pub status: OutboxStatus,
    pub changed_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
}

impl OutboxEntry {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        Ok(OutboxEntry {
            id: row.get("id")?,
            table_name: row.get("table_name")?,
            row_id: row.get("row_id")?,
            operation: OutboxOp::from_str(&row.get::<_, String>("operation")?)?,
            status: OutboxStatus::from_str(&row.get::<_, String>("status")?)?,
            changed_at: row.get("changed_at")?,
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            synced_at: row.get("synced_at")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub total: i64,
    pub oldest_pending: Option<String>,
}

const ENTRY_COLS: &str = "id, table_name, row_id, operation, status, changed_at,
                          attempts, last_error, synced_at";

impl PracticeDb {
    /// Oldest-first pending entries, arrival order breaking ties.
    pub fn get_pending(&self, limit: u32) -> Result<Vec<OutboxEntry>> {
        self.query_rows_and_then(
            &format!(
                "SELECT {} FROM sync_outbox
                 WHERE status = 'pending'
                 ORDER BY changed_at, rowid
                 LIMIT :limit",
                ENTRY_COLS
            ),
            named_params! { ":limit": limit },
            |row| OutboxEntry::from_row(row),
        )
    }

    pub fn mark_in_progress(&self, id: &Guid) -> Result<()> {
        self.execute_cached(
            "UPDATE sync_outbox SET status = 'in_progress' WHERE id = :id",
            named_params! { ":id": id },
        )?;
        Ok(())
    }

    /// Completed entries are deleted to bound the queue.
    pub fn mark_completed(&self, id: &Guid) -> Result<()> {
        self.execute_cached(
            "DELETE FROM sync_outbox WHERE id = :id",
            named_params! { ":id": id },
        )?;
        Ok(())
    }

    /// A transient failure: back to pending with the attempt recorded.
    pub fn mark_failed(&self, id: &Guid, error: &str, attempts: i64) -> Result<()> {
        self.execute_cached(
            "UPDATE sync_outbox
             SET status = 'pending', attempts = :attempts, last_error = :error
             WHERE id = :id",
            named_params! { ":id": id, ":attempts": attempts, ":error": error },
        )?;
        Ok(())
    }

    pub fn mark_permanently_failed(&self, id: &Guid, error: &str) -> Result<()> {
        self.execute_cached(
            "UPDATE sync_outbox
             SET status = 'failed', last_error = :error, synced_at = :now
             WHERE id = :id",
            named_params! {
                ":id": id,
                ":error": error,
                ":now": Timestamp::now().as_rfc3339(),
            },
        )?;
        Ok(())
    }

    /// Entries that were marked in-progress for a push whose transport never
    /// answered go straight back to pending, attempts untouched.
    pub fn requeue_in_progress(&self) -> Result<()> {
        self.execute_cached(
            "UPDATE sync_outbox SET status = 'pending' WHERE status = 'in_progress'",
            [],
        )?;
        Ok(())
    }

    pub fn get_failed(&self) -> Result<Vec<OutboxEntry>> {
        self.query_rows_and_then(
            &format!(
                "SELECT {} FROM sync_outbox WHERE status = 'failed' ORDER BY changed_at",
                ENTRY_COLS
            ),
            [],
            |row| OutboxEntry::from_row(row),
        )
    }

    /// User-initiated second chance for a permanently failed entry.
    pub fn retry(&self, id: &Guid) -> Result<()> {
        self.execute_cached(
            "UPDATE sync_outbox
             SET status = 'pending', attempts = 0, last_error = NULL, synced_at = NULL
             WHERE id = :id",
            named_params! { ":id": id },
        )?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<OutboxStats> {
        self.query_row_and_then_cached(
            "SELECT
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                COUNT(*),
                MIN(CASE WHEN status = 'pending' THEN changed_at END)
             FROM sync_outbox",
            [],
            |row| {
                Ok::<_, Error>(OutboxStats {
                    pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    in_progress: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    total: row.get(3)?,
                    oldest_pending: row.get(4)?,
                })
            },
        )
    }

    /// Re-capture rows written while the triggers were suppressed: for every
    /// row in `tables` (all user-modifiable tables when `None`) stamped by
    /// this device at or after `instant`, insert a pending UPDATE entry
    /// unless one already exists for that (table, row-id). Returns the
    /// number inserted.
    pub fn backfill_since(
        &self,
        instant: &str,
        tables: Option<&[String]>,
        device_id: &str,
    ) -> Result<u32> {
        let mut inserted = 0usize;
        for info in user_modifiable_tables() {
            if let Some(wanted) = tables {
                if !wanted.iter().any(|t| t == info.name) {
                    continue;
                }
            }
            let row_id = row_id_expr(info, "t");
            let sql = format!(
                "INSERT INTO sync_outbox
                     (id, table_name, row_id, operation, status, changed_at, attempts)
                 SELECT lower(hex(randomblob(16))), '{table}', {row_id}, 'UPDATE', 'pending',
                        t.last_modified_at, 0
                 FROM {table} t
                 WHERE t.last_modified_at >= :instant
                   AND (t.device_id = :device OR t.device_id IS NULL)
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_outbox o
                       WHERE o.table_name = '{table}'
                         AND o.row_id = {row_id}
                         AND o.status = 'pending'
                   )",
                table = info.name,
                row_id = row_id,
            );
            inserted += self.execute_cached(
                &sql,
                named_params! { ":instant": instant, ":device": device_id },
            )?;
        }
        Ok(inserted as u32)
    }

    /// Purge permanently failed entries older than the cutoff.
    pub fn clear_old(&self, older_than_ms: u64) -> Result<u32> {
        let cutoff = Timestamp::now()
            .checked_sub(std::time::Duration::from_millis(older_than_ms))
            .unwrap_or(Timestamp(0))
            .as_rfc3339();
        let n = self.execute_cached(
            "DELETE FROM sync_outbox
             WHERE status = 'failed' AND synced_at IS NOT NULL AND synced_at < :cutoff",
            named_params! { ":cutoff": cutoff },
        )?;
        Ok(n as u32)
    }

    /// The pending queue as an opaque container, for callers that need to
    /// preserve it across a store rebuild.
    pub fn export_pending(&self) -> Result<Vec<OutboxEntry>> {
        self.query_rows_and_then(
            &format!(
                "SELECT {} FROM sync_outbox WHERE status = 'pending' ORDER BY changed_at, rowid",
                ENTRY_COLS
            ),
            [],
            |row| OutboxEntry::from_row(row),
        )
    }

    /// Replay a previously exported queue into a rebuilt store. Entries that
    /// already exist are left alone.
    pub fn restore_pending(&self, entries: &[OutboxEntry]) -> Result<u32> {
        let mut restored = 0usize;
        for entry in entries {
            restored += self.execute_cached(
                "INSERT OR IGNORE INTO sync_outbox
                     (id, table_name, row_id, operation, status, changed_at, attempts,
                      last_error, synced_at)
                 VALUES (:id, :table_name, :row_id, :operation, 'pending', :changed_at,
                         :attempts, :last_error, NULL)",
                named_params! {
                    ":id": entry.id,
                    ":table_name": entry.table_name,
                    ":row_id": entry.row_id,
                    ":operation": entry.operation.as_str(),
                    ":changed_at": entry.changed_at,
                    ":attempts": entry.attempts,
                    ":last_error": entry.last_error,
                },
            )?;
        }
        Ok(restored as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tunesync::JsonMap;

    fn obj(v: serde_json::Value) -> JsonMap {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn db() -> PracticeDb {
        PracticeDb::open_in_memory("device-a").unwrap()
    }

    #[test]
    fn test_triggers_capture_insert_update_delete() {
        let db = db();
        db.write_row(
            "tune",
            obj(json!({"id": "T1", "title": "Silver Spear", "genre": "irish"})),
        )
        .unwrap();
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].table_name, "tune");
        assert_eq!(pending[0].row_id, "T1");
        assert_eq!(pending[0].operation, OutboxOp::Insert);
        assert_eq!(pending[0].attempts, 0);
        assert_eq!(pending[0].id.len(), 32);

        db.write_row("tune", obj(json!({"id": "T1", "title": "The Silver Spear"})))
            .unwrap();
        db.delete_row("tune", &obj(json!({"id": "T1"}))).unwrap();
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].operation, OutboxOp::Delete);
    }

    #[test]
    fn test_composite_row_id_in_outbox_is_parseable() {
        let db = db();
        db.write_row(
            "table_state",
            obj(json!({
                "user_id": "u1",
                "screen_size": "desktop",
                "purpose": "practice",
                "playlist_id": "P1"
            })),
        )
        .unwrap();
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        let info = tunesync::get_table("table_state").unwrap();
        // The trigger-produced id must round-trip through the Rust codec.
        let parsed = info
            .parse_row_id(&pending[0].row_id, tunesync::Casing::Local)
            .unwrap();
        assert_eq!(parsed.get("screen_size"), Some(&json!("desktop")));
        // And it must equal what the codec itself would build.
        let row = db
            .get_row(info, &parsed)
            .unwrap()
            .expect("row should exist");
        assert_eq!(
            info.build_row_id(&row, tunesync::Casing::Local).unwrap(),
            pending[0].row_id
        );
    }

    #[test]
    fn test_suppression_and_backfill() {
        let db = db();
        db.suppress_triggers().unwrap();
        let instant = types::Timestamp::now()
            .checked_sub(std::time::Duration::from_millis(5))
            .unwrap()
            .as_rfc3339();
        db.write_row("tune", obj(json!({"id": "T1", "title": "x"})))
            .unwrap();
        db.resume_triggers().unwrap();
        assert!(db.get_pending(10).unwrap().is_empty());

        let n = db.backfill_since(&instant, None, "device-a").unwrap();
        assert_eq!(n, 1);
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OutboxOp::Update);
        assert_eq!(pending[0].row_id, "T1");

        // Backfill is idempotent while the entry is still pending.
        assert_eq!(db.backfill_since(&instant, None, "device-a").unwrap(), 0);
    }

    #[test]
    fn test_backfill_skips_other_devices() {
        let db = db();
        db.suppress_triggers().unwrap();
        db.write_row(
            "tune",
            obj(json!({"id": "T1", "device_id": "some-other-device"})),
        )
        .unwrap();
        db.resume_triggers().unwrap();
        let n = db
            .backfill_since("2000-01-01T00:00:00.000Z", None, "device-a")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_status_transitions_and_stats() {
        let db = db();
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        db.write_row("tune", obj(json!({"id": "T2"}))).unwrap();
        let pending = db.get_pending(10).unwrap();
        assert_eq!(pending.len(), 2);

        db.mark_in_progress(&pending[0].id).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 1);

        db.mark_failed(&pending[0].id, "boom", 1).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.pending, 2);
        let entry = db
            .get_pending(10)
            .unwrap()
            .into_iter()
            .find(|e| e.id == pending[0].id)
            .unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));

        db.mark_permanently_failed(&pending[0].id, "gave up").unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(db.get_failed().unwrap().len(), 1);

        db.retry(&pending[0].id).unwrap();
        assert_eq!(db.get_stats().unwrap().pending, 2);

        db.mark_completed(&pending[0].id).unwrap();
        db.mark_completed(&pending[1].id).unwrap();
        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.oldest_pending, None);
    }

    #[test]
    fn test_clear_old_only_touches_failed() {
        let db = db();
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        let pending = db.get_pending(10).unwrap();
        db.mark_permanently_failed(&pending[0].id, "x").unwrap();
        // A fresh failure survives a 1-day cutoff...
        assert_eq!(db.clear_old(86_400_000).unwrap(), 0);
        // ...but not a zero cutoff.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(db.clear_old(0).unwrap(), 1);
        assert_eq!(db.get_stats().unwrap().total, 0);
    }

    #[test]
    fn test_export_restore_roundtrip() {
        let db = db();
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        let exported = db.export_pending().unwrap();
        assert_eq!(exported.len(), 1);

        let rebuilt = PracticeDb::open_in_memory("device-a").unwrap();
        assert_eq!(rebuilt.restore_pending(&exported).unwrap(), 1);
        let pending = rebuilt.get_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].row_id, "T1");
        // Restoring again is a no-op.
        assert_eq!(rebuilt.restore_pending(&exported).unwrap(), 0);
    }
}
