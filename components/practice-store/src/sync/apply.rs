/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Applying pulled changes to the local store, and the ordering rules shared
//! by push and apply: inserts/updates run parents-first, deletes run
//! children-first and after all upserts; ties keep arrival order.

use crate::db::PracticeDb;
use crate::error::*;
use crate::outbox::{OutboxEntry, OutboxOp};
use serde_json::Value;
use tunesync::{get_table, to_local, Casing, ChangeRecord, TableInfo};

/// Sort key implementing the dependency rule. Unknown tables sort last so
/// the protocol-error path sees them in a deterministic place.
fn order_key(table: &str, is_delete: bool) -> (u8, i64) {
    let sync_order = get_table(table).map(|t| i64::from(t.sync_order)).unwrap_or(i64::MAX);
    if is_delete {
        (1, -sync_order)
    } else {
        (0, sync_order)
    }
}

pub(super) fn order_for_push(entries: Vec<OutboxEntry>) -> Vec<OutboxEntry> {
    let mut entries = entries;
    // Stable sort; get_pending returned arrival order, which breaks ties.
    entries.sort_by_key(|e| order_key(&e.table_name, e.operation == OutboxOp::Delete));
    entries
}

pub(super) fn order_for_apply(changes: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut changes = changes;
    changes.sort_by_key(|c| order_key(&c.table, c.deleted));
    changes
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ApplyOutcome {
    Applied,
    /// Applied over a local row whose `last_modified_at` differed; two
    /// devices raced and this change won.
    AppliedWithConflict,
    /// Dropped because the local row carries a strictly newer
    /// `last_modified_at` (an unpushed local write, or a deletion the
    /// incoming change predates). The local side wins and the next push
    /// settles it; a stale change must in particular never resurrect a
    /// newer soft-delete.
    SkippedStale,
    /// Dropped because the change's key columns were unusable. Logged by
    /// the caller, never fatal.
    SkippedBadKey,
    /// Hit a foreign-key violation; the caller queues it for a later pass.
    Deferred,
}

pub(super) fn is_fk_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

pub(super) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Apply one pulled change to the local store. The caller holds the DB lock
/// and has the triggers suppressed.
pub(super) fn apply_change(
    db: &PracticeDb,
    info: &TableInfo,
    change: &ChangeRecord,
) -> Result<ApplyOutcome> {
    if change.deleted {
        // A tombstone carries key columns only; reconcile with a local
        // hard delete. Children may still reference the row, in which case
        // we defer like any other FK failure.
        let wire_pk = match info.parse_row_id(&change.row_id, Casing::Wire) {
            Ok(map) => map,
            Err(_) => return Ok(ApplyOutcome::SkippedBadKey),
        };
        let local_pk = to_local(info, &wire_pk);
        if let (Some(existing), Some(tombstone_lma)) = (
            db.get_row(info, &local_pk)?,
            change.last_modified_at.as_deref(),
        ) {
            let existing_lma = existing
                .get("last_modified_at")
                .and_then(Value::as_str)
                .unwrap_or("");
            if existing_lma > tombstone_lma {
                return Ok(ApplyOutcome::SkippedStale);
            }
        }
        return match db.delete_row_by_pk(info, &local_pk) {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(Error::SqlError(e)) if is_fk_violation(&e) => Ok(ApplyOutcome::Deferred),
            Err(e) => Err(e),
        };
    }

    let mut local = to_local(info, &change.data);
    // The payload usually carries its key columns; fall back to the row id
    // when it doesn't.
    if info
        .primary_key
        .columns()
        .iter()
        .any(|c| !local.contains_key(*c))
    {
        match info.parse_row_id(&change.row_id, Casing::Wire) {
            Ok(wire_pk) => {
                for (k, v) in to_local(info, &wire_pk) {
                    local.entry(k).or_insert(v);
                }
            }
            Err(_) => return Ok(ApplyOutcome::SkippedBadKey),
        }
    }
    let pk = match PracticeDb::pk_of(info, &local) {
        Ok(pk) => pk,
        Err(_) => return Ok(ApplyOutcome::SkippedBadKey),
    };

    let incoming_lma = local
        .get("last_modified_at")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| change.last_modified_at.clone())
        .unwrap_or_default();

    let mut conflict = false;
    if let Some(existing) = db.get_row(info, &pk)? {
        let existing_lma = existing
            .get("last_modified_at")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !existing_lma.is_empty() && !incoming_lma.is_empty() {
            // Last write wins on this side too. The local row being newer
            // means an unpushed local write (or a newer local soft-delete,
            // which a stale change must not resurrect); the next push
            // carries it to the server and LWW settles the rest.
            if existing_lma > incoming_lma.as_str() {
                return Ok(ApplyOutcome::SkippedStale);
            }
            // Overwriting another device's concurrent state is worth
            // surfacing as a conflict, resolved here by LWW.
            conflict = existing_lma < incoming_lma.as_str()
                && existing.get("device_id").and_then(Value::as_str)
                    != local.get("device_id").and_then(Value::as_str);
        }
    }

    match db.upsert_row(info, &local, info.primary_key.columns(), &[]) {
        Ok(()) => {}
        Err(Error::SqlError(e)) if is_unique_violation(&e) && !info.unique_keys.is_empty() => {
            // A pre-existing local row shares the business key but not the
            // synthetic PK. Upsert against the natural key instead, leaving
            // the local PK untouched.
            let target = info.unique_keys[0];
            match db.upsert_row(info, &local, target, info.primary_key.columns()) {
                Ok(()) => {}
                Err(Error::SqlError(e)) if is_fk_violation(&e) => {
                    return Ok(ApplyOutcome::Deferred)
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::SqlError(e)) if is_fk_violation(&e) => return Ok(ApplyOutcome::Deferred),
        Err(e) => return Err(e),
    }
    Ok(if conflict {
        ApplyOutcome::AppliedWithConflict
    } else {
        ApplyOutcome::Applied
    })
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

    fn change(table: &str, row_id: &str, deleted: bool, data: serde_json::Value) -> ChangeRecord {
        ChangeRecord {
            table: table.to_string(),
            row_id: row_id.to_string(),
            data: obj(data),
            deleted,
            last_modified_at: None,
        }
    }

    #[test]
    fn test_order_for_apply_parents_first_deletes_last() {
        let ordered = order_for_apply(vec![
            change("practice_record", "R1", false, json!({})),
            change("tune", "T-del", true, json!({})),
            change("playlist_tune", "PT1", false, json!({})),
            change("tune", "T1", false, json!({})),
            change("playlist", "P1", false, json!({})),
        ]);
        let names: Vec<(&str, bool)> = ordered
            .iter()
            .map(|c| (c.table.as_str(), c.deleted))
            .collect();
        assert_eq!(
            names,
            vec![
                ("tune", false),
                ("playlist", false),
                ("playlist_tune", false),
                ("practice_record", false),
                ("tune", true),
            ]
        );
    }

    #[test]
    fn test_order_for_apply_deletes_children_first() {
        let ordered = order_for_apply(vec![
            change("tune", "T1", true, json!({})),
            change("practice_record", "R1", true, json!({})),
            change("playlist", "P1", true, json!({})),
        ]);
        let names: Vec<&str> = ordered.iter().map(|c| c.table.as_str()).collect();
        assert_eq!(names, vec!["practice_record", "playlist", "tune"]);
    }

    #[test]
    fn test_apply_defers_fk_violation() {
        let db = PracticeDb::open_in_memory("device-a").unwrap();
        let info = get_table("playlist_tune").unwrap();
        let rec = change(
            "playlist_tune",
            r#"{"playlistRef":"P1","tuneRef":"T1"}"#,
            false,
            json!({
                "playlistRef": "P1",
                "tuneRef": "T1",
                "current": true,
                "lastModifiedAt": "2025-01-01T10:00:00.000Z"
            }),
        );
        assert_eq!(apply_change(&db, info, &rec).unwrap(), ApplyOutcome::Deferred);

        // Once the parents exist, the same change applies cleanly.
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        db.write_row(
            "playlist",
            obj(json!({"playlist_id": "P1", "user_ref": "u1"})),
        )
        .unwrap();
        assert_eq!(apply_change(&db, info, &rec).unwrap(), ApplyOutcome::Applied);
        let row = db
            .get_row(info, &obj(json!({"playlist_ref": "P1", "tune_ref": "T1"})))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("current"), Some(&json!(1)));
    }

    #[test]
    fn test_apply_unique_key_fallback_preserves_local_pk() {
        let db = PracticeDb::open_in_memory("device-b").unwrap();
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        db.write_row(
            "playlist",
            obj(json!({"playlist_id": "P1", "user_ref": "u1"})),
        )
        .unwrap();
        db.write_row(
            "practice_record",
            obj(json!({
                "id": "local-pr",
                "tune_ref": "T1",
                "playlist_ref": "P1",
                "practiced": "2025-01-01T09:00:00.000Z",
                "quality": "struggled",
                "last_modified_at": "2025-01-01T09:00:00.000Z"
            })),
        )
        .unwrap();

        let info = get_table("practice_record").unwrap();
        let rec = change(
            "practice_record",
            "remote-pr",
            false,
            json!({
                "id": "remote-pr",
                "tuneRef": "T1",
                "playlistRef": "P1",
                "practiced": "2025-01-01T09:00:00.000Z",
                "quality": "recalled",
                "lastModifiedAt": "2025-01-01T10:00:00.000Z"
            }),
        );
        assert_eq!(apply_change(&db, info, &rec).unwrap(), ApplyOutcome::Applied);
        // The business row took the remote data but kept the local id.
        let row = db
            .get_row(info, &obj(json!({"id": "local-pr"})))
            .unwrap()
            .unwrap();
        assert_eq!(row.get("quality"), Some(&json!("recalled")));
        assert!(db
            .get_row(info, &obj(json!({"id": "remote-pr"})))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_soft_deleted_row_not_resurrected_by_stale_write() {
        let db = PracticeDb::open_in_memory("device-b").unwrap();
        db.write_row(
            "note",
            obj(json!({
                "id": "N1",
                "user_ref": "u1",
                "note_text": "original",
                "last_modified_at": "2025-01-01T10:30:00.000Z"
            })),
        )
        .unwrap();
        db.soft_delete_row("note", &obj(json!({"id": "N1"}))).unwrap();
        // Deletion stamped `now`, far newer than the incoming edit below.

        let info = get_table("note").unwrap();
        let stale = change(
            "note",
            "N1",
            false,
            json!({
                "id": "N1",
                "userRef": "u1",
                "noteText": "stale edit",
                "deleted": false,
                "lastModifiedAt": "2025-01-01T10:30:00.000Z"
            }),
        );
        assert_eq!(
            apply_change(&db, info, &stale).unwrap(),
            ApplyOutcome::SkippedStale
        );
        let row = db.get_row(info, &obj(json!({"id": "N1"}))).unwrap().unwrap();
        assert_eq!(row.get("deleted"), Some(&json!(1)));
        assert_eq!(row.get("note_text"), Some(&json!("original")));
    }

    #[test]
    fn test_tombstone_deletes_locally() {
        let db = PracticeDb::open_in_memory("device-a").unwrap();
        db.write_row("tune", obj(json!({"id": "T1"}))).unwrap();
        db.write_row(
            "playlist",
            obj(json!({"playlist_id": "P1", "user_ref": "u1"})),
        )
        .unwrap();
        db.write_row(
            "daily_practice_queue",
            obj(json!({
                "id": "Q1",
                "user_ref": "u1",
                "playlist_ref": "P1",
                "tune_ref": "T1"
            })),
        )
        .unwrap();

        let info = get_table("daily_practice_queue").unwrap();
        let tombstone = change("daily_practice_queue", "Q1", true, json!({"id": "Q1"}));
        assert_eq!(
            apply_change(&db, info, &tombstone).unwrap(),
            ApplyOutcome::Applied
        );
        assert!(db
            .get_row(info, &obj(json!({"id": "Q1"})))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bad_key_is_skipped_not_fatal() {
        let db = PracticeDb::open_in_memory("device-a").unwrap();
        let info = get_table("table_state").unwrap();
        let rec = change("table_state", "{not json", true, json!({}));
        assert_eq!(
            apply_change(&db, info, &rec).unwrap(),
            ApplyOutcome::SkippedBadKey
        );
    }
}
