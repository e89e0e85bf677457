/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Applying pushed changes to the central store. Each change is checked
//! against the registry and the caller's identity, then applied with
//! last-write-wins semantics; a change the mediator won't apply is reported
//! back per-item instead of failing the whole request, so one poisoned
//! entry can't wedge a client's queue.

use crate::db;
use crate::error::*;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tunesync::{
    get_table, snake_to_camel, Casing, ChangeRecord, FailedChange, JsonMap, OwnerFilter, TableInfo,
};
use types::Timestamp;

pub(crate) struct PushOutcome {
    pub applied: u32,
    pub failed: Vec<FailedChange>,
    pub debug: Vec<String>,
}

pub(crate) fn apply_changes(
    conn: &Connection,
    user: &str,
    changes: &[ChangeRecord],
) -> Result<PushOutcome> {
    let mut outcome = PushOutcome {
        applied: 0,
        failed: Vec::new(),
        debug: Vec::new(),
    };
    for change in changes {
        match apply_one(conn, user, change) {
            Ok(()) => outcome.applied += 1,
            Err(reason) => {
                log::debug!(
                    "rejecting change {}/{}: {}",
                    change.table,
                    change.row_id,
                    reason
                );
                outcome.debug.push(format!(
                    "rejected {} {}: {}",
                    change.table, change.row_id, reason
                ));
                outcome.failed.push(FailedChange {
                    table: change.table.clone(),
                    row_id: change.row_id.clone(),
                    error: reason,
                });
            }
        }
    }
    Ok(outcome)
}

/// Apply one change, or explain why not. SQL-level failures become
/// rejections too; a single statement failing does not poison the
/// surrounding transaction.
fn apply_one(conn: &Connection, user: &str, change: &ChangeRecord) -> std::result::Result<(), String> {
    let info = get_table(&change.table).map_err(|e| e.to_string())?;
    if matches!(info.owner, OwnerFilter::None) {
        return Err("table is read-only".to_string());
    }
    let pk = info
        .parse_row_id(&change.row_id, Casing::Wire)
        .map_err(|e| e.to_string())?;

    if change.deleted {
        delete_row(conn, user, info, &pk, change)
    } else {
        upsert_row(conn, user, info, &pk, change)
    }
}

fn delete_row(
    conn: &Connection,
    user: &str,
    info: &TableInfo,
    pk: &JsonMap,
    change: &ChangeRecord,
) -> std::result::Result<(), String> {
    let existing = match db::get_row(conn, info, pk).map_err(|e| e.to_string())? {
        Some(row) => row,
        // Nothing to delete: retries and deletes of never-synced rows are
        // fine.
        None => return Ok(()),
    };
    if !row_authorized(conn, user, info, &existing).map_err(|e| e.to_string())? {
        return Err(format!("row in {} belongs to another user", info.name));
    }
    let ts = change
        .last_modified_at
        .clone()
        .unwrap_or_else(|| Timestamp::now().as_rfc3339());
    let (where_sql, pk_params) = db::pk_where(info, pk).map_err(|e| e.to_string())?;
    // A delete is still subject to last-write-wins: a stale tombstone must
    // not take out a row a newer write already replaced.
    let result = if info.has_deleted_flag {
        let mut params = vec![rusqlite::types::Value::Text(ts.clone())];
        params.extend(pk_params);
        params.push(rusqlite::types::Value::Text(ts));
        conn.execute(
            &format!(
                "UPDATE {} SET deleted = 1, lastModifiedAt = ?, syncVersion = syncVersion + 1
                 WHERE {} AND COALESCE(lastModifiedAt, '') < ?",
                info.name, where_sql
            ),
            params_from_iter(params),
        )
    } else {
        let mut params = pk_params;
        params.push(rusqlite::types::Value::Text(ts));
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} AND COALESCE(lastModifiedAt, '') < ?",
                info.name, where_sql
            ),
            params_from_iter(params),
        )
    };
    result.map_err(|e| e.to_string())?;
    Ok(())
}

fn upsert_row(
    conn: &Connection,
    user: &str,
    info: &TableInfo,
    pk: &JsonMap,
    change: &ChangeRecord,
) -> std::result::Result<(), String> {
    let mut data = change.data.clone();
    // The key columns and ordering timestamp must be present even when the
    // client sent a sparse payload.
    for (key, value) in pk {
        data.entry(key.clone()).or_insert_with(|| value.clone());
    }
    if !matches!(data.get("lastModifiedAt"), Some(Value::String(_))) {
        match &change.last_modified_at {
            Some(ts) => {
                data.insert("lastModifiedAt".to_string(), Value::String(ts.clone()));
            }
            None => return Err("change carries no lastModifiedAt".to_string()),
        }
    }
    for col in info.timestamp_columns {
        let camel = snake_to_camel(col);
        if let Some(Value::String(s)) = data.get(&camel) {
            let normalized = Timestamp::normalize_rfc3339(s);
            data.insert(camel, Value::String(normalized));
        }
    }

    // The write must belong to the caller, both as pushed and as stored.
    data_authorized(conn, user, info, &data)?;
    if let Some(existing) = db::get_row(conn, info, &data).map_err(|e| e.to_string())? {
        if !row_authorized(conn, user, info, &existing).map_err(|e| e.to_string())? {
            return Err(format!("row in {} belongs to another user", info.name));
        }
    }

    db::lww_upsert(conn, info, &data).map_err(|e| e.to_string())?;
    Ok(())
}

/// Does the pushed payload itself claim the caller as owner?
fn data_authorized(
    conn: &Connection,
    user: &str,
    info: &TableInfo,
    data: &JsonMap,
) -> std::result::Result<(), String> {
    match info.owner {
        OwnerFilter::None => Err("table is read-only".to_string()),
        OwnerFilter::Column(col) => {
            let camel = snake_to_camel(col);
            match data.get(&camel).and_then(Value::as_str) {
                Some(owner) if owner == user => Ok(()),
                _ => Err(format!("{} must be the authenticated user", camel)),
            }
        }
        OwnerFilter::PublicOrColumn(col) => {
            let camel = snake_to_camel(col);
            match data.get(&camel) {
                None | Some(Value::Null) => Ok(()),
                Some(Value::String(owner)) if owner == user => Ok(()),
                _ => Err(format!("{} must be null or the authenticated user", camel)),
            }
        }
        OwnerFilter::Playlist(col) => {
            let camel = snake_to_camel(col);
            let playlist = data
                .get(&camel)
                .and_then(Value::as_str)
                .ok_or_else(|| format!("{} missing", camel))?;
            match playlist_owner(conn, playlist).map_err(|e| e.to_string())? {
                Some(owner) if owner == user => Ok(()),
                Some(_) => Err("playlist belongs to another user".to_string()),
                None => Err("unknown playlist".to_string()),
            }
        }
    }
}

/// Is a stored row visible to / owned by the caller?
pub(crate) fn row_authorized(
    conn: &Connection,
    user: &str,
    info: &TableInfo,
    row: &JsonMap,
) -> Result<bool> {
    Ok(match info.owner {
        OwnerFilter::None => true,
        OwnerFilter::Column(col) => {
            row.get(&snake_to_camel(col)).and_then(Value::as_str) == Some(user)
        }
        OwnerFilter::PublicOrColumn(col) => match row.get(&snake_to_camel(col)) {
            None | Some(Value::Null) => true,
            Some(Value::String(owner)) => owner == user,
            _ => false,
        },
        OwnerFilter::Playlist(col) => {
            match row.get(&snake_to_camel(col)).and_then(Value::as_str) {
                Some(playlist) => playlist_owner(conn, playlist)?.as_deref() == Some(user),
                None => false,
            }
        }
    })
}

pub(crate) fn playlist_owner(conn: &Connection, playlist_id: &str) -> Result<Option<String>> {
    use sql_support::ConnExt;
    conn.try_query_row(
        "SELECT userRef FROM playlist WHERE playlistId = :id",
        rusqlite::named_params! { ":id": playlist_id },
        |row| Ok::<_, Error>(row.get(0)?),
    )
}
