/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Answering pulls. Initial mode walks every table in registry order and
//! streams authorized live rows; incremental mode walks the change log
//! since the caller's watermark and resolves each entry against the live
//! row (or synthesizes a deleted marker when it is gone). Both paginate
//! with an opaque cursor anchored at `syncStartedAt`.

use crate::cursor::{self, Cursor, CursorMode};
use crate::db;
use crate::error::*;
use crate::push::row_authorized;
use crate::MediatorConfig;
use rusqlite::{named_params, params_from_iter, Connection};
use serde_json::Value;
use sql_support::{repeat_sql_vars, ConnExt};
use tunesync::{
    apply_normalize, get_table, snake_to_camel, tables_in_sync_order, Casing, ChangeRecord,
    JsonMap, OwnerFilter, PullOverrides, SyncRequest, TableInfo,
};
use types::Timestamp;

const DEFAULT_PAGE_SIZE: u32 = 200;

pub(crate) struct PullOutcome {
    pub changes: Vec<ChangeRecord>,
    pub next_cursor: Option<String>,
    pub debug: Vec<String>,
}

pub(crate) fn pull(
    conn: &Connection,
    user: &str,
    request: &SyncRequest,
    started_at: &str,
    config: &MediatorConfig,
) -> Result<PullOutcome> {
    let page_size = request
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, config.max_page_size) as usize;
    let overrides = request.overrides.clone().unwrap_or_default();

    match request.pull_cursor.as_deref() {
        Some(token) => {
            let cur = cursor::decode(token)?;
            match cur.mode {
                CursorMode::Initial => {
                    initial_pull(conn, user, started_at, page_size, &overrides, Some(cur))
                }
                CursorMode::Incremental => {
                    incremental_pull(conn, user, started_at, page_size, &overrides, Some(cur))
                }
            }
        }
        None => match request.last_sync_at.clone() {
            Some(last_sync) => {
                let seed = Cursor {
                    mode: CursorMode::Incremental,
                    started_at: started_at.to_string(),
                    table: None,
                    offset: 0,
                    last_sync_at: Some(last_sync),
                    changed_at: None,
                    row_id: None,
                };
                incremental_pull(conn, user, started_at, page_size, &overrides, Some(seed))
            }
            None => initial_pull(conn, user, started_at, page_size, &overrides, None),
        },
    }
}

fn table_allowed(overrides: &PullOverrides, name: &str) -> bool {
    match &overrides.pull_tables {
        Some(wanted) => wanted.iter().any(|t| t == name),
        None => true,
    }
}

/// Coerce a stored row to its wire form: declared booleans become real
/// booleans, declared timestamps get normalized, and the table's normalizer
/// runs.
fn wire_coerce(info: &TableInfo, row: &mut JsonMap) {
    let mut bool_cols: Vec<String> = info
        .boolean_columns
        .iter()
        .map(|c| snake_to_camel(c))
        .collect();
    if info.has_deleted_flag {
        bool_cols.push("deleted".to_string());
    }
    for col in bool_cols {
        if let Some(Value::Number(n)) = row.get(&col) {
            let flag = n.as_i64().unwrap_or(0) != 0;
            row.insert(col, Value::Bool(flag));
        }
    }
    for col in info.timestamp_columns {
        let camel = snake_to_camel(col);
        if let Some(Value::String(s)) = row.get(&camel) {
            let normalized = Timestamp::normalize_rfc3339(s);
            row.insert(camel, Value::String(normalized));
        }
    }
    apply_normalize(info, row);
}

fn live_row_change(
    info: &TableInfo,
    mut row: JsonMap,
    fallback_lma: Option<String>,
) -> Result<ChangeRecord> {
    wire_coerce(info, &mut row);
    let last_modified_at = row
        .get("lastModifiedAt")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(fallback_lma);
    let row_id = info.build_row_id(&row, Casing::Wire)?;
    Ok(ChangeRecord {
        table: info.name.to_string(),
        row_id,
        data: row,
        deleted: false,
        last_modified_at,
    })
}

fn select_initial_rows(
    conn: &Connection,
    user: &str,
    info: &TableInfo,
    overrides: &PullOverrides,
    limit: usize,
    offset: u32,
) -> Result<Vec<JsonMap>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    match info.owner {
        OwnerFilter::None => {}
        OwnerFilter::Column(col) => {
            clauses.push(format!("{} = ?", snake_to_camel(col)));
            params.push(rusqlite::types::Value::Text(user.to_string()));
        }
        OwnerFilter::PublicOrColumn(col) => {
            let camel = snake_to_camel(col);
            clauses.push(format!("({} IS NULL OR {} = ?)", camel, camel));
            params.push(rusqlite::types::Value::Text(user.to_string()));
        }
        OwnerFilter::Playlist(col) => {
            clauses.push(format!(
                "{} IN (SELECT playlistId FROM playlist WHERE userRef = ?)",
                snake_to_camel(col)
            ));
            params.push(rusqlite::types::Value::Text(user.to_string()));
        }
    }
    if info.has_deleted_flag {
        // An empty client has no deletions to reconcile.
        clauses.push("deleted = 0".to_string());
    }
    if info.name == "tune" {
        if let Some(genres) = &overrides.genre_filter {
            if !genres.is_empty() {
                clauses.push(format!("genre IN ({})", repeat_sql_vars(genres.len())));
                for genre in genres {
                    params.push(rusqlite::types::Value::Text(genre.clone()));
                }
            }
        }
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let order_by = db::wire_pk_columns(info).join(", ");
    params.push(rusqlite::types::Value::Integer(limit as i64));
    params.push(rusqlite::types::Value::Integer(i64::from(offset)));
    conn.query_rows_and_then(
        &format!(
            "SELECT * FROM {} {} ORDER BY {} LIMIT ? OFFSET ?",
            info.name, where_sql, order_by
        ),
        params_from_iter(params),
        |row| db::row_to_json(row),
    )
}

fn initial_pull(
    conn: &Connection,
    user: &str,
    started_at: &str,
    page_size: usize,
    overrides: &PullOverrides,
    cur: Option<Cursor>,
) -> Result<PullOutcome> {
    let tables: Vec<&'static TableInfo> = tables_in_sync_order()
        .into_iter()
        .filter(|info| table_allowed(overrides, info.name))
        .collect();
    let mut idx = 0usize;
    let mut offset = 0u32;
    if let Some(cur) = &cur {
        if let Some(resume_table) = &cur.table {
            // A table missing from the set (say the overrides changed
            // between pages) just means we are past it.
            idx = tables
                .iter()
                .position(|info| info.name == resume_table)
                .unwrap_or(tables.len());
            offset = cur.offset;
        }
    }

    let mut changes: Vec<ChangeRecord> = Vec::new();
    while idx < tables.len() {
        let info = tables[idx];
        let want = page_size - changes.len();
        if want == 0 {
            break;
        }
        let rows = select_initial_rows(conn, user, info, overrides, want + 1, offset)?;
        let table_has_more = rows.len() > want;
        for row in rows.into_iter().take(want) {
            changes.push(live_row_change(info, row, None)?);
        }
        if table_has_more {
            let next = Cursor {
                mode: CursorMode::Initial,
                started_at: started_at.to_string(),
                table: Some(info.name.to_string()),
                offset: offset + want as u32,
                last_sync_at: None,
                changed_at: None,
                row_id: None,
            };
            return Ok(PullOutcome {
                changes,
                next_cursor: Some(cursor::encode(&next)?),
                debug: vec![],
            });
        }
        idx += 1;
        offset = 0;
    }

    let next_cursor = if idx < tables.len() {
        // The page filled exactly at a table boundary.
        let next = Cursor {
            mode: CursorMode::Initial,
            started_at: started_at.to_string(),
            table: Some(tables[idx].name.to_string()),
            offset,
            last_sync_at: None,
            changed_at: None,
            row_id: None,
        };
        Some(cursor::encode(&next)?)
    } else {
        None
    };
    Ok(PullOutcome {
        changes,
        next_cursor,
        debug: vec![],
    })
}

fn incremental_pull(
    conn: &Connection,
    user: &str,
    started_at: &str,
    page_size: usize,
    overrides: &PullOverrides,
    cur: Option<Cursor>,
) -> Result<PullOutcome> {
    let cur = cur.ok_or(Error::InvalidCursor)?;
    let last_sync = cur.last_sync_at.clone().unwrap_or_default();
    let keyset_changed = cur.changed_at.clone().unwrap_or_default();
    let keyset_table = cur.table.clone().unwrap_or_default();
    let keyset_row = cur.row_id.clone().unwrap_or_default();

    let mut entries: Vec<(String, String, String)> = conn.query_rows_and_then(
        "SELECT table_name, row_id, MAX(changed_at) AS changed_at
         FROM sync_change_log
         WHERE changed_at > :last_sync AND changed_at <= :started_at
         GROUP BY table_name, row_id
         HAVING MAX(changed_at) > :keyset_changed
             OR (MAX(changed_at) = :keyset_changed
                 AND (table_name > :keyset_table
                      OR (table_name = :keyset_table AND row_id > :keyset_row)))
         ORDER BY changed_at, table_name, row_id
         LIMIT :limit",
        named_params! {
            ":last_sync": last_sync,
            ":started_at": started_at,
            ":keyset_changed": keyset_changed,
            ":keyset_table": keyset_table,
            ":keyset_row": keyset_row,
            ":limit": (page_size + 1) as i64,
        },
        |row| {
            Ok::<_, Error>((
                row.get::<_, String>("table_name")?,
                row.get::<_, String>("row_id")?,
                row.get::<_, String>("changed_at")?,
            ))
        },
    )?;
    let has_more = entries.len() > page_size;
    entries.truncate(page_size);

    let now = Timestamp::now().as_rfc3339();
    let mut changes: Vec<ChangeRecord> = Vec::new();
    let mut debug: Vec<String> = Vec::new();
    for (table, row_id, changed_at) in &entries {
        // The log is stateless apart from this per-caller consumption stamp.
        conn.execute_cached(
            "UPDATE sync_change_log SET synced_at = :now
             WHERE table_name = :table AND row_id = :row_id AND changed_at <= :started_at",
            named_params! {
                ":now": now,
                ":table": table,
                ":row_id": row_id,
                ":started_at": started_at,
            },
        )?;
        let info = match get_table(table) {
            Ok(info) => info,
            Err(_) => {
                debug.push(format!("change log references unknown table {}", table));
                continue;
            }
        };
        if !info.supports_incremental || !table_allowed(overrides, table) {
            continue;
        }
        let pk = match info.parse_row_id(row_id, Casing::Wire) {
            Ok(pk) => pk,
            Err(_) => {
                debug.push(format!("unparseable row id {:?} for {}", row_id, table));
                continue;
            }
        };
        match db::get_row(conn, info, &pk)? {
            Some(row) => {
                if !row_authorized(conn, user, info, &row)? {
                    // Not this user's row; drop silently.
                    continue;
                }
                changes.push(live_row_change(info, row, Some(changed_at.clone()))?);
            }
            None => {
                // The live row is gone: synthesize a deleted marker so the
                // client can reconcile the hard delete.
                changes.push(ChangeRecord {
                    table: table.clone(),
                    row_id: row_id.clone(),
                    data: pk,
                    deleted: true,
                    last_modified_at: Some(changed_at.clone()),
                });
            }
        }
    }

    let next_cursor = match (has_more, entries.last()) {
        (true, Some((table, row_id, changed_at))) => {
            let next = Cursor {
                mode: CursorMode::Incremental,
                started_at: started_at.to_string(),
                table: Some(table.clone()),
                offset: 0,
                last_sync_at: Some(last_sync),
                changed_at: Some(changed_at.clone()),
                row_id: Some(row_id.clone()),
            };
            Some(cursor::encode(&next)?)
        }
        _ => None,
    };
    Ok(PullOutcome {
        changes,
        next_cursor,
        debug,
    })
}
