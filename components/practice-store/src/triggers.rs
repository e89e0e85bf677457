/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Change capture: one AFTER INSERT / AFTER UPDATE / AFTER DELETE trigger per
//! user-modifiable table, each appending an outbox row. The triggers live in
//! the temp schema (so they see `temp.sync_suppress`) and are reinstalled on
//! every connection open; installation is drop-and-recreate, so it is
//! idempotent.
//!
//! The outbox insert is part of the user's write transaction: if it fails,
//! the write fails. That is what makes "every committed write has an outbox
//! entry" structural rather than a convention.

use crate::error::*;
use rusqlite::Connection;
use sql_support::ConnExt;
use tunesync::{user_modifiable_tables, TableInfo};

/// The strftime format producing our canonical RFC3339 text.
const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// SQL expression for a row's id, per the row-id codec: the bare PK value,
/// or `json_object()` with keys in declared PK order. `prefix` is `NEW`,
/// `OLD`, or a table alias.
pub(crate) fn row_id_expr(info: &TableInfo, prefix: &str) -> String {
    let cols = info.primary_key.columns();
    if !info.primary_key.is_composite() {
        return format!("{}.{}", prefix, cols[0]);
    }
    let args = cols
        .iter()
        .map(|c| format!("'{}', {}.{}", c, prefix, c))
        .collect::<Vec<_>>()
        .join(", ");
    format!("json_object({})", args)
}

fn outbox_insert_sql(info: &TableInfo, op: &str, row_ref: &str) -> String {
    let changed_at = match op {
        "DELETE" => SQL_NOW.to_string(),
        _ => format!("COALESCE({}.last_modified_at, {})", row_ref, SQL_NOW),
    };
    format!(
        "INSERT INTO sync_outbox (id, table_name, row_id, operation, status, changed_at, attempts)
         VALUES (lower(hex(randomblob(16))), '{table}', {row_id}, '{op}', 'pending', {changed_at}, 0);",
        table = info.name,
        row_id = row_id_expr(info, row_ref),
        op = op,
        changed_at = changed_at,
    )
}

fn trigger_sql(info: &TableInfo, event: &str, row_ref: &str) -> String {
    let name = format!("{}_sync_after{}", info.name, event.to_lowercase());
    format!(
        "DROP TRIGGER IF EXISTS {name};
         CREATE TEMP TRIGGER {name}
         AFTER {event} ON {table} FOR EACH ROW
         WHEN NOT EXISTS (SELECT 1 FROM temp.sync_suppress)
         BEGIN
             {body}
         END;",
        name = name,
        event = event,
        table = info.name,
        body = outbox_insert_sql(info, event, row_ref),
    )
}

/// Install (or reinstall) the change-capture triggers on this connection.
pub(crate) fn install(conn: &Connection) -> Result<()> {
    for info in user_modifiable_tables() {
        conn.execute_batch(&trigger_sql(info, "INSERT", "NEW"))?;
        conn.execute_batch(&trigger_sql(info, "UPDATE", "NEW"))?;
        conn.execute_batch(&trigger_sql(info, "DELETE", "OLD"))?;
    }
    Ok(())
}

/// Stop capturing changes on this connection. Idempotent.
pub(crate) fn suppress(conn: &Connection) -> Result<()> {
    conn.execute_cached(
        "INSERT INTO temp.sync_suppress (flag)
         SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM temp.sync_suppress)",
        [],
    )?;
    Ok(())
}

/// Resume capturing changes. Idempotent.
pub(crate) fn resume(conn: &Connection) -> Result<()> {
    conn.execute_cached("DELETE FROM temp.sync_suppress", [])?;
    Ok(())
}

pub(crate) fn is_suppressed(conn: &Connection) -> Result<bool> {
    let flagged: i64 = conn.query_scalar("SELECT COUNT(*) FROM temp.sync_suppress")?;
    Ok(flagged != 0)
}
