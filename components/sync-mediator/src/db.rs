/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Row plumbing for the central store: JSON <-> SQL value conversion and the
//! dynamic upsert/select builders push and pull share. Rows here are always
//! in the wire casing.

use crate::error::*;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::Value;
use sql_support::ConnExt;
use tunesync::{snake_to_camel, Error as CoreError, JsonMap, TableInfo};

pub(crate) fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

pub(crate) fn row_to_json(row: &Row<'_>) -> Result<JsonMap> {
    let stmt = row.as_ref();
    let mut map = JsonMap::new();
    for i in 0..stmt.column_count() {
        let name = stmt.column_name(i)?.to_string();
        map.insert(name, value_ref_to_json(row.get_ref(i)?));
    }
    Ok(map)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    conn.query_rows_and_then(&format!("PRAGMA table_info({})", table), [], |row| {
        Ok::<_, Error>(row.get::<_, String>("name")?)
    })
}

/// The primary-key columns of a table, in the wire casing.
pub(crate) fn wire_pk_columns(info: &TableInfo) -> Vec<String> {
    info.primary_key
        .columns()
        .iter()
        .map(|c| snake_to_camel(c))
        .collect()
}

pub(crate) fn pk_where(info: &TableInfo, row: &JsonMap) -> Result<(String, Vec<rusqlite::types::Value>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for (&snake, camel) in info
        .primary_key
        .columns()
        .iter()
        .zip(wire_pk_columns(info))
    {
        let value = row.get(&camel).ok_or(CoreError::MissingKey {
            table: info.name,
            column: snake,
        })?;
        clauses.push(format!("{} = ?", camel));
        params.push(json_to_sql(value));
    }
    Ok((clauses.join(" AND "), params))
}

pub(crate) fn get_row(
    conn: &Connection,
    info: &TableInfo,
    pk: &JsonMap,
) -> Result<Option<JsonMap>> {
    let (where_sql, params) = pk_where(info, pk)?;
    conn.try_query_row(
        &format!("SELECT * FROM {} WHERE {}", info.name, where_sql),
        params_from_iter(params),
        |row| row_to_json(row),
    )
}

/// Last-write-wins upsert: insert, or update the conflicting row only when
/// the incoming `lastModifiedAt` is strictly newer. When the table declares
/// a natural unique key it is the primary conflict target (the business
/// identity devices converge under); the synthetic PK gets its own clause so
/// id-level retries stay idempotent too. PK columns are never updated.
pub(crate) fn lww_upsert(conn: &Connection, info: &TableInfo, row: &JsonMap) -> Result<usize> {
    let table_cols = table_columns(conn, info.name)?;
    let pairs: Vec<(&String, &Value)> = row
        .iter()
        .filter(|(k, _)| table_cols.iter().any(|c| c == *k))
        .collect();
    let pk_cols = wire_pk_columns(info);
    for col in &pk_cols {
        if !pairs.iter().any(|(k, _)| *k == col) {
            return Err(CoreError::MissingKey {
                table: info.name,
                column: info.primary_key.columns()[0],
            }
            .into());
        }
    }

    let mut conflict_clauses = Vec::new();
    let mut push_clause = |target: Vec<String>| {
        let assignments = pairs
            .iter()
            .map(|(k, _)| (*k).clone())
            .filter(|c| !target.contains(c) && !pk_cols.contains(c))
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect::<Vec<_>>()
            .join(", ");
        let action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!(
                "DO UPDATE SET {} WHERE excluded.lastModifiedAt > COALESCE({}.lastModifiedAt, '')",
                assignments, info.name
            )
        };
        conflict_clauses.push(format!("ON CONFLICT({}) {}", target.join(", "), action));
    };
    if let Some(natural) = info.unique_keys.first() {
        push_clause(natural.iter().map(|c| snake_to_camel(c)).collect());
    }
    push_clause(pk_cols.clone());

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) {}",
        info.name,
        pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        sql_support::repeat_sql_vars(pairs.len()),
        conflict_clauses.join(" "),
    );
    let n = conn.execute(
        &sql,
        params_from_iter(pairs.iter().map(|(_, v)| json_to_sql(v))),
    )?;
    Ok(n)
}
