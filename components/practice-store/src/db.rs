/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client database handle. Rows cross this boundary as
//! `serde_json::Map`s in the client casing (snake_case fields, 0/1
//! booleans); the conversion to and from SQL values is centralized here so
//! that every caller reads and writes rows the same way.

use crate::error::*;
use crate::schema;
use crate::triggers;
use interrupt_support::{SqlInterruptHandle, SqlInterruptScope};
use rusqlite::types::ValueRef;
use rusqlite::{named_params, params_from_iter, Connection, Row};
use serde_json::Value;
use sql_support::open_database::{open_database, open_memory_database};
use sql_support::ConnExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tunesync::{get_table, tables_in_sync_order, Casing, Error as CoreError, JsonMap, TableInfo};
use types::Timestamp;

pub struct PracticeDb {
    pub db: Connection,
    device_id: String,
    interrupt_handle: Arc<SqlInterruptHandle>,
    // PRAGMA table_info results, per table.
    column_cache: RefCell<HashMap<String, Arc<Vec<String>>>>,
}

impl PracticeDb {
    fn init(db: Connection, device_id: &str) -> Result<Self> {
        db.pragma_update(None, "foreign_keys", true)?;
        triggers::install(&db)?;
        Ok(Self {
            interrupt_handle: Arc::new(SqlInterruptHandle::new(&db)),
            db,
            device_id: device_id.to_string(),
            column_cache: RefCell::new(HashMap::new()),
        })
    }

    pub fn open(path: impl AsRef<Path>, device_id: &str) -> Result<Self> {
        let db = open_database(path, &schema::migration_logic())?;
        Self::init(db, device_id)
    }

    pub fn open_in_memory(device_id: &str) -> Result<Self> {
        let db = open_memory_database(&schema::migration_logic())?;
        Self::init(db, device_id)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn new_interrupt_handle(&self) -> Arc<SqlInterruptHandle> {
        Arc::clone(&self.interrupt_handle)
    }

    #[inline]
    pub fn begin_interrupt_scope(&self) -> SqlInterruptScope {
        self.interrupt_handle.begin_interrupt_scope()
    }
}

impl ConnExt for PracticeDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl Deref for PracticeDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}

// Key/value metadata, notably the per-user watermark.
impl PracticeDb {
    pub fn put_meta(&self, key: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
        self.execute_cached(
            "REPLACE INTO sync_meta (key, value) VALUES (:key, :value)",
            named_params! { ":key": key, ":value": value },
        )?;
        Ok(())
    }

    pub fn get_meta<T: rusqlite::types::FromSql>(&self, key: &str) -> Result<Option<T>> {
        self.try_query_row(
            "SELECT value FROM sync_meta WHERE key = :key",
            named_params! { ":key": key },
            |row| Ok::<_, Error>(row.get(0)?),
        )
    }

    pub fn delete_meta(&self, key: &str) -> Result<()> {
        self.execute_cached(
            "DELETE FROM sync_meta WHERE key = :key",
            named_params! { ":key": key },
        )?;
        Ok(())
    }
}

// Trigger suppression; the engine holds these as short as the apply loop
// allows, and backfills the outbox for anything written in the window.
impl PracticeDb {
    pub fn suppress_triggers(&self) -> Result<()> {
        triggers::suppress(&self.db)
    }

    pub fn resume_triggers(&self) -> Result<()> {
        triggers::resume(&self.db)
    }

    pub fn triggers_suppressed(&self) -> Result<bool> {
        triggers::is_suppressed(&self.db)
    }
}

// Row-level access. Everything here is keyed and idempotent, which is what
// makes interleaving with UI writes safe.
impl PracticeDb {
    fn table_columns(&self, table: &str) -> Result<Arc<Vec<String>>> {
        if let Some(cols) = self.column_cache.borrow().get(table) {
            return Ok(Arc::clone(cols));
        }
        let cols: Vec<String> = self.query_rows_and_then(
            &format!("PRAGMA table_info({})", table),
            [],
            |row| Ok::<_, Error>(row.get::<_, String>("name")?),
        )?;
        let cols = Arc::new(cols);
        self.column_cache
            .borrow_mut()
            .insert(table.to_string(), Arc::clone(&cols));
        Ok(cols)
    }

    /// Collect the primary-key columns of `row` into their own map.
    pub(crate) fn pk_of(info: &TableInfo, row: &JsonMap) -> Result<JsonMap> {
        let mut pk = JsonMap::new();
        for &col in info.primary_key.columns() {
            let value = row.get(col).ok_or(CoreError::MissingKey {
                table: info.name,
                column: col,
            })?;
            pk.insert(col.to_string(), value.clone());
        }
        Ok(pk)
    }

    fn pk_where(info: &TableInfo, pk: &JsonMap) -> Result<(String, Vec<rusqlite::types::Value>)> {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for &col in info.primary_key.columns() {
            let value = pk.get(col).ok_or(CoreError::MissingKey {
                table: info.name,
                column: col,
            })?;
            clauses.push(format!("{} = ?", col));
            params.push(json_to_sql(value));
        }
        Ok((clauses.join(" AND "), params))
    }

    pub fn get_row(&self, info: &TableInfo, pk: &JsonMap) -> Result<Option<JsonMap>> {
        let (where_sql, params) = Self::pk_where(info, pk)?;
        self.try_query_row(
            &format!("SELECT * FROM {} WHERE {}", info.name, where_sql),
            params_from_iter(params),
            |row| row_to_json(row),
        )
    }

    /// Insert-or-update `row` against the given conflict target.
    /// `omit_from_update` supports the natural-unique-key fallback, which
    /// deliberately leaves the local synthetic PK untouched.
    pub(crate) fn upsert_row(
        &self,
        info: &TableInfo,
        row: &JsonMap,
        conflict_cols: &[&str],
        omit_from_update: &[&str],
    ) -> Result<()> {
        let table_cols = self.table_columns(info.name)?;
        let pairs: Vec<(&String, &Value)> = row
            .iter()
            .filter(|(k, _)| table_cols.iter().any(|c| c == *k))
            .collect();
        for &col in info.primary_key.columns() {
            if !pairs.iter().any(|(k, _)| k.as_str() == col) {
                return Err(CoreError::MissingKey {
                    table: info.name,
                    column: col,
                }
                .into());
            }
        }
        let col_list = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let update_assignments = pairs
            .iter()
            .map(|(k, _)| k.as_str())
            .filter(|c| !conflict_cols.contains(c) && !omit_from_update.contains(c))
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict_action = if update_assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", update_assignments)
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            info.name,
            col_list,
            sql_support::repeat_sql_vars(pairs.len()),
            conflict_cols.join(", "),
            conflict_action,
        );
        self.db.execute(
            &sql,
            params_from_iter(pairs.iter().map(|(_, v)| json_to_sql(v))),
        )?;
        Ok(())
    }

    pub fn delete_row_by_pk(&self, info: &TableInfo, pk: &JsonMap) -> Result<usize> {
        let (where_sql, params) = Self::pk_where(info, pk)?;
        let n = self.db.execute(
            &format!("DELETE FROM {} WHERE {}", info.name, where_sql),
            params_from_iter(params),
        )?;
        Ok(n)
    }

    /// A local application write: stamps the sync columns (bumping
    /// `sync_version`, refreshing `last_modified_at` unless the caller set
    /// one, recording this device) and upserts by primary key. Runs with the
    /// change-capture triggers live, so it lands in the outbox. Returns the
    /// row id.
    pub fn write_row(&self, table: &str, mut data: JsonMap) -> Result<String> {
        let info = get_table(table)?;
        if !matches!(data.get("last_modified_at"), Some(Value::String(_))) {
            data.insert(
                "last_modified_at".to_string(),
                Value::String(Timestamp::now().as_rfc3339()),
            );
        }
        if !matches!(data.get("device_id"), Some(Value::String(_))) {
            data.insert(
                "device_id".to_string(),
                Value::String(self.device_id.clone()),
            );
        }
        let pk = Self::pk_of(info, &data)?;
        let version = self
            .get_row(info, &pk)?
            .and_then(|existing| existing.get("sync_version").and_then(Value::as_i64))
            .unwrap_or(0)
            + 1;
        data.insert("sync_version".to_string(), Value::Number(version.into()));
        self.upsert_row(info, &data, info.primary_key.columns(), &[])?;
        Ok(info.build_row_id(&data, Casing::Local)?)
    }

    /// Soft-delete: an update that sets the flag and advances
    /// `last_modified_at`, so delayed peers observe the deletion. Tables
    /// without the flag fall through to a hard delete.
    pub fn soft_delete_row(&self, table: &str, pk: &JsonMap) -> Result<()> {
        let info = get_table(table)?;
        if !info.has_deleted_flag {
            self.delete_row_by_pk(info, pk)?;
            return Ok(());
        }
        let (where_sql, params) = Self::pk_where(info, pk)?;
        let now = Timestamp::now().as_rfc3339();
        let mut all_params = vec![
            rusqlite::types::Value::Text(now),
            rusqlite::types::Value::Text(self.device_id.clone()),
        ];
        all_params.extend(params);
        self.db.execute(
            &format!(
                "UPDATE {} SET deleted = 1, last_modified_at = ?, device_id = ?,
                        sync_version = sync_version + 1
                 WHERE {}",
                info.name, where_sql
            ),
            params_from_iter(all_params),
        )?;
        Ok(())
    }

    /// Hard-delete by primary key, through the registry.
    pub fn delete_row(&self, table: &str, pk: &JsonMap) -> Result<()> {
        let info = get_table(table)?;
        self.delete_row_by_pk(info, pk)?;
        Ok(())
    }

    /// True when no registered table holds any row; used to distinguish an
    /// initial sync from an incremental one.
    pub fn is_store_empty(&self) -> Result<bool> {
        for info in tables_in_sync_order() {
            let any: i64 =
                self.query_scalar(&format!("SELECT EXISTS (SELECT 1 FROM {})", info.name))?;
            if any != 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

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
        // Structured values are stored as their JSON text.
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
        // We never store blobs in syncable tables.
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
