/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The table-metadata registry: the single declarative source of truth for
//! what the sync machinery knows about every table. The client store derives
//! its change-capture triggers and apply order from this; the mediator
//! derives conflict targets, authorization filters and pull order from the
//! very same declarations.

use crate::casing::snake_to_camel;
use crate::{Error, JsonMap, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Primary key of a table: one column, or an ordered tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKey(pub &'static [&'static str]);

impl PrimaryKey {
    #[inline]
    pub fn columns(&self) -> &'static [&'static str] {
        self.0
    }

    #[inline]
    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }
}

/// How rows of a table are scoped to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerFilter {
    /// Reference data: no owner, visible to everyone, read-only to clients.
    None,
    /// A direct owner column; a row is visible to exactly that user.
    Column(&'static str),
    /// An owner column where NULL means public (`private_for` /
    /// `private_to_user`).
    PublicOrColumn(&'static str),
    /// Owned transitively through the named playlist-reference column.
    Playlist(&'static str),
}

/// Coarse grouping surfaced to the UI layer when a sync cycle reports which
/// kinds of data changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCategory {
    Reference,
    Repertoire,
    Organization,
    Practice,
    Annotations,
    Preferences,
}

impl ChangeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeCategory::Reference => "reference",
            ChangeCategory::Repertoire => "repertoire",
            ChangeCategory::Organization => "organization",
            ChangeCategory::Practice => "practice",
            ChangeCategory::Annotations => "annotations",
            ChangeCategory::Preferences => "preferences",
        }
    }
}

/// Which side's field names a row is spelled in. The client store speaks
/// snake_case, the wire and the central store speak camelCase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Casing {
    Local,
    Wire,
}

/// Everything the sync machinery needs to know about one table.
pub struct TableInfo {
    pub name: &'static str,
    pub primary_key: PrimaryKey,
    /// Natural unique keys distinct from the PK, in preference order. Used
    /// as the fallback conflict target on upsert.
    pub unique_keys: &'static [&'static [&'static str]],
    /// Columns holding RFC3339 instants, normalized on both sides.
    pub timestamp_columns: &'static [&'static str],
    /// Columns stored as 0/1 integers locally and native booleans on the
    /// wire. The `deleted` flag is handled implicitly.
    pub boolean_columns: &'static [&'static str],
    pub supports_incremental: bool,
    pub has_deleted_flag: bool,
    pub change_category: ChangeCategory,
    pub owner: OwnerFilter,
    /// Total dependency order: every FK points from a higher number to a
    /// lower one. Inserts/updates apply ascending, deletes descending.
    pub sync_order: u32,
    /// Optional per-row normalization, applied before rows go on the wire.
    pub normalize: Option<fn(&mut JsonMap)>,
}

impl TableInfo {
    /// Reference data is read-only to clients; everything else gets
    /// change-capture triggers.
    #[inline]
    pub fn is_user_modifiable(&self) -> bool {
        !matches!(self.owner, OwnerFilter::None)
    }

    /// The preferred upsert conflict target: the first natural unique key if
    /// one is declared, else the primary key.
    pub fn conflict_target(&self) -> &'static [&'static str] {
        self.unique_keys
            .first()
            .copied()
            .unwrap_or_else(|| self.primary_key.columns())
    }

    /// True when `column` takes the integer<->boolean coercion, including
    /// the soft-delete flag.
    pub fn is_boolean_column(&self, column: &str) -> bool {
        (self.has_deleted_flag && column == "deleted")
            || self.boolean_columns.iter().any(|c| *c == column)
    }

    pub fn is_timestamp_column(&self, column: &str) -> bool {
        self.timestamp_columns.iter().any(|c| *c == column)
    }

    fn key_name(&self, column: &'static str, casing: Casing) -> String {
        match casing {
            Casing::Local => column.to_string(),
            Casing::Wire => snake_to_camel(column),
        }
    }

    /// Encode a row's primary key as a row id: the bare value for a simple
    /// PK, or a compact JSON object with keys in declared PK order for a
    /// composite one. The composite encoding is byte-identical to what the
    /// change-capture triggers produce with `json_object()`.
    pub fn build_row_id(&self, row: &JsonMap, casing: Casing) -> Result<String> {
        let cols = self.primary_key.columns();
        if !self.primary_key.is_composite() {
            let key = self.key_name(cols[0], casing);
            let value = row.get(&key).ok_or(Error::MissingKey {
                table: self.name,
                column: cols[0],
            })?;
            return match value {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(Error::MissingKey {
                    table: self.name,
                    column: cols[0],
                }),
            };
        }
        let mut id = JsonMap::new();
        for &col in cols {
            let key = self.key_name(col, casing);
            let value = row.get(&key).ok_or(Error::MissingKey {
                table: self.name,
                column: col,
            })?;
            id.insert(key, value.clone());
        }
        Ok(serde_json::to_string(&Value::Object(id))?)
    }

    /// Invert `build_row_id`: a map of PK columns (in the requested casing)
    /// to values. Errors when a composite id is not valid JSON or misses a
    /// key column.
    pub fn parse_row_id(&self, row_id: &str, casing: Casing) -> Result<JsonMap> {
        let cols = self.primary_key.columns();
        if !self.primary_key.is_composite() {
            let mut map = JsonMap::new();
            map.insert(
                self.key_name(cols[0], casing),
                Value::String(row_id.to_string()),
            );
            return Ok(map);
        }
        let parsed: Value = serde_json::from_str(row_id).map_err(|_| Error::MalformedRowId {
            table: self.name,
            row_id: row_id.to_string(),
        })?;
        let obj = match parsed {
            Value::Object(map) => map,
            _ => {
                return Err(Error::MalformedRowId {
                    table: self.name,
                    row_id: row_id.to_string(),
                })
            }
        };
        let mut map = JsonMap::new();
        for &col in cols {
            let key = self.key_name(col, casing);
            let value = obj.get(&key).ok_or(Error::MissingKey {
                table: self.name,
                column: col,
            })?;
            map.insert(key, value.clone());
        }
        Ok(map)
    }
}

fn normalize_tune(row: &mut JsonMap) {
    if let Some(Value::String(genre)) = row.get("genre") {
        let lowered = genre.to_lowercase();
        if &lowered != genre {
            row.insert("genre".to_string(), Value::String(lowered));
        }
    }
}

fn normalize_reference(row: &mut JsonMap) {
    if let Some(Value::String(url)) = row.get("url") {
        let trimmed = url.trim();
        if trimmed != url {
            let trimmed = trimmed.to_string();
            row.insert("url".to_string(), Value::String(trimmed));
        }
    }
}

static TABLES: &[TableInfo] = &[
    // Reference data, visible to everyone, pulled eagerly on first sync.
    TableInfo {
        name: "genre",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &[],
        boolean_columns: &[],
        supports_incremental: false,
        has_deleted_flag: false,
        change_category: ChangeCategory::Reference,
        owner: OwnerFilter::None,
        sync_order: 0,
        normalize: None,
    },
    TableInfo {
        name: "instrument",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &[],
        boolean_columns: &[],
        supports_incremental: false,
        has_deleted_flag: false,
        change_category: ChangeCategory::Reference,
        owner: OwnerFilter::None,
        sync_order: 0,
        normalize: None,
    },
    TableInfo {
        name: "tune_type",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &[],
        boolean_columns: &[],
        supports_incremental: false,
        has_deleted_flag: false,
        change_category: ChangeCategory::Reference,
        owner: OwnerFilter::None,
        sync_order: 0,
        normalize: None,
    },
    TableInfo {
        name: "genre_tune_type",
        primary_key: PrimaryKey(&["genre_id", "tune_type_id"]),
        unique_keys: &[],
        timestamp_columns: &[],
        boolean_columns: &[],
        supports_incremental: false,
        has_deleted_flag: false,
        change_category: ChangeCategory::Reference,
        owner: OwnerFilter::None,
        // After the two taxonomies it joins.
        sync_order: 5,
        normalize: None,
    },
    // The repertoire itself.
    TableInfo {
        name: "tune",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Repertoire,
        owner: OwnerFilter::PublicOrColumn("private_for"),
        sync_order: 10,
        normalize: Some(normalize_tune),
    },
    TableInfo {
        name: "playlist",
        primary_key: PrimaryKey(&["playlist_id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Organization,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 20,
        normalize: None,
    },
    TableInfo {
        name: "tune_override",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[&["tune_ref", "user_ref"]],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Repertoire,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 20,
        normalize: None,
    },
    TableInfo {
        name: "user_annotation_set",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[&["tune_ref", "user_ref"]],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Annotations,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 20,
        normalize: None,
    },
    TableInfo {
        name: "playlist_tune",
        primary_key: PrimaryKey(&["playlist_ref", "tune_ref"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &["current", "learning"],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Organization,
        owner: OwnerFilter::Playlist("playlist_ref"),
        sync_order: 30,
        normalize: None,
    },
    TableInfo {
        name: "note",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &["created_at", "last_modified_at"],
        boolean_columns: &["public", "favorite"],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Annotations,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 30,
        normalize: None,
    },
    TableInfo {
        name: "reference",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &["created_at", "last_modified_at"],
        boolean_columns: &["public", "favorite"],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Annotations,
        owner: OwnerFilter::PublicOrColumn("private_to_user"),
        sync_order: 30,
        normalize: Some(normalize_reference),
    },
    TableInfo {
        name: "tag",
        primary_key: PrimaryKey(&["tag_id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Annotations,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 30,
        normalize: None,
    },
    TableInfo {
        name: "practice_record",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[&["tune_ref", "playlist_ref", "practiced"]],
        timestamp_columns: &["practiced", "review_date", "last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: true,
        change_category: ChangeCategory::Practice,
        owner: OwnerFilter::Playlist("playlist_ref"),
        sync_order: 40,
        normalize: None,
    },
    TableInfo {
        name: "daily_practice_queue",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &["queue_date", "last_modified_at"],
        boolean_columns: &["completed"],
        supports_incremental: true,
        // Queue rows are snapshots; stale ones are hard-deleted.
        has_deleted_flag: false,
        change_category: ChangeCategory::Practice,
        owner: OwnerFilter::Column("user_ref"),
        sync_order: 40,
        normalize: None,
    },
    TableInfo {
        name: "prefs_spaced_repetition",
        primary_key: PrimaryKey(&["user_id", "alg_type"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: false,
        change_category: ChangeCategory::Preferences,
        owner: OwnerFilter::Column("user_id"),
        sync_order: 50,
        normalize: None,
    },
    TableInfo {
        name: "prefs_scheduling_options",
        primary_key: PrimaryKey(&["user_id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: false,
        change_category: ChangeCategory::Preferences,
        owner: OwnerFilter::Column("user_id"),
        sync_order: 50,
        normalize: None,
    },
    TableInfo {
        name: "table_state",
        primary_key: PrimaryKey(&["user_id", "screen_size", "purpose", "playlist_id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: false,
        change_category: ChangeCategory::Preferences,
        owner: OwnerFilter::Column("user_id"),
        sync_order: 50,
        normalize: None,
    },
    TableInfo {
        name: "table_transient_data",
        primary_key: PrimaryKey(&["user_id", "tune_id", "playlist_id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: false,
        change_category: ChangeCategory::Preferences,
        owner: OwnerFilter::Column("user_id"),
        sync_order: 50,
        normalize: None,
    },
    TableInfo {
        name: "tab_group_main_state",
        primary_key: PrimaryKey(&["id"]),
        unique_keys: &[],
        timestamp_columns: &["last_modified_at"],
        boolean_columns: &[],
        supports_incremental: true,
        has_deleted_flag: false,
        change_category: ChangeCategory::Preferences,
        owner: OwnerFilter::Column("user_id"),
        sync_order: 50,
        normalize: None,
    },
];

lazy_static::lazy_static! {
    static ref REGISTRY: HashMap<&'static str, &'static TableInfo> =
        TABLES.iter().map(|t| (t.name, t)).collect();
}

/// Look a table up by name.
pub fn get_table(name: &str) -> Result<&'static TableInfo> {
    REGISTRY
        .get(name)
        .copied()
        .ok_or_else(|| Error::UnknownTable(name.to_string()))
}

/// Every registered table, parents before children (`sync_order` ascending,
/// name as tiebreak so the order is total and stable).
pub fn tables_in_sync_order() -> Vec<&'static TableInfo> {
    let mut tables: Vec<&'static TableInfo> = TABLES.iter().collect();
    tables.sort_by_key(|t| (t.sync_order, t.name));
    tables
}

/// The tables clients may write, and therefore the ones that get
/// change-capture triggers and outbox entries.
pub fn user_modifiable_tables() -> Vec<&'static TableInfo> {
    tables_in_sync_order()
        .into_iter()
        .filter(|t| t.is_user_modifiable())
        .collect()
}
