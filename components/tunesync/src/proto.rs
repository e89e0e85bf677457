/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The wire protocol spoken over `POST /api/sync`. Everything is camelCase
//! JSON; `row_id` follows the row-id codec in `tables` (bare value for a
//! simple PK, compact JSON object for a composite one).

use crate::JsonMap;
use serde::{Deserialize, Serialize};

/// Version of the table set + wire shape. Bumped together with schema
/// migrations that change what either side understands.
pub const SCHEMA_VERSION: u32 = 1;

/// One changed row, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub table: String,
    pub row_id: String,
    #[serde(default)]
    pub data: JsonMap,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOverrides {
    /// Narrow the pull to these tables (intersected with the registry; never
    /// widens authorization).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_tables: Option<Vec<String>>,
    /// Narrow the initial pull of `tune` to these genres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<PullOverrides>,
}

/// A pushed change the mediator would not apply. The client maps these back
/// onto outbox entries to drive retry accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedChange {
    pub table: String,
    pub row_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default)]
    pub changes: Vec<ChangeRecord>,
    pub synced_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug: Vec<String>,
}
