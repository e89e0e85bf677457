/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

//! The sync mediator: the stateless endpoint between clients and the central
//! store. One request is one transaction: the push is applied, the pull is
//! answered out of the change log, and both commit together so pushed writes
//! are visible to the pull.

pub mod auth;
mod cursor;
mod db;
mod error;
mod pull;
mod push;
pub mod schema;
mod service;

pub use error::*;
pub use service::{router, AppState};

use sql_support::ConnExt;
use tunesync::{SyncRequest, SyncResponse, SCHEMA_VERSION};
use types::Timestamp;

#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Symmetric secret the bearer tokens are verified against.
    pub auth_secret: String,
    /// Hard ceiling on `pageSize`; requests above it are clamped.
    pub max_page_size: u32,
}

impl MediatorConfig {
    pub fn new(auth_secret: &str) -> Self {
        Self {
            auth_secret: auth_secret.to_string(),
            max_page_size: 500,
        }
    }
}

/// Apply one sync request for an authenticated user, in one transaction.
pub fn apply_sync(
    conn: &rusqlite::Connection,
    user: &str,
    request: &SyncRequest,
    config: &MediatorConfig,
) -> Result<SyncResponse> {
    if request.schema_version > SCHEMA_VERSION {
        // A client from the future; refuse rather than misinterpret.
        return Ok(SyncResponse {
            changes: vec![],
            synced_at: Timestamp::now().as_rfc3339(),
            sync_started_at: None,
            next_cursor: None,
            failed: vec![],
            error: Some(format!(
                "unsupported schema version {} (server speaks {})",
                request.schema_version, SCHEMA_VERSION
            )),
            debug: vec![],
        });
    }

    let tx = conn.unchecked_transaction_imm()?;

    // The snapshot anchor: fixed on the first page, carried by the cursor
    // afterwards.
    let started_at = match cursor::started_at_of(request.pull_cursor.as_deref())? {
        Some(anchor) => anchor,
        None => Timestamp::now().as_rfc3339(),
    };

    let push = push::apply_changes(&tx, user, &request.changes)?;
    let pull = pull::pull(&tx, user, request, &started_at, config)?;

    let synced_at = Timestamp::now().as_rfc3339();
    tx.commit()?;

    log::debug!(
        "sync for {}: pushed {} (rejected {}), pulled {}, more={}",
        user,
        push.applied,
        push.failed.len(),
        pull.changes.len(),
        pull.next_cursor.is_some(),
    );
    let mut debug = push.debug;
    debug.extend(pull.debug);
    Ok(SyncResponse {
        changes: pull.changes,
        synced_at,
        sync_started_at: Some(started_at),
        next_cursor: pull.next_cursor,
        failed: push.failed,
        error: None,
        debug,
    })
}
