/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client sync engine: one `sync()` call is one push-then-pull cycle
//! against the mediator. Errors surface through the returned
//! `SyncCycleResult`; nothing escapes as a panic or a raw `Err`.

mod apply;
mod engine;
mod transport;

pub use engine::SyncEngine;
pub use transport::{HttpSyncTransport, SyncTransport, TransportError};

use std::collections::BTreeSet;
use types::Timestamp;

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Max outbox entries pushed per cycle.
    pub batch_size: u32,
    /// Push attempts per entry before it is parked as failed.
    pub max_retries: u32,
    /// Transport timeout.
    pub timeout_ms: u64,
    /// When false, DELETE outbox entries are skipped in the push and stay
    /// pending. A safety valve for shells that want destructive propagation
    /// opt-in.
    pub allow_deletes: bool,
    /// Rows requested per pull page.
    pub page_size: u32,
    /// Optional narrowing hints sent with every pull (the mediator
    /// intersects them with its own authorization filters).
    pub pull_overrides: Option<tunesync::PullOverrides>,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            timeout_ms: 30_000,
            allow_deletes: true,
            page_size: 500,
            pull_overrides: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Network or timeout failure; the cycle aborted with no state change.
    Transport,
    /// The mediator rejected our token.
    Auth,
    /// Malformed response or unknown table; the offending change was
    /// skipped.
    Protocol,
    /// A pulled change could not be applied (residual FK violations after
    /// the retry passes).
    Apply,
    /// A pushed change was permanently rejected by the mediator.
    Push,
    /// The post-apply outbox backfill failed; best effort, never fatal.
    Backfill,
    /// The local store failed underneath us.
    Storage,
}

#[derive(Debug, Clone)]
pub struct SyncErrorInfo {
    pub kind: SyncErrorKind,
    pub table: Option<String>,
    pub row_id: Option<String>,
    pub message: String,
}

impl SyncErrorInfo {
    pub(crate) fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            row_id: None,
            message: message.into(),
        }
    }

    pub(crate) fn for_row(
        kind: SyncErrorKind,
        table: &str,
        row_id: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            table: Some(table.to_string()),
            row_id: Some(row_id.to_string()),
            message: message.into(),
        }
    }
}

/// What one cycle did. `success` reflects whether the cycle ran to
/// completion; per-item failures show up in `items_failed` and `errors`
/// without flipping it.
#[derive(Debug, Clone)]
pub struct SyncCycleResult {
    pub success: bool,
    pub items_synced: u32,
    pub items_failed: u32,
    pub conflicts: u32,
    pub errors: Vec<SyncErrorInfo>,
    pub timestamp: String,
    pub affected_tables: Vec<String>,
}

impl SyncCycleResult {
    pub(crate) fn new() -> Self {
        Self {
            success: false,
            items_synced: 0,
            items_failed: 0,
            conflicts: 0,
            errors: Vec::new(),
            timestamp: Timestamp::now().as_rfc3339(),
            affected_tables: Vec::new(),
        }
    }

    pub(crate) fn record_table(&mut self, table: &str) {
        if !self.affected_tables.iter().any(|t| t == table) {
            self.affected_tables.push(table.to_string());
        }
    }
}

pub(crate) type TableSet = BTreeSet<String>;
