/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The driver for one sync cycle: drain the outbox, push, apply the pull
//! page by page under trigger suppression, backfill, advance the watermark.

use super::apply::{self, ApplyOutcome};
use super::transport::{SyncTransport, TransportError};
use super::{SyncCycleResult, SyncEngineConfig, SyncErrorInfo, SyncErrorKind, TableSet};
use crate::db::PracticeDb;
use crate::outbox::{OutboxEntry, OutboxOp};
use crate::store::PracticeStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tunesync::{
    apply_normalize, get_table, to_remote, Casing, ChangeRecord, SyncRequest, SCHEMA_VERSION,
};
use types::Timestamp;

const MAX_FK_RETRY_PASSES: u32 = 3;

pub struct SyncEngine {
    store: Arc<PracticeStore>,
    transport: Box<dyn SyncTransport>,
    user_id: String,
    device_id: String,
    config: SyncEngineConfig,
}

fn storage(e: crate::Error) -> SyncErrorInfo {
    SyncErrorInfo::new(SyncErrorKind::Storage, e.to_string())
}

fn transport_failure(e: TransportError) -> SyncErrorInfo {
    let kind = match e {
        TransportError::Unauthorized => SyncErrorKind::Auth,
        TransportError::Malformed(_) => SyncErrorKind::Protocol,
        _ => SyncErrorKind::Transport,
    };
    SyncErrorInfo::new(kind, e.to_string())
}

impl SyncEngine {
    pub fn new(
        store: Arc<PracticeStore>,
        transport: Box<dyn SyncTransport>,
        user_id: &str,
        device_id: &str,
    ) -> Self {
        Self::with_config(store, transport, user_id, device_id, SyncEngineConfig::default())
    }

    pub fn with_config(
        store: Arc<PracticeStore>,
        transport: Box<dyn SyncTransport>,
        user_id: &str,
        device_id: &str,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            config,
        }
    }

    fn watermark_key(&self) -> String {
        format!("TT_LAST_SYNC_TIMESTAMP_{}", self.user_id)
    }

    /// The watermark as currently persisted, mostly for diagnostics.
    pub fn last_sync_at(&self) -> Option<String> {
        self.store
            .lock_db()
            .get_meta(&self.watermark_key())
            .unwrap_or(None)
    }

    /// Run one cycle. Overlapping calls serialize; errors surface in the
    /// result, never as a panic or Err.
    pub fn sync(&self) -> SyncCycleResult {
        let _in_flight = self.store.sync_lock().lock();
        let mut result = SyncCycleResult::new();
        match self.run_cycle(&mut result) {
            Ok(()) => result.success = true,
            Err(info) => {
                log::warn!("sync cycle aborted: {}", info.message);
                result.errors.push(info);
                result.success = false;
            }
        }
        result
    }

    fn run_cycle(&self, result: &mut SyncCycleResult) -> Result<(), SyncErrorInfo> {
        let scope = self.store.lock_db().begin_interrupt_scope();
        let key = self.watermark_key();

        // Step 1: initial vs incremental.
        let (watermark, initial) = {
            let db = self.store.lock_db();
            let watermark: Option<String> = db.get_meta(&key).map_err(storage)?;
            let empty = db.is_store_empty().map_err(storage)?;
            if watermark.is_none() && !empty {
                log::warn!("watermark missing but local data present; running an initial pull");
            }
            if watermark.is_some() && empty {
                log::info!("local store is empty; promoting to an initial pull");
            }
            (watermark.clone(), watermark.is_none() || empty)
        };

        // Step 2: pending outbox, dependency-ordered.
        interrupt_check(&scope)?;
        let pending = self
            .store
            .lock_db()
            .get_pending(self.config.batch_size)
            .map_err(storage)?;
        let ordered = apply::order_for_push(pending);

        // Step 3: the push payload.
        let mut changes: Vec<ChangeRecord> = Vec::with_capacity(ordered.len());
        let mut pushed: Vec<(OutboxEntry, String)> = Vec::with_capacity(ordered.len());
        {
            let db = self.store.lock_db();
            for entry in ordered {
                match self.stage_entry(&db, &entry, result).map_err(storage)? {
                    Some(record) => {
                        db.mark_in_progress(&entry.id).map_err(storage)?;
                        pushed.push((entry, record.row_id.clone()));
                        changes.push(record);
                    }
                    None => continue,
                }
            }
        }

        // Step 4: the mediator round trip.
        interrupt_check(&scope)?;
        let request = SyncRequest {
            changes,
            last_sync_at: if initial { None } else { watermark.clone() },
            schema_version: SCHEMA_VERSION,
            pull_cursor: None,
            sync_started_at: None,
            page_size: Some(self.config.page_size),
            overrides: self.config.pull_overrides.clone(),
        };
        let mut resp = match self.transport.round_trip(&request) {
            Ok(resp) => resp,
            Err(e) => {
                // No state change: the same entries go out next cycle.
                let _ = self.store.lock_db().requeue_in_progress();
                return Err(transport_failure(e));
            }
        };
        if let Some(message) = resp.error.clone() {
            let _ = self.store.lock_db().requeue_in_progress();
            return Err(SyncErrorInfo::new(SyncErrorKind::Protocol, message));
        }

        // The push is durable server-side now; settle the outbox.
        let rejected: HashMap<(String, String), String> = resp
            .failed
            .iter()
            .map(|f| ((f.table.clone(), f.row_id.clone()), f.error.clone()))
            .collect();
        {
            let db = self.store.lock_db();
            for (entry, wire_row_id) in &pushed {
                let key = (entry.table_name.clone(), wire_row_id.clone());
                match rejected.get(&key) {
                    Some(message) => {
                        result.items_failed += 1;
                        let attempts = entry.attempts + 1;
                        if attempts >= i64::from(self.config.max_retries) {
                            db.mark_permanently_failed(&entry.id, message)
                                .map_err(storage)?;
                            result.errors.push(SyncErrorInfo::for_row(
                                SyncErrorKind::Push,
                                &entry.table_name,
                                &entry.row_id,
                                message.clone(),
                            ));
                        } else {
                            db.mark_failed(&entry.id, message, attempts).map_err(storage)?;
                        }
                    }
                    None => {
                        db.mark_completed(&entry.id).map_err(storage)?;
                        result.items_synced += 1;
                        result.record_table(&entry.table_name);
                    }
                }
            }
        }

        // Step 5: apply the pull, page by page.
        let sync_started_at = resp.sync_started_at.clone();
        let mut synced_at = resp.synced_at.clone();
        let mut paginated = false;
        let mut deferred: Vec<ChangeRecord> = Vec::new();
        loop {
            interrupt_check(&scope)?;
            let page = std::mem::take(&mut resp.changes);
            self.apply_page(page, &mut deferred, result)?;
            match resp.next_cursor.take() {
                Some(cursor) => {
                    paginated = true;
                    let page_request = SyncRequest {
                        changes: Vec::new(),
                        last_sync_at: if initial { None } else { watermark.clone() },
                        schema_version: SCHEMA_VERSION,
                        pull_cursor: Some(cursor),
                        sync_started_at: sync_started_at.clone(),
                        page_size: Some(self.config.page_size),
                        overrides: self.config.pull_overrides.clone(),
                    };
                    resp = self
                        .transport
                        .round_trip(&page_request)
                        .map_err(transport_failure)?;
                    if let Some(message) = resp.error.clone() {
                        return Err(SyncErrorInfo::new(SyncErrorKind::Protocol, message));
                    }
                    synced_at = resp.synced_at.clone();
                }
                None => break,
            }
        }
        for change in &deferred {
            result.items_failed += 1;
            result.errors.push(SyncErrorInfo::for_row(
                SyncErrorKind::Apply,
                &change.table,
                &change.row_id,
                "foreign key violation not resolved within this cycle",
            ));
        }

        // Step 6: advance the watermark. Initial and paginated cycles anchor
        // on syncStartedAt so the next incremental pull covers rows that
        // changed while we were paginating; a single-page incremental cycle
        // can take the commit instant.
        let candidate = if initial || paginated {
            sync_started_at.unwrap_or_else(|| synced_at.clone())
        } else {
            synced_at
        };
        if !candidate.is_empty() {
            let db = self.store.lock_db();
            let advance = match &watermark {
                Some(old) => candidate.as_str() > old.as_str(),
                None => true,
            };
            if advance {
                db.put_meta(&key, &candidate).map_err(storage)?;
            }
        }
        Ok(())
    }

    /// Turn one outbox entry into a wire change, or None when it should not
    /// go out this cycle (suppressed deletes, vanished rows, bad metadata).
    fn stage_entry(
        &self,
        db: &PracticeDb,
        entry: &OutboxEntry,
        result: &mut SyncCycleResult,
    ) -> crate::error::Result<Option<ChangeRecord>> {
        let info = match get_table(&entry.table_name) {
            Ok(info) => info,
            Err(e) => {
                // Nothing will ever accept this entry; park it.
                db.mark_permanently_failed(&entry.id, &e.to_string())?;
                result.errors.push(SyncErrorInfo::for_row(
                    SyncErrorKind::Protocol,
                    &entry.table_name,
                    &entry.row_id,
                    e.to_string(),
                ));
                return Ok(None);
            }
        };
        let local_pk = match info.parse_row_id(&entry.row_id, Casing::Local) {
            Ok(pk) => pk,
            Err(e) => {
                db.mark_permanently_failed(&entry.id, &e.to_string())?;
                result.errors.push(SyncErrorInfo::for_row(
                    SyncErrorKind::Protocol,
                    &entry.table_name,
                    &entry.row_id,
                    e.to_string(),
                ));
                return Ok(None);
            }
        };
        match entry.operation {
            OutboxOp::Delete => {
                if !self.config.allow_deletes {
                    log::debug!(
                        "delete propagation disabled; leaving {} {} pending",
                        entry.table_name,
                        entry.row_id
                    );
                    return Ok(None);
                }
                let wire_pk = to_remote(info, &local_pk);
                let row_id = info.build_row_id(&wire_pk, Casing::Wire)?;
                Ok(Some(ChangeRecord {
                    table: entry.table_name.clone(),
                    row_id,
                    data: wire_pk,
                    deleted: true,
                    last_modified_at: Some(entry.changed_at.clone()),
                }))
            }
            OutboxOp::Insert | OutboxOp::Update => {
                let row = match db.get_row(info, &local_pk)? {
                    Some(row) => row,
                    None => {
                        // The row vanished since the trigger fired (e.g. a
                        // later hard delete with its own entry); obsolete.
                        db.mark_completed(&entry.id)?;
                        return Ok(None);
                    }
                };
                let mut wire = to_remote(info, &row);
                apply_normalize(info, &mut wire);
                if !matches!(wire.get("lastModifiedAt"), Some(Value::String(_))) {
                    wire.insert(
                        "lastModifiedAt".to_string(),
                        Value::String(entry.changed_at.clone()),
                    );
                }
                let last_modified_at = wire
                    .get("lastModifiedAt")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let row_id = info.build_row_id(&wire, Casing::Wire)?;
                Ok(Some(ChangeRecord {
                    table: entry.table_name.clone(),
                    row_id,
                    data: wire,
                    deleted: false,
                    last_modified_at,
                }))
            }
        }
    }

    /// Apply one pulled page: suppress the triggers, apply in dependency
    /// order, resume, backfill the outbox for the suppression window, then
    /// run the FK retry passes.
    fn apply_page(
        &self,
        page: Vec<ChangeRecord>,
        deferred: &mut Vec<ChangeRecord>,
        result: &mut SyncCycleResult,
    ) -> Result<(), SyncErrorInfo> {
        if page.is_empty() && deferred.is_empty() {
            return Ok(());
        }
        let db = self.store.lock_db();
        let t_suppress = Timestamp::now().as_rfc3339();
        let mut page_tables = TableSet::new();
        let ordered = apply::order_for_apply(page);

        db.suppress_triggers().map_err(storage)?;
        let applied: crate::error::Result<()> = (|| {
            for change in &ordered {
                self.apply_one(&db, change, deferred, &mut page_tables, result)?;
            }
            for _pass in 0..MAX_FK_RETRY_PASSES {
                if deferred.is_empty() {
                    break;
                }
                let retry = std::mem::take(deferred);
                let before = retry.len();
                for change in &retry {
                    self.apply_one(&db, change, deferred, &mut page_tables, result)?;
                }
                if deferred.len() >= before {
                    break;
                }
            }
            Ok(())
        })();
        // The suppression window must close even when the apply failed.
        let resumed = db.resume_triggers();
        applied.map_err(storage)?;
        resumed.map_err(storage)?;

        if !page_tables.is_empty() {
            let tables: Vec<String> = page_tables.into_iter().collect();
            if let Err(e) = db.backfill_since(&t_suppress, Some(tables.as_slice()), &self.device_id) {
                log::warn!("outbox backfill failed: {}", e);
                result
                    .errors
                    .push(SyncErrorInfo::new(SyncErrorKind::Backfill, e.to_string()));
            }
        }
        Ok(())
    }

    fn apply_one(
        &self,
        db: &PracticeDb,
        change: &ChangeRecord,
        deferred: &mut Vec<ChangeRecord>,
        page_tables: &mut TableSet,
        result: &mut SyncCycleResult,
    ) -> crate::error::Result<()> {
        let info = match get_table(&change.table) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("pull returned unknown table {:?}; skipping", change.table);
                result.errors.push(SyncErrorInfo::for_row(
                    SyncErrorKind::Protocol,
                    &change.table,
                    &change.row_id,
                    e.to_string(),
                ));
                return Ok(());
            }
        };
        page_tables.insert(change.table.clone());
        match apply::apply_change(db, info, change)? {
            ApplyOutcome::Applied => {
                result.items_synced += 1;
                result.record_table(&change.table);
            }
            ApplyOutcome::AppliedWithConflict => {
                result.items_synced += 1;
                result.conflicts += 1;
                result.record_table(&change.table);
            }
            ApplyOutcome::SkippedStale => {
                result.conflicts += 1;
            }
            ApplyOutcome::SkippedBadKey => {
                log::warn!(
                    "change for {} has unusable key {:?}; skipping",
                    change.table,
                    change.row_id
                );
            }
            ApplyOutcome::Deferred => {
                deferred.push(change.clone());
            }
        }
        Ok(())
    }
}

fn interrupt_check(scope: &interrupt_support::SqlInterruptScope) -> Result<(), SyncErrorInfo> {
    use interrupt_support::Interruptee;
    scope
        .err_if_interrupted()
        .map_err(|e| SyncErrorInfo::new(SyncErrorKind::Storage, e.to_string()))
}
