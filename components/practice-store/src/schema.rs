/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Client schema, version 1.
//!
//! Every user-modifiable table carries the three sync columns:
//!
//! - `sync_version`: monotone counter, bumped on every write. Recorded for
//!   future optimistic locking; nothing consults it yet.
//! - `last_modified_at`: RFC3339 UTC text, the authoritative ordering key.
//! - `device_id`: opaque id of the writer, diagnostics only.
//!
//! Soft-deletable tables additionally carry `deleted` (0/1). Two bookkeeping
//! tables sit alongside the data: `sync_outbox` (the durable change queue the
//! triggers append to) and `sync_meta` (key/value, notably the per-user
//! watermark).

use rusqlite::Connection;
use sql_support::open_database::{self, MigrationLogic};
use sql_support::ConnExt;

pub(crate) const VERSION: u32 = 1;

const SYNC_COLS_SQL: &str = "
    sync_version     INTEGER NOT NULL DEFAULT 1,
    last_modified_at TEXT,
    device_id        TEXT
";

lazy_static::lazy_static! {
    static ref CREATE_TABLES_SQL: String = format!(
        "
        -- Reference data: no sync columns, read-only to clients.
        CREATE TABLE IF NOT EXISTS genre (
            id          TEXT PRIMARY KEY NOT NULL,
            name        TEXT,
            region      TEXT,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS instrument (
            id          TEXT PRIMARY KEY NOT NULL,
            name        TEXT,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS tune_type (
            id          TEXT PRIMARY KEY NOT NULL,
            name        TEXT,
            rhythm      TEXT,
            description TEXT
        );

        CREATE TABLE IF NOT EXISTS genre_tune_type (
            genre_id     TEXT NOT NULL REFERENCES genre(id),
            tune_type_id TEXT NOT NULL REFERENCES tune_type(id),
            PRIMARY KEY (genre_id, tune_type_id)
        );

        -- The repertoire. private_for NULL means the tune is public.
        CREATE TABLE IF NOT EXISTS tune (
            id          TEXT PRIMARY KEY NOT NULL,
            title       TEXT,
            tune_type   TEXT,
            structure   TEXT,
            mode        TEXT,
            incipit     TEXT,
            genre       TEXT,
            private_for TEXT,
            deleted     INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS playlist (
            playlist_id    TEXT PRIMARY KEY NOT NULL,
            user_ref       TEXT NOT NULL,
            name           TEXT,
            instrument_ref TEXT,
            deleted        INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS tune_override (
            id        TEXT PRIMARY KEY NOT NULL,
            tune_ref  TEXT NOT NULL REFERENCES tune(id),
            user_ref  TEXT NOT NULL,
            title     TEXT,
            genre     TEXT,
            tune_type TEXT,
            deleted   INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tune_ref, user_ref)
        );

        CREATE TABLE IF NOT EXISTS user_annotation_set (
            id           TEXT PRIMARY KEY NOT NULL,
            tune_ref     TEXT NOT NULL REFERENCES tune(id),
            user_ref     TEXT NOT NULL,
            note_private TEXT,
            note_public  TEXT,
            tags         TEXT,
            deleted      INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tune_ref, user_ref)
        );

        CREATE TABLE IF NOT EXISTS playlist_tune (
            playlist_ref TEXT NOT NULL REFERENCES playlist(playlist_id),
            tune_ref     TEXT NOT NULL REFERENCES tune(id),
            current      INTEGER,
            learning     INTEGER,
            deleted      INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            PRIMARY KEY (playlist_ref, tune_ref)
        );

        CREATE TABLE IF NOT EXISTS note (
            id           TEXT PRIMARY KEY NOT NULL,
            user_ref     TEXT NOT NULL,
            tune_ref     TEXT REFERENCES tune(id),
            playlist_ref TEXT,
            created_at   TEXT,
            note_text    TEXT,
            public       INTEGER,
            favorite     INTEGER,
            deleted      INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        -- External links about a tune. private_to_user NULL means public.
        CREATE TABLE IF NOT EXISTS reference (
            id              TEXT PRIMARY KEY NOT NULL,
            tune_ref        TEXT REFERENCES tune(id),
            user_ref        TEXT,
            private_to_user TEXT,
            url             TEXT,
            ref_type        TEXT,
            title           TEXT,
            comment         TEXT,
            public          INTEGER,
            favorite        INTEGER,
            created_at      TEXT,
            deleted         INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS tag (
            tag_id   TEXT PRIMARY KEY NOT NULL,
            user_ref TEXT NOT NULL,
            tune_ref TEXT REFERENCES tune(id),
            tag_text TEXT,
            deleted  INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        -- One row per (tune, playlist, practice instant); the unique key is
        -- the business identity under which devices converge, the id is a
        -- synthetic key for cheap FKs.
        CREATE TABLE IF NOT EXISTS practice_record (
            id           TEXT PRIMARY KEY NOT NULL,
            playlist_ref TEXT NOT NULL REFERENCES playlist(playlist_id),
            tune_ref     TEXT NOT NULL REFERENCES tune(id),
            practiced    TEXT,
            quality      TEXT,
            easiness     REAL,
            interval     INTEGER,
            repetitions  INTEGER,
            review_date  TEXT,
            stability    REAL,
            elapsed_days INTEGER,
            lapses       INTEGER,
            state        INTEGER,
            deleted      INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tune_ref, playlist_ref, practiced)
        );

        -- Daily queue snapshots; stale rows are hard-deleted.
        CREATE TABLE IF NOT EXISTS daily_practice_queue (
            id           TEXT PRIMARY KEY NOT NULL,
            user_ref     TEXT NOT NULL,
            playlist_ref TEXT NOT NULL REFERENCES playlist(playlist_id),
            tune_ref     TEXT NOT NULL REFERENCES tune(id),
            queue_date   TEXT,
            bucket       INTEGER,
            sort_order   INTEGER,
            completed    INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS prefs_spaced_repetition (
            user_id           TEXT NOT NULL,
            alg_type          TEXT NOT NULL,
            fsrs_weights      TEXT,
            request_retention REAL,
            maximum_interval  INTEGER,
            {sync_cols},
            PRIMARY KEY (user_id, alg_type)
        );

        CREATE TABLE IF NOT EXISTS prefs_scheduling_options (
            user_id                       TEXT PRIMARY KEY NOT NULL,
            acceptable_delinquency_window INTEGER,
            min_reviews_per_day           INTEGER,
            max_reviews_per_day           INTEGER,
            days_per_week                 INTEGER,
            weekly_rules                  TEXT,
            exceptions                    TEXT,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS table_state (
            user_id      TEXT NOT NULL,
            screen_size  TEXT NOT NULL,
            purpose      TEXT NOT NULL,
            playlist_id  TEXT NOT NULL,
            settings     TEXT,
            current_tune TEXT,
            {sync_cols},
            PRIMARY KEY (user_id, screen_size, purpose, playlist_id)
        );

        CREATE TABLE IF NOT EXISTS table_transient_data (
            user_id      TEXT NOT NULL,
            tune_id      TEXT NOT NULL,
            playlist_id  TEXT NOT NULL,
            purpose      TEXT,
            note_private TEXT,
            note_public  TEXT,
            recall_eval  TEXT,
            {sync_cols},
            PRIMARY KEY (user_id, tune_id, playlist_id)
        );

        CREATE TABLE IF NOT EXISTS tab_group_main_state (
            id          TEXT PRIMARY KEY NOT NULL,
            user_id     TEXT NOT NULL,
            which_tab   TEXT,
            playlist_id TEXT,
            tab_spec    TEXT,
            {sync_cols}
        );
        ",
        sync_cols = SYNC_COLS_SQL
    );
}

const CREATE_OUTBOX_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_outbox (
        id         TEXT PRIMARY KEY NOT NULL,
        table_name TEXT NOT NULL,
        row_id     TEXT NOT NULL,
        operation  TEXT NOT NULL,
        status     TEXT NOT NULL DEFAULT 'pending',
        changed_at TEXT NOT NULL,
        attempts   INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        synced_at  TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sync_outbox_status_changed
        ON sync_outbox(status, changed_at);

    CREATE INDEX IF NOT EXISTS idx_sync_outbox_table_row
        ON sync_outbox(table_name, row_id);
";

const CREATE_META_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_meta (
        key   TEXT PRIMARY KEY,
        value NOT NULL
    )
";

fn init(db: &Connection) -> open_database::Result<()> {
    log::debug!("Creating client schema");
    db.execute_all(&[&CREATE_TABLES_SQL, CREATE_OUTBOX_SQL, CREATE_META_TABLE_SQL])?;
    Ok(())
}

/// Runs on every open, after init/upgrades: the suppression flag table lives
/// in the temp schema, so it (and the triggers that consult it) must be
/// recreated per connection.
fn finish(db: &Connection) -> open_database::Result<()> {
    db.execute_batch("CREATE TEMP TABLE IF NOT EXISTS sync_suppress (flag INTEGER NOT NULL)")?;
    Ok(())
}

pub(crate) fn migration_logic() -> MigrationLogic {
    MigrationLogic {
        name: "practice-store".to_string(),
        start_version: 1,
        end_version: VERSION,
        prepare: None,
        init,
        upgrades: vec![],
        finish: Some(finish),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PracticeDb;
    use sql_support::ConnExt;

    #[test]
    fn test_create_schema() {
        let db = PracticeDb::open_in_memory("device-1").unwrap();
        let version: u32 = db.query_scalar("PRAGMA user_version").unwrap();
        assert_eq!(version, VERSION);
        // Every registered table must actually exist.
        for info in tunesync::tables_in_sync_order() {
            let count: i64 = db
                .query_scalar(&format!("SELECT COUNT(*) FROM {}", info.name))
                .unwrap();
            assert_eq!(count, 0, "table {} missing or unreadable", info.name);
        }
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = PracticeDb::open_in_memory("device-1").unwrap();
        let err = db.execute_cached(
            "INSERT INTO playlist_tune (playlist_ref, tune_ref, last_modified_at)
             VALUES ('nope', 'nothere', '2025-01-01T00:00:00.000Z')",
            [],
        );
        assert!(err.is_err());
    }
}
