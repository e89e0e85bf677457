/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Central-store schema, version 1. Same tables as the client, spelled in
//! the wire casing (camelCase), plus `sync_change_log`, the append-only
//! list of `(table, row-id, changed_at)` maintained by triggers on every
//! incrementally synced table. The log is the only state incremental pulls
//! consult.
//!
//! Log `changed_at` is the *server* receipt instant, not the row's
//! `lastModifiedAt`: watermarks advance on the server clock, so pull windows
//! must be cut on the same clock regardless of how stale the pushing
//! client's own timestamps were.

use rusqlite::Connection;
use sql_support::open_database::{self, MigrationLogic};
use sql_support::ConnExt;
use tunesync::{snake_to_camel, tables_in_sync_order, TableInfo};

pub(crate) const VERSION: u32 = 1;

const SYNC_COLS_SQL: &str = "
    syncVersion    INTEGER NOT NULL DEFAULT 1,
    lastModifiedAt TEXT,
    deviceId       TEXT
";

lazy_static::lazy_static! {
    static ref CREATE_TABLES_SQL: String = format!(
        "
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
            genreId    TEXT NOT NULL REFERENCES genre(id),
            tuneTypeId TEXT NOT NULL REFERENCES tune_type(id),
            PRIMARY KEY (genreId, tuneTypeId)
        );

        CREATE TABLE IF NOT EXISTS tune (
            id         TEXT PRIMARY KEY NOT NULL,
            title      TEXT,
            tuneType   TEXT,
            structure  TEXT,
            mode       TEXT,
            incipit    TEXT,
            genre      TEXT,
            privateFor TEXT,
            deleted    INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS playlist (
            playlistId    TEXT PRIMARY KEY NOT NULL,
            userRef       TEXT NOT NULL,
            name          TEXT,
            instrumentRef TEXT,
            deleted       INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS tune_override (
            id       TEXT PRIMARY KEY NOT NULL,
            tuneRef  TEXT NOT NULL REFERENCES tune(id),
            userRef  TEXT NOT NULL,
            title    TEXT,
            genre    TEXT,
            tuneType TEXT,
            deleted  INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tuneRef, userRef)
        );

        CREATE TABLE IF NOT EXISTS user_annotation_set (
            id          TEXT PRIMARY KEY NOT NULL,
            tuneRef     TEXT NOT NULL REFERENCES tune(id),
            userRef     TEXT NOT NULL,
            notePrivate TEXT,
            notePublic  TEXT,
            tags        TEXT,
            deleted     INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tuneRef, userRef)
        );

        CREATE TABLE IF NOT EXISTS playlist_tune (
            playlistRef TEXT NOT NULL REFERENCES playlist(playlistId),
            tuneRef     TEXT NOT NULL REFERENCES tune(id),
            current     INTEGER,
            learning    INTEGER,
            deleted     INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            PRIMARY KEY (playlistRef, tuneRef)
        );

        CREATE TABLE IF NOT EXISTS note (
            id          TEXT PRIMARY KEY NOT NULL,
            userRef     TEXT NOT NULL,
            tuneRef     TEXT REFERENCES tune(id),
            playlistRef TEXT,
            createdAt   TEXT,
            noteText    TEXT,
            public      INTEGER,
            favorite    INTEGER,
            deleted     INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS reference (
            id            TEXT PRIMARY KEY NOT NULL,
            tuneRef       TEXT REFERENCES tune(id),
            userRef       TEXT,
            privateToUser TEXT,
            url           TEXT,
            refType       TEXT,
            title         TEXT,
            comment       TEXT,
            public        INTEGER,
            favorite      INTEGER,
            createdAt     TEXT,
            deleted       INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS tag (
            tagId   TEXT PRIMARY KEY NOT NULL,
            userRef TEXT NOT NULL,
            tuneRef TEXT REFERENCES tune(id),
            tagText TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS practice_record (
            id          TEXT PRIMARY KEY NOT NULL,
            playlistRef TEXT NOT NULL REFERENCES playlist(playlistId),
            tuneRef     TEXT NOT NULL REFERENCES tune(id),
            practiced   TEXT,
            quality     TEXT,
            easiness    REAL,
            interval    INTEGER,
            repetitions INTEGER,
            reviewDate  TEXT,
            stability   REAL,
            elapsedDays INTEGER,
            lapses      INTEGER,
            state       INTEGER,
            deleted     INTEGER NOT NULL DEFAULT 0,
            {sync_cols},
            UNIQUE (tuneRef, playlistRef, practiced)
        );

        CREATE TABLE IF NOT EXISTS daily_practice_queue (
            id          TEXT PRIMARY KEY NOT NULL,
            userRef     TEXT NOT NULL,
            playlistRef TEXT NOT NULL REFERENCES playlist(playlistId),
            tuneRef     TEXT NOT NULL REFERENCES tune(id),
            queueDate   TEXT,
            bucket      INTEGER,
            sortOrder   INTEGER,
            completed   INTEGER NOT NULL DEFAULT 0,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS prefs_spaced_repetition (
            userId           TEXT NOT NULL,
            algType          TEXT NOT NULL,
            fsrsWeights      TEXT,
            requestRetention REAL,
            maximumInterval  INTEGER,
            {sync_cols},
            PRIMARY KEY (userId, algType)
        );

        CREATE TABLE IF NOT EXISTS prefs_scheduling_options (
            userId                      TEXT PRIMARY KEY NOT NULL,
            acceptableDelinquencyWindow INTEGER,
            minReviewsPerDay            INTEGER,
            maxReviewsPerDay            INTEGER,
            daysPerWeek                 INTEGER,
            weeklyRules                 TEXT,
            exceptions                  TEXT,
            {sync_cols}
        );

        CREATE TABLE IF NOT EXISTS table_state (
            userId      TEXT NOT NULL,
            screenSize  TEXT NOT NULL,
            purpose     TEXT NOT NULL,
            playlistId  TEXT NOT NULL,
            settings    TEXT,
            currentTune TEXT,
            {sync_cols},
            PRIMARY KEY (userId, screenSize, purpose, playlistId)
        );

        CREATE TABLE IF NOT EXISTS table_transient_data (
            userId      TEXT NOT NULL,
            tuneId      TEXT NOT NULL,
            playlistId  TEXT NOT NULL,
            purpose     TEXT,
            notePrivate TEXT,
            notePublic  TEXT,
            recallEval  TEXT,
            {sync_cols},
            PRIMARY KEY (userId, tuneId, playlistId)
        );

        CREATE TABLE IF NOT EXISTS tab_group_main_state (
            id         TEXT PRIMARY KEY NOT NULL,
            userId     TEXT NOT NULL,
            whichTab   TEXT,
            playlistId TEXT,
            tabSpec    TEXT,
            {sync_cols}
        );
        ",
        sync_cols = SYNC_COLS_SQL
    );
}

const CREATE_CHANGE_LOG_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_change_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        table_name TEXT NOT NULL,
        row_id     TEXT NOT NULL,
        changed_at TEXT NOT NULL,
        synced_at  TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_change_log_changed_at
        ON sync_change_log(changed_at);

    CREATE INDEX IF NOT EXISTS idx_change_log_table_row
        ON sync_change_log(table_name, row_id);
";

const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// Row-id expression in the central casing, mirroring the client codec.
pub(crate) fn row_id_expr(info: &TableInfo, prefix: &str) -> String {
    let cols = info.primary_key.columns();
    if !info.primary_key.is_composite() {
        return format!("{}.{}", prefix, snake_to_camel(cols[0]));
    }
    let args = cols
        .iter()
        .map(|c| {
            let camel = snake_to_camel(c);
            format!("'{}', {}.{}", camel, prefix, camel)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("json_object({})", args)
}

fn log_trigger_sql(info: &TableInfo, event: &str, row_ref: &str) -> String {
    format!(
        "CREATE TRIGGER IF NOT EXISTS {table}_log_after{event_lower}
         AFTER {event} ON {table} FOR EACH ROW
         BEGIN
             INSERT INTO sync_change_log (table_name, row_id, changed_at)
             VALUES ('{table}', {row_id}, {now});
         END;",
        table = info.name,
        event = event,
        event_lower = event.to_lowercase(),
        row_id = row_id_expr(info, row_ref),
        now = SQL_NOW,
    )
}

fn init(db: &Connection) -> open_database::Result<()> {
    log::debug!("Creating central schema");
    db.execute_all(&[&CREATE_TABLES_SQL, CREATE_CHANGE_LOG_SQL])?;
    for info in tables_in_sync_order() {
        if !info.supports_incremental {
            continue;
        }
        db.execute_batch(&log_trigger_sql(info, "INSERT", "NEW"))?;
        db.execute_batch(&log_trigger_sql(info, "UPDATE", "NEW"))?;
        db.execute_batch(&log_trigger_sql(info, "DELETE", "OLD"))?;
    }
    Ok(())
}

pub fn migration_logic() -> MigrationLogic {
    MigrationLogic {
        name: "sync-mediator".to_string(),
        start_version: 1,
        end_version: VERSION,
        prepare: None,
        init,
        upgrades: vec![],
        finish: None,
    }
}

/// Open the central store, creating or migrating the schema as needed.
pub fn open(path: impl AsRef<std::path::Path>) -> crate::Result<Connection> {
    let conn = open_database::open_database(path, &migration_logic())?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

pub fn open_in_memory() -> crate::Result<Connection> {
    let conn = open_database::open_memory_database(&migration_logic())?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_every_registered_table() {
        let conn = open_in_memory().unwrap();
        for info in tables_in_sync_order() {
            let count: i64 = conn
                .query_scalar(&format!("SELECT COUNT(*) FROM {}", info.name))
                .unwrap();
            assert_eq!(count, 0, "table {} missing", info.name);
        }
    }

    #[test]
    fn test_writes_land_in_the_change_log() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO tune (id, title, lastModifiedAt)
             VALUES ('T1', 'Silver Spear', '2025-01-01T10:00:00.000Z')",
            [],
        )
        .unwrap();
        conn.execute("UPDATE tune SET title = 'x' WHERE id = 'T1'", [])
            .unwrap();
        conn.execute("DELETE FROM tune WHERE id = 'T1'", []).unwrap();
        let entries: i64 = conn
            .query_scalar("SELECT COUNT(*) FROM sync_change_log WHERE table_name = 'tune' AND row_id = 'T1'")
            .unwrap();
        assert_eq!(entries, 3);
        // Log timestamps are server receipt instants, far newer than the
        // row's own lastModifiedAt.
        let newest: String = conn
            .query_scalar("SELECT MAX(changed_at) FROM sync_change_log")
            .unwrap();
        assert!(newest > "2025-01-01T10:00:00.000Z".to_string());
    }

    #[test]
    fn test_reference_tables_are_not_logged() {
        let conn = open_in_memory().unwrap();
        conn.execute("INSERT INTO genre (id, name) VALUES ('irish', 'Irish')", [])
            .unwrap();
        let entries: i64 = conn
            .query_scalar("SELECT COUNT(*) FROM sync_change_log")
            .unwrap();
        assert_eq!(entries, 0);
    }

    #[test]
    fn test_composite_row_id_in_log_is_wire_cased() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO table_state (userId, screenSize, purpose, playlistId)
             VALUES ('u1', 'desktop', 'practice', 'P1')",
            [],
        )
        .unwrap();
        let row_id: String = conn
            .query_scalar("SELECT row_id FROM sync_change_log WHERE table_name = 'table_state'")
            .unwrap();
        let info = tunesync::get_table("table_state").unwrap();
        let parsed = info.parse_row_id(&row_id, tunesync::Casing::Wire).unwrap();
        assert_eq!(
            parsed.get("screenSize"),
            Some(&serde_json::json!("desktop"))
        );
    }
}
