/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Use this module to open a new SQLite database connection.
//!
//! The code handles some common cases:
//!
//!   - Opening new databases.  If this is the first time opening the
//!     database, then initialize it to the current schema.
//!
//!   - Migrating existing databases.  If this is an existing database, then
//!     run a series of upgrade functions to migrate it to the current schema.
//!
//! Schema versions are tracked with `PRAGMA user_version`.

use crate::ConnExt;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Generic error meaning that something went wrong during the migration.
    // Return this from an upgrade function to signal that the database is
    // beyond repair.
    #[error("MigrationError: {0}")]
    MigrationError(String),
    // The number of upgrade functions doesn't line up with start_version and
    // end_version.
    #[error("MigrationLogicError: {0}")]
    MigrationLogicError(String),
    #[error("Database version too old: {0}")]
    VersionTooOld(u32),
    #[error("Database version too new: {0}")]
    VersionTooNew(u32),
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("IOError: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
pub type DatabaseFunc = fn(&Connection) -> Result<()>;

pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    fn exists(&self) -> bool {
        match self {
            DatabaseLocation::Memory => false,
            DatabaseLocation::File(path) => path.exists(),
        }
    }

    fn open(&self, open_flags: OpenFlags) -> Result<Connection> {
        match self {
            DatabaseLocation::Memory => Ok(Connection::open_in_memory_with_flags(open_flags)?),
            DatabaseLocation::File(path) => Ok(Connection::open_with_flags(path, open_flags)?),
        }
    }
}

#[derive(Clone)]
pub struct MigrationLogic {
    // Name to display in the logs.
    pub name: String,
    // The first version these migrations apply to (usually 1).
    pub start_version: u32,
    // The version the last upgrade function upgrades to. Intentionally
    // redundant so it can act as a sanity check on the length of `upgrades`.
    pub end_version: u32,
    // Runs before init/upgrades, outside version tracking (temp tables,
    // pragmas).
    pub prepare: Option<DatabaseFunc>,
    // Initialize a newly created database to `end_version`.
    pub init: DatabaseFunc,
    // upgrades[n] migrates version start_version+n to start_version+n+1.
    pub upgrades: Vec<DatabaseFunc>,
    // Runs after init/upgrades on every open.
    pub finish: Option<DatabaseFunc>,
}

impl MigrationLogic {
    fn sanity_check(&self) -> Result<()> {
        let total_versions = (self.end_version - self.start_version) as usize;
        match self.upgrades.len() {
            x if x < total_versions => Err(Error::MigrationLogicError(format!(
                "Not enough upgrade functions to upgrade from {} to {}",
                self.start_version, self.end_version
            ))),
            x if x > total_versions => Err(Error::MigrationLogicError(format!(
                "Too many upgrade functions to upgrade from {} to {}",
                self.start_version, self.end_version
            ))),
            _ => Ok(()),
        }
    }

    fn run(&self, conn: &Connection, init: bool) -> Result<()> {
        log::debug!("{}: opening database", self.name);
        let tx = conn.unchecked_transaction()?;
        if let Some(prepare) = self.prepare {
            prepare(&tx)?;
        }
        if init {
            log::debug!("{}: initializing new database", self.name);
            (self.init)(&tx)?;
        } else {
            let mut current_version = get_schema_version(&tx)?;
            if current_version < self.start_version {
                return Err(Error::VersionTooOld(current_version));
            } else if current_version > self.end_version {
                return Err(Error::VersionTooNew(current_version));
            }
            while current_version < self.end_version {
                log::debug!("{}: upgrading to version {}", self.name, current_version + 1);
                let upgrade_index = (current_version - self.start_version) as usize;
                (self.upgrades[upgrade_index])(&tx)?;
                current_version += 1;
            }
        }
        set_schema_version(&tx, self.end_version)?;
        if let Some(finish) = self.finish {
            finish(&tx)?;
        }
        tx.commit()?;
        log::debug!("{}: database open successful", self.name);
        Ok(())
    }
}

pub fn open_database(path: impl AsRef<Path>, migration_logic: &MigrationLogic) -> Result<Connection> {
    open_database_with_flags(
        DatabaseLocation::File(path.as_ref().to_owned()),
        OpenFlags::default(),
        migration_logic,
    )
}

pub fn open_memory_database(migration_logic: &MigrationLogic) -> Result<Connection> {
    open_database_with_flags(DatabaseLocation::Memory, OpenFlags::default(), migration_logic)
}

pub fn open_database_with_flags(
    location: DatabaseLocation,
    open_flags: OpenFlags,
    migration_logic: &MigrationLogic,
) -> Result<Connection> {
    migration_logic.sanity_check()?;
    let initializing = !location.exists();
    let conn = location.open(open_flags)?;
    migration_logic.run(&conn, initializing)?;
    Ok(conn)
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

// It would be nice for this to be #[cfg(test)], but that doesn't allow it to
// be used in tests for our other crates.
pub mod test_utils {
    use super::*;
    use tempfile::TempDir;

    // Database file that we can programmatically run upgrades on.
    //
    // We purposefully don't keep a connection to the database around, to
    // force upgrades to always run against a newly opened DB, like they
    // would in the real world.
    pub struct MigratedDatabaseFile {
        // Keep around a TempDir to ensure the database file stays around
        // until this struct is dropped.
        _tempdir: TempDir,
        migration_logic: MigrationLogic,
        pub path: PathBuf,
    }

    impl MigratedDatabaseFile {
        pub fn new(
            migration_logic: MigrationLogic,
            initial_schema_func: DatabaseFunc,
            initial_version: u32,
        ) -> Self {
            let tempdir = tempfile::tempdir().unwrap();
            let path = tempdir.path().join("db.sql");
            let conn = Connection::open(&path).unwrap();
            initial_schema_func(&conn).unwrap();
            set_schema_version(&conn, initial_version).unwrap();
            Self {
                _tempdir: tempdir,
                migration_logic,
                path,
            }
        }

        pub fn run_all_upgrades(&self) {
            self.migration_logic.run(&self.open(), false).unwrap();
        }

        pub fn open(&self) -> Connection {
            Connection::open(&self.path).unwrap()
        }
    }
}
