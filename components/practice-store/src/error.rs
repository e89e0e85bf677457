/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    SyncCoreError(#[from] tunesync::Error),

    #[error("Outbox row holds an unexpected value: {0}")]
    UnexpectedOutboxValue(String),

    #[error("{0}")]
    Interrupted(#[from] interrupt_support::Interrupted),
}

pub type Result<T> = std::result::Result<T, Error>;
