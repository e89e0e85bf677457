/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Row in table '{table}' is missing primary key column '{column}'")]
    MissingKey {
        table: &'static str,
        column: &'static str,
    },

    #[error("Malformed row id for table '{table}': {row_id:?}")]
    MalformedRowId {
        table: &'static str,
        row_id: String,
    },

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
