/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The opaque pull cursor. Clients echo it back verbatim; everything a
//! follow-up page needs to stay anchored to the first page's snapshot is
//! inside, so the mediator itself stays stateless between pages.

use crate::error::*;
use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum CursorMode {
    Initial,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Cursor {
    pub mode: CursorMode,
    /// The snapshot anchor fixed on the first page.
    pub started_at: String,
    /// Initial mode: the table the next page resumes in, plus the offset
    /// already consumed within it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub offset: u32,
    /// Incremental mode: the watermark the window opened at, and the keyset
    /// position of the last consumed log entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_id: Option<String>,
}

pub(crate) fn encode(cursor: &Cursor) -> Result<String> {
    Ok(BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(cursor)?))
}

pub(crate) fn decode(token: &str) -> Result<Cursor> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::InvalidCursor)?;
    serde_json::from_slice(&bytes).map_err(|_| Error::InvalidCursor)
}

/// Peek at a cursor's anchor without committing to a mode, so `apply_sync`
/// can fix `syncStartedAt` before the pull runs.
pub(crate) fn started_at_of(token: Option<&str>) -> Result<Option<String>> {
    match token {
        Some(token) => Ok(Some(decode(token)?.started_at)),
        None => Ok(None),
    }
}
