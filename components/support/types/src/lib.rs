/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

use chrono::{SecondsFormat, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Typesafe way to manage timestamps: milliseconds since the unix epoch.
///
/// The sync protocol deals in RFC3339 text (`2025-01-01T10:00:00.000Z`)
/// because that's what both stores persist; the text form here is always
/// UTC with millisecond precision, so lexicographic order on the strings is
/// chronological order. `Timestamp` is the parsed, comparable form.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Returns None if `other` is later than `self` (Duration may not
    /// represent negative timespans in rust).
    #[inline]
    pub fn duration_since(self, other: Timestamp) -> Option<Duration> {
        SystemTime::from(self).duration_since(other.into()).ok()
    }

    #[inline]
    pub fn checked_sub(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_sub(d).map(Timestamp::from)
    }

    #[inline]
    pub fn checked_add(self, d: Duration) -> Option<Timestamp> {
        SystemTime::from(self).checked_add(d).map(Timestamp::from)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }

    /// The canonical text form: UTC, millisecond precision, `Z` suffix.
    pub fn as_rfc3339(self) -> String {
        match Utc.timestamp_millis_opt(self.0 as i64).single() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            // Unrepresentable only for timestamps far outside any plausible
            // clock value; render the epoch rather than panic.
            None => "1970-01-01T00:00:00.000Z".to_string(),
        }
    }

    /// Parse any RFC3339 instant (offset allowed). Returns None for
    /// unparseable input.
    pub fn from_rfc3339(s: &str) -> Option<Timestamp> {
        chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Timestamp(dt.timestamp_millis().max(0) as u64))
    }

    /// Re-render `s` in the canonical text form, or pass it through
    /// untouched when it isn't a parseable instant.
    pub fn normalize_rfc3339(s: &str) -> String {
        match Timestamp::from_rfc3339(s) {
            Some(ts) => ts.as_rfc3339(),
            None => s.to_string(),
        }
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 1000 + u64::from(d.subsec_nanos()) / 1_000_000)
    }
}

impl From<Timestamp> for SystemTime {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::from_millis(ts.into())
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64)) // hrm - no u64 in rusqlite
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(|v| Timestamp(v.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_roundtrip() {
        let ts = Timestamp(1_735_725_600_123);
        let text = ts.as_rfc3339();
        assert_eq!(text, "2025-01-01T10:00:00.123Z");
        assert_eq!(Timestamp::from_rfc3339(&text), Some(ts));
    }

    #[test]
    fn test_normalize_offsets() {
        // A +02:00 offset normalizes to the same instant in UTC.
        assert_eq!(
            Timestamp::normalize_rfc3339("2025-01-01T12:00:00+02:00"),
            "2025-01-01T10:00:00.000Z"
        );
        // Garbage passes through unchanged.
        assert_eq!(Timestamp::normalize_rfc3339("not-a-time"), "not-a-time");
    }

    #[test]
    fn test_text_order_is_time_order() {
        let a = Timestamp::from_rfc3339("2025-01-01T10:00:00.000Z").unwrap();
        let b = Timestamp::from_rfc3339("2025-01-01T10:05:00.000Z").unwrap();
        assert!(a < b);
        assert!(a.as_rfc3339() < b.as_rfc3339());
    }

    #[test]
    fn test_duration_since() {
        let earlier = Timestamp(1000);
        let later = Timestamp(3500);
        assert_eq!(
            later.duration_since(earlier),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(earlier.duration_since(later), None);
    }
}
