/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Pure per-table adapters between the client store's spelling of a row
//! (snake_case fields, 0/1 booleans) and the wire/central spelling
//! (camelCase fields, native booleans). No I/O here.

use crate::tables::TableInfo;
use crate::JsonMap;
use serde_json::Value;
use types::Timestamp;

/// `tune_ref` -> `tuneRef`. Already-camel input passes through unchanged.
pub fn snake_to_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for ch in s.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// `tuneRef` -> `tune_ref`. Already-snake input passes through unchanged.
pub fn camel_to_snake(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for ch in s.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn bool_to_wire(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
        other => other.clone(),
    }
}

fn bool_to_local(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Number((*b as i64).into()),
        other => other.clone(),
    }
}

fn timestamp_normalized(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(Timestamp::normalize_rfc3339(s)),
        other => other.clone(),
    }
}

/// Convert a client-side row to the wire form. Fields the registry doesn't
/// know about still get the generic casing conversion and pass through
/// otherwise untouched, so newer columns survive older peers.
pub fn to_remote(info: &TableInfo, row: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    for (key, value) in row {
        let converted = if info.is_boolean_column(key) {
            bool_to_wire(value)
        } else if info.is_timestamp_column(key) {
            timestamp_normalized(value)
        } else {
            value.clone()
        };
        out.insert(snake_to_camel(key), converted);
    }
    out
}

/// Convert a wire-side row to the client form; the inverse of `to_remote`.
pub fn to_local(info: &TableInfo, row: &JsonMap) -> JsonMap {
    let mut out = JsonMap::new();
    for (key, value) in row {
        let local_key = camel_to_snake(key);
        let converted = if info.is_boolean_column(&local_key) {
            bool_to_local(value)
        } else if info.is_timestamp_column(&local_key) {
            timestamp_normalized(value)
        } else {
            value.clone()
        };
        out.insert(local_key, converted);
    }
    out
}

/// Run the table's declared normalizer, if any.
pub fn apply_normalize(info: &TableInfo, row: &mut JsonMap) {
    if let Some(normalize) = info.normalize {
        normalize(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::get_table;
    use serde_json::json;

    fn obj(v: serde_json::Value) -> JsonMap {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_casing_helpers() {
        assert_eq!(snake_to_camel("tune_ref"), "tuneRef");
        assert_eq!(snake_to_camel("id"), "id");
        assert_eq!(snake_to_camel("last_modified_at"), "lastModifiedAt");
        assert_eq!(camel_to_snake("tuneRef"), "tune_ref");
        assert_eq!(camel_to_snake("id"), "id");
        assert_eq!(camel_to_snake("lastModifiedAt"), "last_modified_at");
    }

    #[test]
    fn test_to_remote_coerces() {
        let note = get_table("note").unwrap();
        let row = obj(json!({
            "id": "N1",
            "user_ref": "u1",
            "note_text": "slow the B part down",
            "public": 1,
            "favorite": 0,
            "deleted": 0,
            "last_modified_at": "2025-01-01T12:00:00+02:00"
        }));
        let remote = to_remote(note, &row);
        assert_eq!(remote.get("noteText"), Some(&json!("slow the B part down")));
        assert_eq!(remote.get("public"), Some(&json!(true)));
        assert_eq!(remote.get("favorite"), Some(&json!(false)));
        assert_eq!(remote.get("deleted"), Some(&json!(false)));
        assert_eq!(
            remote.get("lastModifiedAt"),
            Some(&json!("2025-01-01T10:00:00.000Z"))
        );
    }

    #[test]
    fn test_to_local_is_inverse() {
        let note = get_table("note").unwrap();
        let remote = obj(json!({
            "id": "N1",
            "userRef": "u1",
            "noteText": "x",
            "public": true,
            "deleted": false,
            "lastModifiedAt": "2025-01-01T10:00:00.000Z"
        }));
        let local = to_local(note, &remote);
        assert_eq!(local.get("user_ref"), Some(&json!("u1")));
        assert_eq!(local.get("public"), Some(&json!(1)));
        assert_eq!(local.get("deleted"), Some(&json!(0)));
        assert_eq!(
            local.get("last_modified_at"),
            Some(&json!("2025-01-01T10:00:00.000Z"))
        );
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let tune = get_table("tune").unwrap();
        let row = obj(json!({"id": "T1", "brand_new_column": "kept"}));
        let remote = to_remote(tune, &row);
        assert_eq!(remote.get("brandNewColumn"), Some(&json!("kept")));
        let back = to_local(tune, &remote);
        assert_eq!(back.get("brand_new_column"), Some(&json!("kept")));
    }

    #[test]
    fn test_normalize_tune_genre() {
        let tune = get_table("tune").unwrap();
        let mut row = obj(json!({"id": "T1", "genre": "IRISH"}));
        apply_normalize(tune, &mut row);
        assert_eq!(row.get("genre"), Some(&json!("irish")));
    }
}
