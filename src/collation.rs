//! # CouchDB Collation
//!
//! Key ordering for `_all_docs` and view-style range scans. CouchDB
//! defines a total order over JSON values:
//!
//! ```text
//! null < false < true < numbers < strings < arrays < objects
//! ```
//!
//! Numbers compare numerically. Strings use a simplified form of the
//! Unicode Collation Algorithm as applied by CouchDB's ICU collator:
//! specials sort before digits, digits before letters, and letters
//! interleave lowercase-first (`a < A < b < B < …`). Arrays compare
//! element-wise, objects by their sorted key/value pairs.
//!
//! The comparator is registered with every SQLite connection under the
//! name `COUCHDB_UCI`, so `ORDER BY id COLLATE COUCHDB_UCI` and range
//! predicates run entirely inside the engine. Keys stored as raw document
//! ids collate as strings; keys stored as JSON text collate as values.

use std::cmp::Ordering;

use rusqlite::Connection;
use serde_json::Value;

use crate::error::Result;

/// Collation name registered with SQLite.
pub const COLLATION_NAME: &str = "COUCHDB_UCI";

/// Registers the `COUCHDB_UCI` collation on a connection.
///
/// rusqlite scopes collations to a single connection, so this runs in the
/// connection constructor rather than once per process.
pub fn register_collation(conn: &Connection) -> Result<()> {
    conn.create_collation(COLLATION_NAME, collate_raw)?;
    Ok(())
}

/// Compares two raw key strings.
///
/// When both operands parse as JSON they are compared as JSON values (the
/// form view keys are stored in); otherwise both are compared as plain
/// strings, which is the `_all_docs` case where the key column holds the
/// bare document id.
pub fn collate_raw(a: &str, b: &str) -> Ordering {
    match (serde_json::from_str::<Value>(a), serde_json::from_str::<Value>(b)) {
        (Ok(va), Ok(vb)) => collate_values(&va, &vb),
        _ => collate_strings(a, b),
    }
}

/// Rank of a JSON value within the CouchDB type order.
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Compares two JSON values under CouchDB collation rules.
pub fn collate_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) | (Value::Bool(_), Value::Bool(_)) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => collate_strings(x, y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                match collate_values(ex, ey) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // serde_json objects iterate in sorted key order.
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                match collate_strings(kx, ky) {
                    Ordering::Equal => {}
                    other => return other,
                }
                match collate_values(vx, vy) {
                    Ordering::Equal => {}
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => unreachable!("type ranks matched"),
    }
}

/// Compares two strings with the CouchDB/ICU character ordering.
///
/// Two-level comparison, the way the UCA works: a primary pass over
/// case-folded collation weights, then — only for primary-equal strings
/// — a case pass where lowercase sorts before uppercase. Code points
/// break any remaining tie, so only identical strings compare equal.
/// The resulting letter order is `a < A < b < B < …`, with `"A" < "aa"`
/// (case never outweighs a primary difference).
pub fn collate_strings(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars();
    let mut cb = b.chars();
    loop {
        match (ca.next(), cb.next()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match primary_weight(x).cmp(&primary_weight(y)) {
                Ordering::Equal => {}
                other => return other,
            },
        }
    }
    for (x, y) in a.chars().zip(b.chars()) {
        match (x.is_ascii_uppercase(), y.is_ascii_uppercase()) {
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            _ => {}
        }
    }
    a.chars().cmp(b.chars())
}

/// Primary (case-folded) collation weight of a single character.
///
/// The ASCII table mirrors the ordering CouchDB documents for its ICU
/// collator: specials, then digits, then letters. Characters beyond
/// ASCII sort after ASCII by code point, which is where the UCA places
/// the vast majority of them relative to Latin script.
fn primary_weight(c: char) -> u32 {
    const SPECIALS: &str = " \t\n!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";
    if let Some(pos) = SPECIALS.find(c) {
        return pos as u32;
    }
    let base = SPECIALS.len() as u32;
    match c {
        '0'..='9' => base + (c as u32 - '0' as u32),
        'a'..='z' => base + 10 + (c as u32 - 'a' as u32),
        'A'..='Z' => base + 10 + (c as u32 - 'A' as u32),
        _ => base + 100 + c as u32,
    }
}
