//! # Changes Feed
//!
//! Every body row is a change: inserting a revision assigns it a `seq`
//! from the body table's rowid, so scanning in `seq` order replays writes
//! in commit order. Local documents (`_local/` ids) are excluded.
//!
//! The feed's ETag is `md5("<count>.<min_seq>.<max_seq>")` over the
//! selected rows. The caller computes it in the same transaction as the
//! scan, so the tag always describes exactly the rows the cursor will
//! deliver.

use rusqlite::Connection;
use tracing::trace;

use crate::document::hex_digest;
use crate::error::Result;
use crate::revision::Revision;
use crate::schema::DbTables;

/// One changes-feed row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: String,
    pub seq: u64,
    pub deleted: bool,
    /// The revision this change introduced, as a one-element list (the
    /// CouchDB wire shape).
    pub changes: Vec<String>,
}

const NOT_LOCAL: &str = r"id NOT LIKE '\_local/%' ESCAPE '\'";

/// The feed's ETag, over the rows a subsequent [`scan`] in the same
/// transaction will deliver. An empty feed hashes the summary `"0.0.0"`.
pub fn etag(conn: &Connection, tables: &DbTables) -> Result<String> {
    let sql = format!(
        "SELECT COUNT(*) || '.' || COALESCE(MIN(seq), 0) || '.' || COALESCE(MAX(seq), 0)
         FROM {docs}
         WHERE {NOT_LOCAL}",
        docs = tables.docs_q(),
    );
    let summary: String = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(hex_digest(summary.as_bytes()))
}

/// Scans the feed in ascending `seq` order, feeding rows to `emit` until
/// the feed is exhausted or `emit` returns `false`. Returns whether the
/// scan ran to completion.
pub fn scan(
    conn: &Connection,
    tables: &DbTables,
    mut emit: impl FnMut(Change) -> bool,
) -> Result<bool> {
    let sql = format!(
        "SELECT seq, id, deleted, rev, rev_id
         FROM {docs}
         WHERE {NOT_LOCAL}
         ORDER BY seq",
        docs = tables.docs_q(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        let rev = Revision::new(row.get::<_, i64>(3)?, row.get::<_, String>(4)?);
        let change = Change {
            seq: seq as u64,
            id: row.get(1)?,
            deleted: row.get(2)?,
            changes: vec![rev.to_string()],
        };
        trace!(db = %tables.docs, seq, "changes row");
        if !emit(change) {
            return Ok(false);
        }
    }
    Ok(true)
}
