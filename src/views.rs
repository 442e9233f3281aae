//! # The `_all_docs` Index
//!
//! An ordered scan over the winning revisions of every non-local
//! document. Keys are document ids collated with `COUCHDB_UCI`; the ids
//! are compared in their JSON-encoded form (`json_quote`), the same
//! representation view keys use, so string ids and typed range bounds
//! share one comparator.
//!
//! Options: `startkey`/`endkey` bounds (swapping roles under
//! `descending`), `inclusive_end`, `limit`/`skip`, `include_docs` with
//! optional `_conflicts` splicing. Deleted winners and `_local/` ids never
//! appear; `_design/` ids do.

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::trace;

use crate::document::merge_into_doc;
use crate::error::Result;
use crate::options::Options;
use crate::reader::conflicting_leaves;
use crate::revision::Revision;
use crate::schema::DbTables;

/// One `_all_docs` row. `doc` is populated under `include_docs` and
/// carries the stored body with `_id`/`_rev` (and, when requested,
/// `_conflicts`) spliced in.
#[derive(Debug, Clone)]
pub struct AllDocsRow {
    pub id: String,
    pub key: String,
    pub rev: String,
    pub doc: Option<Vec<u8>>,
}

/// Scans the index, feeding rows to `emit` until the scan completes or
/// `emit` returns `false`. Returns whether the scan ran to completion.
///
/// The caller provides the transactional context; the per-row
/// `_conflicts` lookups run on the same connection and therefore the same
/// snapshot.
pub fn all_docs(
    conn: &Connection,
    tables: &DbTables,
    opts: &Options,
    mut emit: impl FnMut(AllDocsRow) -> bool,
) -> Result<bool> {
    let mut conditions = String::new();
    let mut params: Vec<String> = Vec::new();

    // Under `descending` the startkey becomes the upper bound and the
    // endkey the lower one; `inclusive_end` always modifies the endkey.
    let (lower, lower_inclusive, upper, upper_inclusive) = if opts.descending {
        (&opts.end_key, opts.inclusive_end, &opts.start_key, true)
    } else {
        (&opts.start_key, true, &opts.end_key, opts.inclusive_end)
    };
    if let Some(key) = lower {
        let op = if lower_inclusive { ">=" } else { ">" };
        conditions.push_str(&format!(
            " AND json_quote(id) COLLATE COUCHDB_UCI {op} ?{}",
            params.len() + 1
        ));
        params.push(serde_json::to_string(key)?);
    }
    if let Some(key) = upper {
        let op = if upper_inclusive { "<=" } else { "<" };
        conditions.push_str(&format!(
            " AND json_quote(id) COLLATE COUCHDB_UCI {op} ?{}",
            params.len() + 1
        ));
        params.push(serde_json::to_string(key)?);
    }

    let order = if opts.descending { "DESC" } else { "ASC" };
    let limit = opts.limit.map_or(-1, |n| n as i64);
    let skip = opts.skip.unwrap_or(0) as i64;

    let sql = format!(
        r#"WITH leaves AS (
            SELECT rev.id AS id, rev.rev AS rev, rev.rev_id AS rev_id,
                   doc.doc AS doc, doc.deleted AS deleted,
                   ROW_NUMBER() OVER (
                       PARTITION BY rev.id
                       ORDER BY doc.deleted ASC, rev.rev DESC, rev.rev_id DESC
                   ) AS pick
            FROM {revs} AS rev
            LEFT JOIN {revs} AS child
                ON child.id = rev.id
                AND child.parent_rev = rev.rev
                AND child.parent_rev_id = rev.rev_id
            JOIN {docs} AS doc
                ON doc.id = rev.id AND doc.rev = rev.rev AND doc.rev_id = rev.rev_id
            WHERE child.id IS NULL
        )
        SELECT id, rev, rev_id, doc
        FROM leaves
        WHERE pick = 1 AND NOT deleted AND id NOT LIKE '\_local/%' ESCAPE '\'{conditions}
        ORDER BY json_quote(id) COLLATE COUCHDB_UCI {order}
        LIMIT {limit} OFFSET {skip}"#,
        revs = tables.revs_q(),
        docs = tables.docs_q(),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let id: String = row.get(0)?;
        let rev = Revision::new(row.get::<_, i64>(1)?, row.get::<_, String>(2)?);
        let body: Vec<u8> = row.get(3)?;

        let doc = if opts.include_docs {
            let mut extras = Map::new();
            extras.insert("_id".into(), Value::String(id.clone()));
            extras.insert("_rev".into(), Value::String(rev.to_string()));
            // `conflicts` is only honored together with `include_docs`.
            if opts.conflicts {
                let revs = conflicting_leaves(conn, tables, &id, &rev, false)?;
                if !revs.is_empty() {
                    extras.insert("_conflicts".into(), json!(revs));
                }
            }
            Some(merge_into_doc(&body, extras)?)
        } else {
            None
        };

        trace!(db = %tables.docs, id = %id, "all_docs row");
        let more = emit(AllDocsRow {
            key: id.clone(),
            id,
            rev: rev.to_string(),
            doc,
        });
        if !more {
            return Ok(false);
        }
    }
    Ok(true)
}
