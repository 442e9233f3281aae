//! # Read Engine
//!
//! Document retrieval: winner selection across conflicting leaves, by-rev
//! reads, and the optional metadata the caller can ask to have spliced
//! into the returned body (`_conflicts`, `_deleted_conflicts`,
//! `_revs_info`, `_attachments`).
//!
//! ## Winner selection
//!
//! Among the leaves of a document's revision tree:
//!
//! 1. leaves whose body is not deleted win over deleted ones,
//! 2. ties break on highest `rev`, then highest `rev_id`,
//! 3. if every leaf is deleted (and no explicit `rev` was requested) the
//!    document reads as absent.
//!
//! Reads run inside one transaction so the body and its metadata come
//! from a single snapshot. The functions take a plain `&Connection`; the
//! write engine reuses them inside its own transactions.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::attachments::encode_base64;
use crate::document::merge_into_doc;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::revision::Revision;
use crate::schema::DbTables;

/// A retrieved document: the revision it was read at, plus body bytes
/// with any requested metadata spliced in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub rev: Revision,
    pub body: Vec<u8>,
}

/// The winning leaf of a document, if any leaf has a body row.
#[derive(Debug, Clone)]
pub struct Winner {
    pub rev: i64,
    pub rev_id: String,
    pub deleted: bool,
    pub body: Vec<u8>,
}

impl Winner {
    pub fn revision(&self) -> Revision {
        Revision::new(self.rev, self.rev_id.clone())
    }
}

/// Selects the current winner for `id` per the leaf-preference rules.
pub fn winner(conn: &Connection, tables: &DbTables, id: &str) -> Result<Option<Winner>> {
    let sql = format!(
        "SELECT leaf.rev, leaf.rev_id, doc.doc, doc.deleted
         FROM {revs} AS leaf
         LEFT JOIN {revs} AS child
             ON child.id = leaf.id
             AND child.parent_rev = leaf.rev
             AND child.parent_rev_id = leaf.rev_id
         JOIN {docs} AS doc
             ON doc.id = leaf.id AND doc.rev = leaf.rev AND doc.rev_id = leaf.rev_id
         WHERE leaf.id = ?1 AND child.id IS NULL
         ORDER BY doc.deleted ASC, leaf.rev DESC, leaf.rev_id DESC
         LIMIT 1",
        revs = tables.revs_q(),
        docs = tables.docs_q(),
    );
    let row = conn
        .query_row(&sql, [id], |row| {
            Ok(Winner {
                rev: row.get(0)?,
                rev_id: row.get(1)?,
                body: row.get(2)?,
                deleted: row.get(3)?,
            })
        })
        .optional()?;
    Ok(row)
}

/// Reads a document. See the module docs for winner rules; an explicit
/// `rev` option loads exactly that body row (including deletion
/// tombstones), and is a 404 if the revision has no body — even when the
/// revision node itself exists.
pub fn get(conn: &Connection, tables: &DbTables, id: &str, opts: &Options) -> Result<Document> {
    let tx = conn.unchecked_transaction()?;

    let (rev, body) = match &opts.rev {
        Some(rev_str) => {
            let rev: Revision = rev_str.parse()?;
            let sql = format!(
                "SELECT doc FROM {docs} WHERE id = ?1 AND rev = ?2 AND rev_id = ?3",
                docs = tables.docs_q(),
            );
            let body: Vec<u8> = tx
                .query_row(&sql, params![id, rev.rev, rev.rev_id], |row| row.get(0))
                .optional()?
                .ok_or_else(Error::not_found)?;
            (rev, body)
        }
        None => match winner(&tx, tables, id)? {
            None => return Err(Error::not_found()),
            Some(w) if w.deleted => return Err(Error::not_found()),
            Some(w) => (w.revision(), w.body),
        },
    };

    let mut extras = Map::new();
    if opts.wants_conflicts() {
        let revs = conflicting_leaves(&tx, tables, id, &rev, false)?;
        extras.insert("_conflicts".into(), json!(revs));
    }
    if opts.wants_deleted_conflicts() {
        let revs = conflicting_leaves(&tx, tables, id, &rev, true)?;
        extras.insert("_deleted_conflicts".into(), json!(revs));
    }
    if opts.wants_revs_info() {
        let info: Vec<Value> = revs_info(&tx, tables, id, &rev)?
            .into_iter()
            .map(|(rev, status)| json!({"rev": rev, "status": status}))
            .collect();
        extras.insert("_revs_info".into(), Value::Array(info));
    }

    let atts = attachment_rows(&tx, tables, id, &rev)?;
    if !atts.is_empty() {
        let map: Map<String, Value> = atts
            .into_iter()
            .map(|att| {
                let entry = if opts.attachments {
                    json!({
                        "content_type": att.content_type,
                        "length": att.length,
                        "digest": att.digest,
                        "data": encode_base64(&att.data),
                    })
                } else {
                    json!({
                        "content_type": att.content_type,
                        "length": att.length,
                        "digest": att.digest,
                        "stub": true,
                    })
                };
                (att.filename, entry)
            })
            .collect();
        extras.insert("_attachments".into(), Value::Object(map));
    }

    let body = if extras.is_empty() {
        body
    } else {
        merge_into_doc(&body, extras)?
    };
    tx.commit()?;
    Ok(Document { rev, body })
}

/// String forms of the leaves other than `current` whose body rows have
/// the given `deleted` flag, ordered `(rev DESC, rev_id DESC)`.
pub fn conflicting_leaves(
    conn: &Connection,
    tables: &DbTables,
    id: &str,
    current: &Revision,
    deleted: bool,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT rev.rev, rev.rev_id
         FROM {revs} AS rev
         LEFT JOIN {revs} AS child
             ON rev.id = child.id
             AND rev.rev = child.parent_rev
             AND rev.rev_id = child.parent_rev_id
         JOIN {docs} AS doc
             ON doc.id = rev.id AND doc.rev = rev.rev AND doc.rev_id = rev.rev_id
         WHERE rev.id = ?1
             AND NOT (rev.rev = ?2 AND rev.rev_id = ?3)
             AND child.id IS NULL
             AND doc.deleted = ?4
         ORDER BY rev.rev DESC, rev.rev_id DESC",
        revs = tables.revs_q(),
        docs = tables.docs_q(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let revs = stmt
        .query_map(params![id, current.rev, current.rev_id, deleted], |row| {
            Ok(Revision::new(row.get::<_, i64>(0)?, row.get::<_, String>(1)?).to_string())
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(revs)
}

/// The ancestor chain of `rev` (inclusive), newest-first. Follows stored
/// parent links, so a parentless node terminates the walk regardless of
/// its generation number.
pub fn ancestors(
    conn: &Connection,
    tables: &DbTables,
    id: &str,
    rev: &Revision,
) -> Result<Vec<Revision>> {
    let sql = format!(
        "WITH RECURSIVE ancestors (id, rev, rev_id, parent_rev, parent_rev_id) AS (
             SELECT id, rev, rev_id, parent_rev, parent_rev_id
             FROM {revs}
             WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
             UNION ALL
             SELECT r.id, r.rev, r.rev_id, r.parent_rev, r.parent_rev_id
             FROM {revs} AS r
             JOIN ancestors AS a
                 ON a.id = r.id AND a.parent_rev = r.rev AND a.parent_rev_id = r.rev_id
         )
         SELECT rev, rev_id FROM ancestors ORDER BY rev DESC, rev_id DESC",
        revs = tables.revs_q(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let revs = stmt
        .query_map(params![id, rev.rev, rev.rev_id], |row| {
            Ok(Revision::new(row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(revs)
}

/// `_revs_info` rows for `rev`: ancestors and descendants combined,
/// ordered `(rev DESC, rev_id DESC)`, each with its body status —
/// `missing` (node without body row), `deleted`, or `available`.
pub fn revs_info(
    conn: &Connection,
    tables: &DbTables,
    id: &str,
    rev: &Revision,
) -> Result<Vec<(String, String)>> {
    let sql = format!(
        "SELECT revs.rev, revs.rev_id,
             CASE
                 WHEN doc.id IS NULL THEN 'missing'
                 WHEN doc.deleted THEN    'deleted'
                 ELSE                     'available'
             END
         FROM (
             WITH RECURSIVE
                 ancestors AS (
                     SELECT id, rev, rev_id, parent_rev, parent_rev_id
                     FROM {revs}
                     WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
                     UNION ALL
                     SELECT r.id, r.rev, r.rev_id, r.parent_rev, r.parent_rev_id
                     FROM {revs} AS r
                     JOIN ancestors AS a
                         ON a.id = r.id AND a.parent_rev = r.rev AND a.parent_rev_id = r.rev_id
                 ),
                 descendants AS (
                     SELECT id, rev, rev_id, parent_rev, parent_rev_id
                     FROM {revs}
                     WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
                     UNION ALL
                     SELECT r.id, r.rev, r.rev_id, r.parent_rev, r.parent_rev_id
                     FROM {revs} AS r
                     JOIN descendants AS d
                         ON d.id = r.id AND d.rev = r.parent_rev AND d.rev_id = r.parent_rev_id
                 )
             SELECT id, rev, rev_id FROM ancestors
             UNION
             SELECT id, rev, rev_id FROM descendants
         ) AS revs
         LEFT JOIN {docs} AS doc
             ON doc.id = revs.id AND doc.rev = revs.rev AND doc.rev_id = revs.rev_id
         ORDER BY revs.rev DESC, revs.rev_id DESC",
        revs = tables.revs_q(),
        docs = tables.docs_q(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![id, rev.rev, rev.rev_id], |row| {
            let rev = Revision::new(row.get::<_, i64>(0)?, row.get::<_, String>(1)?);
            Ok((rev.to_string(), row.get::<_, String>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =============================================================================
// Attachments
// =============================================================================

/// An attachment row as stored.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub length: i64,
    pub digest: String,
    pub data: Vec<u8>,
}

/// All attachment rows for one revision, in filename order.
pub fn attachment_rows(
    conn: &Connection,
    tables: &DbTables,
    id: &str,
    rev: &Revision,
) -> Result<Vec<Attachment>> {
    let sql = format!(
        "SELECT filename, content_type, length, digest, data
         FROM {atts}
         WHERE id = ?1 AND rev = ?2 AND rev_id = ?3
         ORDER BY filename",
        atts = tables.atts_q(),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![id, rev.rev, rev.rev_id], |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                content_type: row.get(1)?,
                length: row.get(2)?,
                digest: row.get(3)?,
                data: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Fetches one attachment from the winning revision (or the revision
/// named by the `rev` option). Missing document or filename is a 404.
pub fn get_attachment(
    conn: &Connection,
    tables: &DbTables,
    id: &str,
    filename: &str,
    opts: &Options,
) -> Result<Attachment> {
    let tx = conn.unchecked_transaction()?;
    let rev = match &opts.rev {
        Some(rev_str) => rev_str.parse()?,
        None => match winner(&tx, tables, id)? {
            None => return Err(Error::not_found()),
            Some(w) if w.deleted => return Err(Error::not_found()),
            Some(w) => w.revision(),
        },
    };
    let sql = format!(
        "SELECT filename, content_type, length, digest, data
         FROM {atts}
         WHERE id = ?1 AND rev = ?2 AND rev_id = ?3 AND filename = ?4",
        atts = tables.atts_q(),
    );
    let att = tx
        .query_row(&sql, params![id, rev.rev, rev.rev_id, filename], |row| {
            Ok(Attachment {
                filename: row.get(0)?,
                content_type: row.get(1)?,
                length: row.get(2)?,
                digest: row.get(3)?,
                data: row.get(4)?,
            })
        })
        .optional()?
        .ok_or_else(|| Error::NotFound("attachment not found".into()))?;
    tx.commit()?;
    Ok(att)
}
