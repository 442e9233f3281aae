//! # Write Engine
//!
//! Put and delete, in both write modes:
//!
//! - **`new_edits=true`** (interactive): the write must name the current
//!   winning revision; a child node is appended to it and the body row is
//!   inserted with a freshly computed rev id.
//! - **`new_edits=false`** (replication): the caller supplies revision
//!   identity — either a bare `_rev` (a parentless node) or a
//!   `_revisions` chain, whose nodes are synthesized oldest-first with
//!   parent links. Overlap with already-known revisions is not an error.
//!
//! Every write runs inside a single transaction created here; any error
//! path rolls back, so partial writes are never observable. The functions
//! run on the writer thread's connection — the engine's single-writer
//! discipline comes from that thread, not from locks here.

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::attachments::{encode_base64, AttachmentKind, AttachmentSet};
use crate::document::{hex_digest, prepare_doc, PreparedDoc};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::reader;
use crate::revision::{Revision, RevisionHistory};
use crate::schema::DbTables;

/// Writes `body` as document `doc_id`. Returns the new (or, for
/// idempotent replication replays, the existing) revision string.
pub fn put(
    conn: &mut Connection,
    tables: &DbTables,
    doc_id: &str,
    body: &Value,
    opts: &Options,
) -> Result<String> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let rev = match put_tx(&tx, tables, doc_id, body, opts) {
        Ok(rev) => rev,
        Err(err) => {
            warn!(db = %tables.docs, id = doc_id, %err, "put rolled back");
            return Err(err);
        }
    };
    tx.commit()?;
    debug!(db = %tables.docs, id = doc_id, rev = %rev, "put");
    Ok(rev)
}

/// Deletes `doc_id` by writing a `{"_deleted": true}` tombstone as a
/// child of the current winner. The target revision comes from the `rev`
/// option and is required; deleting a missing document is a 404.
pub fn delete(
    conn: &mut Connection,
    tables: &DbTables,
    doc_id: &str,
    opts: &Options,
) -> Result<String> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if reader::winner(&tx, tables, doc_id)?.is_none() {
        return Err(Error::not_found());
    }
    let rev = put_tx(&tx, tables, doc_id, &json!({"_deleted": true}), opts)?;
    tx.commit()?;
    debug!(db = %tables.docs, id = doc_id, rev = %rev, "delete");
    Ok(rev)
}

/// The put protocol, inside an already-open transaction. Attachment
/// wrappers reuse this so their read-modify-write cycle stays atomic.
fn put_tx(
    tx: &Transaction<'_>,
    tables: &DbTables,
    doc_id: &str,
    body: &Value,
    opts: &Options,
) -> Result<String> {
    let prepared = prepare_doc(doc_id, body)?;

    // `_rev` in the body and `rev` in the options must agree when both
    // are present; whichever is set becomes the effective target.
    let mut doc_rev = prepared.rev.clone();
    if let (Some(opt), Some(doc)) = (&opts.rev, &doc_rev) {
        if opt != doc {
            return Err(Error::BadRequest(
                "Document rev and option have different values".into(),
            ));
        }
    }
    if doc_rev.is_none() {
        doc_rev = opts.rev.clone();
    }

    if opts.new_edits {
        put_new_edit(tx, tables, &prepared, doc_rev)
    } else {
        put_replicated(tx, tables, &prepared, doc_rev, opts.rev.as_deref())
    }
}

// =============================================================================
// Mode A: new_edits=false (replication insert)
// =============================================================================

fn put_replicated(
    tx: &Transaction<'_>,
    tables: &DbTables,
    prepared: &PreparedDoc,
    doc_rev: Option<String>,
    opts_rev: Option<&str>,
) -> Result<String> {
    if let Some(history) = &prepared.history {
        // `_revisions` wins over `_rev` silently, but a disagreement with
        // the option-level rev is a conflict.
        let leaf = history.leaf().clone();
        if let Some(opt) = opts_rev {
            if opt != leaf.to_string() {
                return Err(Error::Conflict(
                    "Document rev and option have different values".into(),
                ));
            }
        }
        insert_history(tx, tables, &prepared.id, history)?;
        insert_body(tx, tables, prepared, &leaf, Some(history))
    } else if let Some(rev_str) = doc_rev {
        let rev: Revision = rev_str.parse()?;
        // A lone `_rev` becomes a parentless node; ancestry may arrive
        // later (or never) via a `_revisions` chain.
        let insert = format!(
            "INSERT INTO {revs} (id, rev, rev_id) VALUES (?1, ?2, ?3)",
            revs = tables.revs_q(),
        );
        match tx.execute(&insert, params![prepared.id, rev.rev, rev.rev_id]) {
            Ok(_) => {}
            // Node already known: fine, replication may re-announce it.
            Err(err) if Error::is_unique_violation(&err) => {}
            Err(err) => return Err(err.into()),
        }
        insert_body(tx, tables, prepared, &rev, None)
    } else {
        Err(Error::BadRequest(
            "When `new_edits: false`, the document needs `_rev` or `_revisions` specified".into(),
        ))
    }
}

/// Synthesizes the nodes of a `_revisions` chain, oldest-first so parents
/// exist before children. Nodes that already exist keep their rows; a
/// pre-existing parentless node acquires the parent link the chain
/// implies, but an established parent link is never rewritten.
fn insert_history(
    tx: &Transaction<'_>,
    tables: &DbTables,
    id: &str,
    history: &RevisionHistory,
) -> Result<()> {
    let revs = tables.revs_q();
    let upsert = format!(
        "INSERT INTO {revs} (id, rev, rev_id, parent_rev, parent_rev_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (id, rev, rev_id) DO UPDATE
         SET parent_rev = excluded.parent_rev, parent_rev_id = excluded.parent_rev_id
         WHERE excluded.parent_rev IS NOT NULL AND {revs}.parent_rev IS NULL",
    );
    let mut stmt = tx.prepare(&upsert)?;
    for (node, parent) in history.oldest_first() {
        stmt.execute(params![
            id,
            node.rev,
            node.rev_id,
            parent.map(|p| p.rev),
            parent.map(|p| p.rev_id.as_str()),
        ])?;
    }
    Ok(())
}

// =============================================================================
// Mode B: new_edits=true (interactive write)
// =============================================================================

fn put_new_edit(
    tx: &Transaction<'_>,
    tables: &DbTables,
    prepared: &PreparedDoc,
    mut doc_rev: Option<String>,
) -> Result<String> {
    let winner = reader::winner(tx, tables, &prepared.id)?;

    if let Some(history) = &prepared.history {
        // The claimed ancestry must match the stored chain ending at the
        // current winner; for a brand-new document any claim conflicts.
        let winner = winner.as_ref().ok_or_else(Error::conflict)?;
        verify_history(tx, tables, &prepared.id, history, winner)?;
        doc_rev = Some(history.leaf().to_string());
    }

    match &winner {
        None if doc_rev.is_some() => return Err(Error::conflict()),
        None => {}
        Some(w) => {
            if doc_rev.as_deref() != Some(w.revision().to_string().as_str()) {
                return Err(Error::conflict());
            }
        }
    }

    let (new_rev, parent) = match &winner {
        Some(w) => (w.rev + 1, Some(w.revision())),
        None => (1, None),
    };
    let mut leaf = Revision::new(new_rev, prepared.rev_id.clone());

    let insert = format!(
        "INSERT INTO {revs} (id, rev, rev_id, parent_rev, parent_rev_id)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        revs = tables.revs_q(),
    );
    let node = tx.execute(
        &insert,
        params![
            prepared.id,
            leaf.rev,
            leaf.rev_id,
            parent.as_ref().map(|p| p.rev),
            parent.as_ref().map(|p| p.rev_id.as_str()),
        ],
    );
    match node {
        Ok(_) => {}
        Err(err) if Error::is_unique_violation(&err) => {
            // Identical content written at the same generation on another
            // branch (two tombstones over sibling leaves, typically). The
            // winner is a leaf, so the existing node's parent differs;
            // salt the rev id with this branch's parent to keep the
            // revision identity unique and deterministic.
            let parent = parent.as_ref().ok_or_else(|| Error::Sqlite(err))?;
            leaf.rev_id = hex_digest(format!("{parent}:{}", leaf.rev_id).as_bytes());
            tx.execute(
                &insert,
                params![
                    prepared.id,
                    leaf.rev,
                    leaf.rev_id,
                    Some(parent.rev),
                    Some(parent.rev_id.as_str()),
                ],
            )?;
        }
        Err(err) => return Err(err.into()),
    }

    let body_insert = format!(
        "INSERT INTO {docs} (id, rev, rev_id, doc, deleted) VALUES (?1, ?2, ?3, ?4, ?5)",
        docs = tables.docs_q(),
    );
    tx.execute(
        &body_insert,
        params![prepared.id, leaf.rev, leaf.rev_id, prepared.body, prepared.deleted],
    )?;

    store_attachments(tx, tables, &prepared.id, &leaf, parent.as_ref(), &prepared.attachments)?;
    Ok(leaf.to_string())
}

/// Checks a `_revisions` claim against the stored ancestry of the current
/// winner: the chain's leaf must be the winner and every older entry must
/// match the stored parent walk.
fn verify_history(
    tx: &Transaction<'_>,
    tables: &DbTables,
    id: &str,
    history: &RevisionHistory,
    winner: &reader::Winner,
) -> Result<()> {
    let ancestors = reader::ancestors(tx, tables, id, &winner.revision())?;
    if history.entries().len() > ancestors.len() {
        return Err(Error::conflict());
    }
    for (claimed, stored) in history.entries().iter().zip(ancestors.iter()) {
        if claimed != stored {
            return Err(Error::conflict());
        }
    }
    Ok(())
}

// =============================================================================
// Shared insertion helpers
// =============================================================================

/// Inserts the body row for `rev`. A unique violation means this exact
/// revision's body was already observed; the write is treated as an
/// idempotent replay and the stored body is left untouched.
fn insert_body(
    tx: &Transaction<'_>,
    tables: &DbTables,
    prepared: &PreparedDoc,
    rev: &Revision,
    history: Option<&RevisionHistory>,
) -> Result<String> {
    let insert = format!(
        "INSERT INTO {docs} (id, rev, rev_id, doc, deleted) VALUES (?1, ?2, ?3, ?4, ?5)",
        docs = tables.docs_q(),
    );
    match tx.execute(
        &insert,
        params![prepared.id, rev.rev, rev.rev_id, prepared.body, prepared.deleted],
    ) {
        Ok(_) => {}
        Err(err) if Error::is_unique_violation(&err) => return Ok(rev.to_string()),
        Err(err) => return Err(err.into()),
    }
    let parent = history.and_then(|h| h.entries().get(1).cloned());
    store_attachments(tx, tables, &prepared.id, rev, parent.as_ref(), &prepared.attachments)?;
    Ok(rev.to_string())
}

/// Persists the attachment set for a freshly written revision. Inline
/// entries store their decoded bytes; stubs copy the row from `parent`.
fn store_attachments(
    tx: &Transaction<'_>,
    tables: &DbTables,
    id: &str,
    rev: &Revision,
    parent: Option<&Revision>,
    atts: &AttachmentSet,
) -> Result<()> {
    if atts.is_empty() {
        return Ok(());
    }
    let atts_q = tables.atts_q();
    let insert = format!(
        "INSERT INTO {atts_q} (id, rev, rev_id, filename, content_type, length, digest, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    );
    let copy = format!(
        "INSERT INTO {atts_q} (id, rev, rev_id, filename, content_type, length, digest, data)
         SELECT id, ?1, ?2, filename, content_type, length, digest, data
         FROM {atts_q}
         WHERE id = ?3 AND rev = ?4 AND rev_id = ?5 AND filename = ?6",
    );
    for entry in atts.entries() {
        match &entry.kind {
            AttachmentKind::Inline { data, digest } => {
                tx.execute(
                    &insert,
                    params![
                        id,
                        rev.rev,
                        rev.rev_id,
                        entry.filename,
                        entry.content_type,
                        data.len() as i64,
                        digest,
                        data,
                    ],
                )?;
            }
            AttachmentKind::Stub => {
                let parent = parent.ok_or_else(|| {
                    Error::BadRequest(format!(
                        "invalid attachment stub for {:?}",
                        entry.filename
                    ))
                })?;
                let copied = tx.execute(
                    &copy,
                    params![rev.rev, rev.rev_id, id, parent.rev, parent.rev_id, entry.filename],
                )?;
                if copied == 0 {
                    return Err(Error::BadRequest(format!(
                        "invalid attachment stub for {:?}",
                        entry.filename
                    )));
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Attachment wrappers
// =============================================================================

/// Adds or replaces a single attachment by re-putting the document with
/// an updated `_attachments` field. The read and the put share one
/// transaction.
pub fn put_attachment(
    conn: &mut Connection,
    tables: &DbTables,
    doc_id: &str,
    filename: &str,
    content_type: &str,
    data: &[u8],
    opts: &Options,
) -> Result<String> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut body = attachment_edit_body(&tx, tables, doc_id)?;
    let atts = body
        .entry("_attachments")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .expect("built as object");
    atts.insert(
        filename.to_string(),
        json!({"content_type": content_type, "data": encode_base64(data)}),
    );
    let rev = put_tx(&tx, tables, doc_id, &Value::Object(body), opts)?;
    tx.commit()?;
    debug!(db = %tables.docs, id = doc_id, filename, rev = %rev, "put attachment");
    Ok(rev)
}

/// Removes a single attachment by re-putting the document without it.
/// Missing document or missing attachment is a 404.
pub fn delete_attachment(
    conn: &mut Connection,
    tables: &DbTables,
    doc_id: &str,
    filename: &str,
    opts: &Options,
) -> Result<String> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if reader::winner(&tx, tables, doc_id)?.is_none() {
        return Err(Error::not_found());
    }
    let mut body = attachment_edit_body(&tx, tables, doc_id)?;
    let removed = body
        .get_mut("_attachments")
        .and_then(Value::as_object_mut)
        .and_then(|atts| atts.remove(filename));
    if removed.is_none() {
        return Err(Error::NotFound("attachment not found".into()));
    }
    let rev = put_tx(&tx, tables, doc_id, &Value::Object(body), opts)?;
    tx.commit()?;
    debug!(db = %tables.docs, id = doc_id, filename, rev = %rev, "delete attachment");
    Ok(rev)
}

/// The current winner's body with its attachments represented as stubs —
/// the starting point both wrappers edit before re-putting. An absent (or
/// wholly deleted) document yields an empty body, so `put_attachment` can
/// create documents from scratch.
fn attachment_edit_body(
    tx: &Transaction<'_>,
    tables: &DbTables,
    doc_id: &str,
) -> Result<Map<String, Value>> {
    let winner = match reader::winner(tx, tables, doc_id)? {
        Some(w) if !w.deleted => w,
        _ => return Ok(Map::new()),
    };
    let mut body: Map<String, Value> = serde_json::from_slice(&winner.body)?;
    let rows = reader::attachment_rows(tx, tables, doc_id, &winner.revision())?;
    if !rows.is_empty() {
        let stubs: Map<String, Value> = rows
            .into_iter()
            .map(|att| {
                (
                    att.filename,
                    json!({"stub": true, "content_type": att.content_type}),
                )
            })
            .collect();
        body.insert("_attachments".into(), Value::Object(stubs));
    }
    Ok(body)
}
