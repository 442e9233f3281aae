//! # Document Preparation
//!
//! The write path is the only place document bodies are parsed; storage
//! and the read path treat them as opaque byte buffers. Preparing a body
//! means:
//!
//! 1. Validating `_id` against the target document id.
//! 2. Extracting the CouchDB-internal fields: `_rev`, `_deleted`,
//!    `_revisions`, `_attachments`.
//! 3. Stripping every underscore-prefixed field and serializing the rest
//!    with sorted keys — the canonical byte form that is both stored and
//!    hashed.
//! 4. Computing the deterministic rev id: the 32-hex-digit MD5 of the
//!    canonical body, extended with `"_deleted": true` when the write is a
//!    deletion and with the attachment digests when attachments are
//!    present.
//!
//! `serde_json`'s default object representation keeps keys sorted, so
//! serializing a filtered map yields the canonical form directly.

use md5::{Digest, Md5};
use serde_json::{Map, Value};

use crate::attachments::AttachmentSet;
use crate::error::{Error, Result};
use crate::revision::RevisionHistory;

/// A document body parsed and validated for writing.
#[derive(Debug)]
pub struct PreparedDoc {
    /// Document id (the request id; `_id` must agree).
    pub id: String,
    /// Body-level `_rev`, verbatim.
    pub rev: Option<String>,
    /// Parsed `_revisions` chain, if supplied.
    pub history: Option<RevisionHistory>,
    /// `_deleted: true` was present.
    pub deleted: bool,
    /// Parsed `_attachments` entries.
    pub attachments: AttachmentSet,
    /// Canonical body bytes: underscore fields stripped, keys sorted.
    pub body: Vec<u8>,
    /// Deterministic rev id for this body.
    pub rev_id: String,
}

/// Parses and validates `body` for a write against `doc_id`.
pub fn prepare_doc(doc_id: &str, body: &Value) -> Result<PreparedDoc> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::BadRequest("Document must be a JSON object".into()))?;

    if let Some(id) = obj.get("_id") {
        if id.as_str() != Some(doc_id) {
            return Err(Error::BadRequest(
                "Document ID must match _id in document".into(),
            ));
        }
    }

    let rev = match obj.get("_rev") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(Error::BadRev),
    };

    let deleted = obj.get("_deleted").and_then(Value::as_bool).unwrap_or(false);

    let history = obj
        .get("_revisions")
        .map(RevisionHistory::from_value)
        .transpose()?;

    let attachments = match obj.get("_attachments") {
        None => AttachmentSet::default(),
        Some(v) => AttachmentSet::from_value(v)?,
    };

    let stripped: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let body = serde_json::to_vec(&Value::Object(stripped.clone()))?;

    let rev_id = compute_rev_id(&stripped, deleted, &attachments);

    Ok(PreparedDoc {
        id: doc_id.to_string(),
        rev,
        history,
        deleted,
        attachments,
        body,
        rev_id,
    })
}

/// MD5-hex over the canonical body.
///
/// The canonical form is the stripped body plus `"_deleted": true` for
/// deletions and an `"_attachments"` map of filename → digest when
/// attachments are present. `_deleted: false` contributes nothing, so a
/// body with an explicit `false` hashes identically to one without the
/// field.
fn compute_rev_id(stripped: &Map<String, Value>, deleted: bool, atts: &AttachmentSet) -> String {
    let mut canonical = stripped.clone();
    if deleted {
        canonical.insert("_deleted".into(), Value::Bool(true));
    }
    if !atts.is_empty() {
        let digests: Map<String, Value> = atts
            .entries()
            .iter()
            .map(|a| (a.filename.clone(), Value::String(a.digest_or_stub())))
            .collect();
        canonical.insert("_attachments".into(), Value::Object(digests));
    }
    let bytes = serde_json::to_vec(&Value::Object(canonical)).expect("maps always serialize");
    hex_digest(&bytes)
}

/// MD5 of `bytes` as lowercase hex.
pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let digest = Md5::digest(bytes);
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Splices `extras` into a stored body.
///
/// Used by the read path for `_conflicts`, `_deleted_conflicts`,
/// `_revs_info`, and `_attachments`, and by `_all_docs` for `_id`/`_rev`
/// injection. The stored body is parsed, extended, and re-serialized;
/// existing fields win over extras with the same name.
pub fn merge_into_doc(body: &[u8], extras: Map<String, Value>) -> Result<Vec<u8>> {
    let mut doc: Map<String, Value> = serde_json::from_slice(body)?;
    for (k, v) in extras {
        doc.entry(k).or_insert(v);
    }
    Ok(serde_json::to_vec(&Value::Object(doc))?)
}
