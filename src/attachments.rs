//! # Attachment Parsing
//!
//! `_attachments` entries arrive in two shapes:
//!
//! - **Inline**: `{"content_type": …, "data": "<base64>"}` — the data is
//!   decoded and stored with its length and MD5 digest, keyed by
//!   `(id, rev, rev_id, filename)`.
//! - **Stub**: `{"stub": true, …}` — a placeholder meaning "keep the
//!   bytes from the revision this write descends from"; the write engine
//!   copies the parent revision's row forward.
//!
//! Anything else is a 400. In particular a missing `data` on a non-stub
//! entry and a non-string `data` are rejected with messages naming the
//! offending filename, matching CouchDB's responses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;

use crate::document::hex_digest;
use crate::error::{Error, Result};

/// One parsed `_attachments` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentEntry {
    pub filename: String,
    pub content_type: String,
    pub kind: AttachmentKind,
}

/// Inline bytes or a stub referring to the parent revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentKind {
    Inline {
        data: Vec<u8>,
        /// MD5 of the raw bytes, lowercase hex.
        digest: String,
    },
    Stub,
}

impl AttachmentEntry {
    /// Digest contribution to the rev-id hash: the data digest for inline
    /// entries, the marker `"stub"` for stubs (whose bytes belong to an
    /// earlier revision's hash).
    pub fn digest_or_stub(&self) -> String {
        match &self.kind {
            AttachmentKind::Inline { digest, .. } => digest.clone(),
            AttachmentKind::Stub => "stub".into(),
        }
    }
}

/// The parsed `_attachments` field of a document.
#[derive(Debug, Clone, Default)]
pub struct AttachmentSet {
    entries: Vec<AttachmentEntry>,
}

impl AttachmentSet {
    /// Parses and validates an `_attachments` JSON value.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadRequest("invalid _attachments".into()))?;
        let mut entries = Vec::with_capacity(obj.len());
        for (filename, entry) in obj {
            entries.push(parse_entry(filename, entry)?);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in filename order (`serde_json` objects iterate sorted).
    pub fn entries(&self) -> &[AttachmentEntry] {
        &self.entries
    }
}

fn parse_entry(filename: &str, entry: &Value) -> Result<AttachmentEntry> {
    let invalid = || Error::BadRequest(format!("invalid attachment data for {filename:?}"));

    let obj = entry.as_object().ok_or_else(invalid)?;
    let content_type = obj
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();

    if obj.get("stub").and_then(Value::as_bool) == Some(true) {
        return Ok(AttachmentEntry {
            filename: filename.to_string(),
            content_type,
            kind: AttachmentKind::Stub,
        });
    }

    let data = match obj.get("data") {
        None => return Err(invalid()),
        Some(Value::String(s)) => BASE64.decode(s).map_err(|e| {
            Error::BadRequest(format!("invalid attachment data for {filename:?}: {e}"))
        })?,
        Some(other) => {
            return Err(Error::BadRequest(format!(
                "invalid attachment data for {filename:?}: cannot decode {} as base64 data",
                json_type(other),
            )))
        }
    };

    let digest = hex_digest(&data);
    Ok(AttachmentEntry {
        filename: filename.to_string(),
        content_type,
        kind: AttachmentKind::Inline { data, digest },
    })
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encodes raw attachment bytes back to base64 for `attachments=true`
/// reads.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}
