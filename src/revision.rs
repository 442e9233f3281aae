//! # Revision Identifiers
//!
//! A revision is a pair `(rev, rev_id)` with string form `"<rev>-<rev_id>"`,
//! e.g. `1-9bb58f26192e4ba00f01e2e7b136bbd8`. `rev` is a positive
//! generation number; `rev_id` is a hex digest for engine-generated
//! revisions, or whatever opaque token a replicator supplied.
//!
//! [`RevisionHistory`] is the normalized form of a document's
//! `_revisions` field: `{start: N, ids: [leaf, leaf-1, …]}` expands to
//! leaf-first `(rev, rev_id)` pairs with `rev = start - i`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Error, Result};

/// A single revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    /// Generation number, `>= 1`.
    pub rev: i64,
    /// Opaque revision id (lowercase hex for engine-generated revisions).
    pub rev_id: String,
}

impl Revision {
    pub fn new(rev: i64, rev_id: impl Into<String>) -> Self {
        Self { rev, rev_id: rev_id.into() }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.rev, self.rev_id)
    }
}

impl FromStr for Revision {
    type Err = Error;

    /// Parses `"<N>-<id>"`. `N` must be a positive integer and the
    /// separator must be present; everything after the first `-` is the
    /// rev id, taken verbatim.
    fn from_str(s: &str) -> Result<Self> {
        let (num, id) = s.split_once('-').ok_or(Error::BadRev)?;
        let rev: i64 = num.parse().map_err(|_| Error::BadRev)?;
        if rev < 1 || id.is_empty() {
            return Err(Error::BadRev);
        }
        Ok(Revision { rev, rev_id: id.to_string() })
    }
}

/// A normalized `_revisions` chain, ordered leaf-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionHistory {
    entries: Vec<Revision>,
}

impl RevisionHistory {
    /// Parses a `_revisions` JSON value (`{start, ids[]}`).
    ///
    /// `ids[0]` is the leaf; entry `i` gets `rev = start - i`. Fails with
    /// `BadRequest` when the shape is wrong or the chain would reach a
    /// non-positive generation.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::BadRequest("invalid _revisions".into()))?;
        let start = obj
            .get("start")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::BadRequest("invalid _revisions".into()))?;
        let ids = obj
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BadRequest("invalid _revisions".into()))?;
        if ids.is_empty() || start < ids.len() as i64 {
            return Err(Error::BadRequest("invalid _revisions".into()));
        }
        let entries = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let rev_id = id
                    .as_str()
                    .ok_or_else(|| Error::BadRequest("invalid _revisions".into()))?;
                Ok(Revision::new(start - i as i64, rev_id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// The newest entry of the chain.
    pub fn leaf(&self) -> &Revision {
        &self.entries[0]
    }

    /// Entries ordered leaf-first.
    pub fn entries(&self) -> &[Revision] {
        &self.entries
    }

    /// Entries ordered oldest-first, each paired with its parent within
    /// the chain (`None` for the root). This is the insertion order the
    /// write engine needs so that parent rows exist before children.
    pub fn oldest_first(&self) -> impl Iterator<Item = (&Revision, Option<&Revision>)> {
        let n = self.entries.len();
        (0..n).rev().map(move |i| {
            let parent = if i + 1 < n { Some(&self.entries[i + 1]) } else { None };
            (&self.entries[i], parent)
        })
    }
}
