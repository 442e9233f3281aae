//! # Operation Options
//!
//! A typed bag of the option keys the engine recognizes. One struct
//! serves every operation — each consumer reads the fields it defines and
//! ignores the rest, the way CouchDB endpoints treat query parameters.
//!
//! | key | used by |
//! |---|---|
//! | `new_edits`, `rev` | put / delete |
//! | `rev`, `conflicts`, `deleted_conflicts`, `revs_info`, `meta`, `attachments` | get |
//! | `include_docs`, `conflicts`, `descending`, `startkey`/`start_key`, `endkey`/`end_key`, `inclusive_end`, `limit`, `skip` | all_docs |

use serde_json::Value;

/// Options for database operations. Construct with [`Options::new`] and
/// the builder methods; unset fields keep CouchDB's defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) new_edits: bool,
    pub(crate) rev: Option<String>,
    pub(crate) conflicts: bool,
    pub(crate) deleted_conflicts: bool,
    pub(crate) revs_info: bool,
    pub(crate) meta: bool,
    pub(crate) attachments: bool,
    pub(crate) include_docs: bool,
    pub(crate) descending: bool,
    pub(crate) start_key: Option<Value>,
    pub(crate) end_key: Option<Value>,
    pub(crate) inclusive_end: bool,
    pub(crate) limit: Option<u64>,
    pub(crate) skip: Option<u64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            new_edits: true,
            rev: None,
            conflicts: false,
            deleted_conflicts: false,
            revs_info: false,
            meta: false,
            attachments: false,
            include_docs: false,
            descending: false,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            limit: None,
            skip: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// `new_edits=false` switches a put into replication mode: revision
    /// nodes are inserted verbatim instead of appended to the winner.
    pub fn new_edits(mut self, new_edits: bool) -> Self {
        self.new_edits = new_edits;
        self
    }

    /// Target revision, equivalent to the `rev` query parameter.
    pub fn rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Splice `_conflicts` into get results (or into `_all_docs` docs
    /// when combined with [`include_docs`](Self::include_docs)).
    pub fn conflicts(mut self, yes: bool) -> Self {
        self.conflicts = yes;
        self
    }

    /// Splice `_deleted_conflicts` into get results.
    pub fn deleted_conflicts(mut self, yes: bool) -> Self {
        self.deleted_conflicts = yes;
        self
    }

    /// Splice `_revs_info` into get results.
    pub fn revs_info(mut self, yes: bool) -> Self {
        self.revs_info = yes;
        self
    }

    /// `meta=true` enables `conflicts`, `deleted_conflicts` and
    /// `revs_info` at once.
    pub fn meta(mut self, yes: bool) -> Self {
        self.meta = yes;
        self
    }

    /// Return attachment bodies as base64 `data` instead of stubs.
    pub fn attachments(mut self, yes: bool) -> Self {
        self.attachments = yes;
        self
    }

    /// Emit full document bodies from `_all_docs`.
    pub fn include_docs(mut self, yes: bool) -> Self {
        self.include_docs = yes;
        self
    }

    /// Reverse `_all_docs` iteration order (and swap the key-range
    /// bounds, per CouchDB semantics).
    pub fn descending(mut self, yes: bool) -> Self {
        self.descending = yes;
        self
    }

    /// Inclusive lower bound (`startkey`/`start_key`).
    pub fn start_key(mut self, key: impl Into<Value>) -> Self {
        self.start_key = Some(key.into());
        self
    }

    /// Upper bound (`endkey`/`end_key`), inclusive unless
    /// [`inclusive_end(false)`](Self::inclusive_end).
    pub fn end_key(mut self, key: impl Into<Value>) -> Self {
        self.end_key = Some(key.into());
        self
    }

    /// Whether `end_key` itself is included. Defaults to true.
    pub fn inclusive_end(mut self, yes: bool) -> Self {
        self.inclusive_end = yes;
        self
    }

    /// Cap on emitted rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rows to drop after range filtering.
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Effective `conflicts` flag: `meta` implies it.
    pub(crate) fn wants_conflicts(&self) -> bool {
        self.conflicts || self.meta
    }

    /// Effective `deleted_conflicts` flag: `meta` implies it.
    pub(crate) fn wants_deleted_conflicts(&self) -> bool {
        self.deleted_conflicts || self.meta
    }

    /// Effective `revs_info` flag: `meta` implies it.
    pub(crate) fn wants_revs_info(&self) -> bool {
        self.revs_info || self.meta
    }
}
