//! # SofaDB — a CouchDB-compatible embedded document database
//!
//! SofaDB stores JSON documents in a single SQLite file while surfacing
//! CouchDB's document model: non-destructive updates through MVCC
//! revision trees, conflict detection across replicated branches,
//! winning-revision selection, a monotonic changes feed, the `_all_docs`
//! index, and per-revision attachments.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                 Client / Database (async)                  │
//! │              put · get · all_docs · changes                │
//! └───────────────┬────────────────────────┬───────────────────┘
//!                 │ write channel          │ read channel
//!                 ▼                        ▼
//!        ┌────────────────┐       ┌─────────────────┐
//!        │  writer thread │       │   reader pool   │
//!        │ (one RW conn)  │       │ (RO conns, WAL) │
//!        └────────┬───────┘       └────────┬────────┘
//!                 ▼                        ▼
//!        ┌────────────────────────────────────────┐
//!        │   SQLite: <db>_revs · <db> · <db>_attachments   │
//!        └────────────────────────────────────────┘
//! ```
//!
//! ## Core invariants
//!
//! 1. A revision node's parent lives in the same tree with
//!    `parent_rev = rev - 1`; nodes and body rows are immutable.
//! 2. The winner among conflicting leaves is deterministic: non-deleted
//!    first, then highest `(rev, rev_id)`.
//! 3. `seq` increases monotonically with commit order; the changes feed
//!    replays writes in that order.
//! 4. Every write is one transaction — partial writes are never
//!    observable.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sofadb::{Client, Options};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> sofadb::Result<()> {
//! let client = Client::open("sofa.db").await?;
//! let token = CancellationToken::new();
//! client.create_db("animals", &token).await?;
//!
//! let db = client.db("animals")?;
//! let rev = db
//!     .put("cat", serde_json::json!({"sound": "meow"}), Options::new(), &token)
//!     .await?;
//! let doc = db.get("cat", Options::new(), &token).await?;
//! let _ = (rev, doc);
//! # Ok(())
//! # }
//! ```

/// Error types and the CouchDB status mapping.
pub mod error;

/// CouchDB collation, registered with SQLite as `COUCHDB_UCI`.
pub mod collation;

/// Revision identifiers and `_revisions` chains.
pub mod revision;

/// Body parsing, canonical serialization, and rev-id hashing.
pub mod document;

/// `_attachments` entry parsing and base64 handling.
pub mod attachments;

/// Per-database DDL, name validation, connection setup.
pub mod schema;

/// Operation options (the recognized CouchDB query parameters).
pub mod options;

/// The write engine: put/delete in both `new_edits` modes.
pub mod writer;

/// The read engine: winner selection and metadata enrichment.
pub mod reader;

/// The `_all_docs` index.
pub mod views;

/// The changes feed.
pub mod changes;

/// The async `Client`/`Database` facade and its actor threads.
pub mod api;

pub use api::{Changes, Client, Database, Row, Rows, Version};
pub use changes::Change;
pub use error::{Error, Result};
pub use options::Options;
pub use reader::{Attachment, Document};
pub use revision::Revision;
