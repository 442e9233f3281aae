#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;
use sofadb::{Client, Database, Options, Result};
use tokio_util::sync::CancellationToken;

/// Name of the database every fixture creates.
pub const DB: &str = "test";

/// A file-backed engine with one database, plus a side door for
/// white-box assertions against the raw tables.
pub struct TestDb {
    pub client: Client,
    pub db: Database,
    pub token: CancellationToken,
    pub path: PathBuf,
    // Held for its Drop; removes the directory when the test ends.
    _dir: tempfile::TempDir,
}

pub async fn test_db() -> TestDb {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("sofa.db");
    let client = Client::open(&path).await.expect("open client");
    let token = CancellationToken::new();
    client.create_db(DB, &token).await.expect("create database");
    let db = client.db(DB).expect("database handle");
    TestDb {
        client,
        db,
        token,
        path,
        _dir: dir,
    }
}

impl TestDb {
    /// A plain extra connection to the same file, for direct SQL.
    pub fn raw(&self) -> Connection {
        let conn = Connection::open(&self.path).expect("raw connection");
        conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
        conn
    }

    pub async fn put(&self, id: &str, body: Value) -> String {
        self.db
            .put(id, body, Options::new(), &self.token)
            .await
            .expect("put")
    }

    pub async fn put_rev(&self, id: &str, body: Value, rev: &str) -> String {
        self.db
            .put(id, body, Options::new().rev(rev), &self.token)
            .await
            .expect("put with rev")
    }

    /// A `new_edits=false` put, the replication write path.
    pub async fn put_replicated(&self, id: &str, body: Value) -> String {
        self.db
            .put(id, body, Options::new().new_edits(false), &self.token)
            .await
            .expect("replicated put")
    }

    pub async fn try_put(&self, id: &str, body: Value, opts: Options) -> Result<String> {
        self.db.put(id, body, opts, &self.token).await
    }

    pub async fn delete(&self, id: &str, rev: &str) -> String {
        self.db
            .delete(id, Options::new().rev(rev), &self.token)
            .await
            .expect("delete")
    }

    pub async fn get_body(&self, id: &str, opts: Options) -> Value {
        let doc = self.db.get(id, opts, &self.token).await.expect("get");
        serde_json::from_slice(&doc.body).expect("stored body is JSON")
    }

    /// Collects every `_all_docs` row, panicking on stream errors.
    pub async fn all_docs_rows(&self, opts: Options) -> Vec<sofadb::Row> {
        let mut rows = self
            .db
            .all_docs(opts, &self.token)
            .await
            .expect("all_docs");
        let mut collected = Vec::new();
        while let Some(row) = rows.next().await {
            collected.push(row.expect("all_docs row"));
        }
        collected
    }

    /// The ids of every `_all_docs` row, in delivery order.
    pub async fn all_docs_ids(&self, opts: Options) -> Vec<String> {
        self.all_docs_rows(opts)
            .await
            .into_iter()
            .map(|row| row.id)
            .collect()
    }
}

/// One row of the revision tree, for white-box comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevRow {
    pub rev: i64,
    pub rev_id: String,
    pub parent_rev: Option<i64>,
    pub parent_rev_id: Option<String>,
}

/// A root node (no parent).
pub fn root(rev: i64, rev_id: &str) -> RevRow {
    RevRow {
        rev,
        rev_id: rev_id.to_string(),
        parent_rev: None,
        parent_rev_id: None,
    }
}

/// A node with a parent link.
pub fn child(rev: i64, rev_id: &str, parent_rev: i64, parent_rev_id: &str) -> RevRow {
    RevRow {
        rev,
        rev_id: rev_id.to_string(),
        parent_rev: Some(parent_rev),
        parent_rev_id: Some(parent_rev_id.to_string()),
    }
}

/// Reads the revision tree of one document, ordered `(rev, rev_id)`.
pub fn read_revisions(conn: &Connection, id: &str) -> Vec<RevRow> {
    let mut stmt = conn
        .prepare(
            r#"SELECT rev, rev_id, parent_rev, parent_rev_id
               FROM "test_revs" WHERE id = ?1 ORDER BY rev, rev_id"#,
        )
        .expect("prepare");
    stmt.query_map([id], |row| {
        Ok(RevRow {
            rev: row.get(0)?,
            rev_id: row.get(1)?,
            parent_rev: row.get(2)?,
            parent_rev_id: row.get(3)?,
        })
    })
    .expect("query")
    .collect::<std::result::Result<Vec<_>, _>>()
    .expect("collect rows")
}

/// Reads a stored body verbatim.
pub fn read_stored_doc(conn: &Connection, id: &str, rev: i64, rev_id: &str) -> String {
    let bytes: Vec<u8> = conn
        .query_row(
            r#"SELECT doc FROM "test" WHERE id = ?1 AND rev = ?2 AND rev_id = ?3"#,
            rusqlite::params![id, rev, rev_id],
            |row| row.get(0),
        )
        .expect("stored doc");
    String::from_utf8(bytes).expect("utf8 body")
}
