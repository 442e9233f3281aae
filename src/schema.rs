//! # Per-Database Schema
//!
//! A client owns a single SQLite file; each logical database inside it is
//! a trio of tables scoped by name prefix:
//!
//! ```text
//! "<name>_revs"         the revision tree (parent links, cascade delete)
//! "<name>"              body rows (seq PRIMARY KEY = change sequence)
//! "<name>_attachments"  attachment rows keyed by (id, rev, rev_id, filename)
//! ```
//!
//! Database names are validated against `^[a-z][a-z0-9_$()+/-]*$` before
//! they are interpolated into DDL/queries as quoted identifiers; the
//! allowed alphabet cannot escape a double-quoted identifier.

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::collation::register_collation;
use crate::error::{Error, Result};

/// DDL statements for one database, in creation order. `{docs}`, `{revs}`
/// and `{atts}` are replaced with the quoted table names.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE {revs} (
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        parent_rev INTEGER,
        parent_rev_id TEXT,
        FOREIGN KEY (id, parent_rev, parent_rev_id) REFERENCES {revs} (id, rev, rev_id) ON DELETE CASCADE,
        UNIQUE (id, rev, rev_id)
    )"#,
    r#"CREATE INDEX {revs_parent_idx} ON {revs} (id, parent_rev, parent_rev_id)"#,
    r#"CREATE TABLE {docs} (
        seq INTEGER PRIMARY KEY,
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        doc BLOB NOT NULL,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        FOREIGN KEY (id, rev, rev_id) REFERENCES {revs} (id, rev, rev_id) ON DELETE CASCADE,
        UNIQUE (id, rev, rev_id)
    )"#,
    r#"CREATE TABLE {atts} (
        id TEXT NOT NULL,
        rev INTEGER NOT NULL,
        rev_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        length INTEGER NOT NULL,
        digest TEXT NOT NULL,
        data BLOB NOT NULL,
        FOREIGN KEY (id, rev, rev_id) REFERENCES {revs} (id, rev, rev_id) ON DELETE CASCADE,
        UNIQUE (id, rev, rev_id, filename)
    )"#,
];

/// Validates a database name: `^[a-z][a-z0-9_$()+/-]*$`.
pub fn valid_db_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+/-".contains(c))
}

fn check_db_name(name: &str) -> Result<()> {
    if valid_db_name(name) {
        Ok(())
    } else {
        Err(Error::BadRequest("invalid database name".into()))
    }
}

/// The names of the three tables backing `name`.
#[derive(Debug, Clone)]
pub struct DbTables {
    pub docs: String,
    pub revs: String,
    pub atts: String,
}

impl DbTables {
    pub fn new(name: &str) -> Self {
        Self {
            docs: name.to_string(),
            revs: format!("{name}_revs"),
            atts: format!("{name}_attachments"),
        }
    }

    /// Quoted identifier for the body table.
    pub fn docs_q(&self) -> String {
        quote_ident(&self.docs)
    }

    /// Quoted identifier for the revision-tree table.
    pub fn revs_q(&self) -> String {
        quote_ident(&self.revs)
    }

    /// Quoted identifier for the attachment table.
    pub fn atts_q(&self) -> String {
        quote_ident(&self.atts)
    }
}

/// Double-quotes an identifier. Names reaching this point have passed
/// [`valid_db_name`], whose alphabet contains no quote characters.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Opens a connection with the engine's pragma set and the `COUCHDB_UCI`
/// collation registered.
pub fn open_connection(uri: &str, flags: OpenFlags) -> Result<Connection> {
    let conn = Connection::open_with_flags(uri, flags)?;
    // WAL lets readers proceed alongside the single writer; on in-memory
    // databases the pragma is a no-op reporting "memory".
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    register_collation(&conn)?;
    Ok(conn)
}

/// True when a table named `name` exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let exists: Option<bool> = conn
        .query_row(
            "SELECT TRUE FROM sqlite_schema WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.unwrap_or(false))
}

/// All user tables in the file (names not beginning with `sqlite_`).
pub fn all_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_schema
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Creates the three tables for `name` in one transaction.
///
/// Fails with 400 on an invalid name and 412 when any of the three tables
/// already exists.
pub fn create_database(conn: &mut Connection, name: &str) -> Result<()> {
    check_db_name(name)?;
    let tables = DbTables::new(name);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for existing in [&tables.docs, &tables.revs, &tables.atts] {
        if table_exists(&tx, existing)? {
            return Err(Error::PreconditionFailed);
        }
    }
    let revs_parent_idx = quote_ident(&format!("{}_parent_idx", tables.revs));
    for ddl in SCHEMA {
        let sql = ddl
            .replace("{revs_parent_idx}", &revs_parent_idx)
            .replace("{revs}", &tables.revs_q())
            .replace("{docs}", &tables.docs_q())
            .replace("{atts}", &tables.atts_q());
        tx.execute_batch(&sql)?;
    }
    tx.commit()?;
    debug!(db = name, "created database");
    Ok(())
}

/// Drops the three tables for `name`.
///
/// Fails with 400 on an invalid name and 404 when the primary table is
/// absent. Children drop first so foreign keys never dangle mid-drop.
pub fn destroy_database(conn: &mut Connection, name: &str) -> Result<()> {
    check_db_name(name)?;
    let tables = DbTables::new(name);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !table_exists(&tx, &tables.docs)? {
        return Err(Error::NotFound("database not found".into()));
    }
    for q in [tables.atts_q(), tables.docs_q(), tables.revs_q()] {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {q}"))?;
    }
    tx.commit()?;
    debug!(db = name, "destroyed database");
    Ok(())
}
