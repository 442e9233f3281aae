//! # Async API
//!
//! The public face of the engine: a [`Client`] owning one SQLite file and
//! [`Database`] handles for the logical databases inside it.
//!
//! `rusqlite::Connection` is `!Sync`, so connections never cross threads.
//! Instead the client runs an actor topology:
//!
//! ```text
//! async tasks ──┬── write channel ──▶ writer thread (read-write conn)
//!               └── read channel  ──▶ reader pool   (read-only conns)
//! ```
//!
//! The single writer thread serializes every write, which is what makes
//! the change sequence monotonic with commit order. Readers run
//! concurrently under WAL. For in-memory databases both channels feed the
//! writer thread, since a private in-memory file has nothing for a second
//! connection to open.
//!
//! Streaming results (`_all_docs`, the changes feed) flow through bounded
//! row channels: the serving thread owns the SQL transaction and pushes
//! rows; the returned cursor owns the receiver. Dropping the cursor hangs
//! up the channel, which stops the scan at its next delivery; a fired
//! cancellation token does the same and additionally surfaces as an
//! error.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::changes::{self, Change};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::reader::{self, Attachment, Document};
use crate::schema::{self, DbTables};
use crate::views::{self, AllDocsRow};
use crate::writer;

/// Capacity of the request channels.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Capacity of a cursor's row channel.
const ROW_CHANNEL_SIZE: usize = 64;

/// Bounds for the reader pool.
const MIN_READ_THREADS: usize = 1;
const MAX_READ_THREADS: usize = 4;

const VENDOR: &str = "SofaDB";

/// Engine identification, as reported by `GET /`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: String,
    pub vendor: String,
}

// =============================================================================
// Requests
// =============================================================================

/// Everything the actor threads can be asked to do. Write-side variants
/// only ever travel the write channel; the read channel carries the rest.
enum Request {
    AllDbs {
        token: CancellationToken,
        resp: oneshot::Sender<Result<Vec<String>>>,
    },
    DbExists {
        name: String,
        token: CancellationToken,
        resp: oneshot::Sender<Result<bool>>,
    },
    CreateDb {
        name: String,
        token: CancellationToken,
        resp: oneshot::Sender<Result<()>>,
    },
    DestroyDb {
        name: String,
        token: CancellationToken,
        resp: oneshot::Sender<Result<()>>,
    },
    Put {
        db: String,
        id: String,
        body: Value,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<String>>,
    },
    Delete {
        db: String,
        id: String,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<String>>,
    },
    Get {
        db: String,
        id: String,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<Document>>,
    },
    PutAttachment {
        db: String,
        id: String,
        filename: String,
        content_type: String,
        data: Vec<u8>,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<String>>,
    },
    GetAttachment {
        db: String,
        id: String,
        filename: String,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<Attachment>>,
    },
    DeleteAttachment {
        db: String,
        id: String,
        filename: String,
        opts: Options,
        token: CancellationToken,
        resp: oneshot::Sender<Result<String>>,
    },
    AllDocs {
        db: String,
        opts: Options,
        token: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
        rows: mpsc::Sender<RowEvent<Row>>,
    },
    Changes {
        db: String,
        token: CancellationToken,
        ready: oneshot::Sender<Result<String>>,
        rows: mpsc::Sender<RowEvent<Change>>,
    },
    Shutdown,
}

/// Items on a cursor's row channel. `Done` marks a fully drained scan;
/// a channel that closes without it was interrupted.
enum RowEvent<T> {
    Row(T),
    Error(Error),
    Done,
}

// =============================================================================
// Client
// =============================================================================

/// A handle to one engine instance (one SQLite file). Cheap to clone;
/// all clones share the same actor threads.
#[derive(Debug, Clone)]
pub struct Client {
    write_tx: mpsc::Sender<Request>,
    read_tx: mpsc::Sender<Request>,
    reader_count: usize,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

impl Client {
    /// Opens (creating if necessary) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let target = path.as_ref().to_string_lossy().into_owned();
        Self::open_internal(target, false)
    }

    /// Opens a private in-memory instance, for tests and scratch work.
    pub async fn open_in_memory() -> Result<Self> {
        let n = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let target = format!("file:sofadb-mem-{n}?mode=memory");
        Self::open_internal(target, true)
    }

    fn open_internal(target: String, in_memory: bool) -> Result<Self> {
        let write_flags = if in_memory {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        let writer_conn = schema::open_connection(&target, write_flags)?;

        let (write_tx, write_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let mut handles = Vec::new();
        handles.push(
            thread::Builder::new()
                .name("sofadb-writer".into())
                .spawn(move || run_writer(writer_conn, write_rx))
                .map_err(|e| Error::Internal(format!("failed to spawn writer: {e}")))?,
        );

        // In-memory instances keep a single connection, so reads are
        // served by the writer thread too.
        let (read_tx, reader_count) = if in_memory {
            (write_tx.clone(), 0)
        } else {
            let count = thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_READ_THREADS)
                .clamp(MIN_READ_THREADS, MAX_READ_THREADS);
            let (read_tx, read_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
            let shared = Arc::new(Mutex::new(read_rx));
            for i in 0..count {
                let conn = schema::open_connection(
                    &target,
                    OpenFlags::SQLITE_OPEN_READ_ONLY,
                )?;
                let shared = Arc::clone(&shared);
                handles.push(
                    thread::Builder::new()
                        .name(format!("sofadb-reader-{i}"))
                        .spawn(move || run_reader(conn, shared))
                        .map_err(|e| Error::Internal(format!("failed to spawn reader: {e}")))?,
                );
            }
            (read_tx, count)
        };

        info!(path = %target, readers = reader_count, "engine started");
        Ok(Self {
            write_tx,
            read_tx,
            reader_count,
            handles: Arc::new(Mutex::new(handles)),
        })
    }

    /// Engine name and version.
    pub fn version(&self) -> Version {
        Version {
            version: env!("CARGO_PKG_VERSION").to_string(),
            vendor: VENDOR.to_string(),
        }
    }

    /// Names of every database-owned table in the file (anything not
    /// named `sqlite_…`), which includes the `_revs` and `_attachments`
    /// side tables.
    pub async fn all_dbs(&self, token: &CancellationToken) -> Result<Vec<String>> {
        request(&self.read_tx, token, |resp| Request::AllDbs {
            token: token.clone(),
            resp,
        })
        .await
    }

    /// True when a table named `name` exists.
    pub async fn db_exists(&self, name: &str, token: &CancellationToken) -> Result<bool> {
        request(&self.read_tx, token, |resp| Request::DbExists {
            name: name.to_string(),
            token: token.clone(),
            resp,
        })
        .await
    }

    /// Creates a database: 400 for an invalid name, 412 when it (or any
    /// of its side tables) already exists.
    pub async fn create_db(&self, name: &str, token: &CancellationToken) -> Result<()> {
        request(&self.write_tx, token, |resp| Request::CreateDb {
            name: name.to_string(),
            token: token.clone(),
            resp,
        })
        .await
    }

    /// Drops a database and its side tables; 404 when absent.
    pub async fn destroy_db(&self, name: &str, token: &CancellationToken) -> Result<()> {
        request(&self.write_tx, token, |resp| Request::DestroyDb {
            name: name.to_string(),
            token: token.clone(),
            resp,
        })
        .await
    }

    /// A handle to the database `name`. Validates the name only; the
    /// database itself is checked per operation.
    pub fn db(&self, name: &str) -> Result<Database> {
        if !schema::valid_db_name(name) {
            return Err(Error::BadRequest("invalid database name".into()));
        }
        Ok(Database {
            name: name.to_string(),
            client: self.clone(),
        })
    }

    /// Shuts the actor threads down and waits for them to exit. Further
    /// operations on any clone of this client fail with an internal
    /// error.
    pub async fn close(&self) {
        for _ in 0..self.reader_count {
            let _ = self.read_tx.send(Request::Shutdown).await;
        }
        let _ = self.write_tx.send(Request::Shutdown).await;
        let handles = std::mem::take(&mut *self.handles.lock().expect("handles lock"));
        for handle in handles {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Sends one request and awaits its response, racing the caller's
/// cancellation token.
async fn request<T>(
    tx: &mpsc::Sender<Request>,
    token: &CancellationToken,
    build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
) -> Result<T> {
    let (resp_tx, resp_rx) = oneshot::channel();
    tx.send(build(resp_tx))
        .await
        .map_err(|_| Error::Internal("engine is shut down".into()))?;
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        resp = resp_rx => resp.map_err(|_| Error::Internal("engine dropped the response".into()))?,
    }
}

// =============================================================================
// Database
// =============================================================================

/// A handle to one logical database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    client: Client,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes a document; returns the new revision string. See the write
    /// engine for the `new_edits` protocol.
    pub async fn put(
        &self,
        id: &str,
        body: Value,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<String> {
        request(&self.client.write_tx, token, |resp| Request::Put {
            db: self.name.clone(),
            id: id.to_string(),
            body,
            opts,
            token: token.clone(),
            resp,
        })
        .await
    }

    /// Reads a document (winner, or the revision in `opts.rev`).
    pub async fn get(
        &self,
        id: &str,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<Document> {
        request(&self.client.read_tx, token, |resp| Request::Get {
            db: self.name.clone(),
            id: id.to_string(),
            opts,
            token: token.clone(),
            resp,
        })
        .await
    }

    /// Writes a deletion tombstone for the revision in `opts.rev`.
    pub async fn delete(
        &self,
        id: &str,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<String> {
        request(&self.client.write_tx, token, |resp| Request::Delete {
            db: self.name.clone(),
            id: id.to_string(),
            opts,
            token: token.clone(),
            resp,
        })
        .await
    }

    /// Streams the `_all_docs` index. Errors discovered before the scan
    /// starts (an unknown database, a fired token) fail this call; later
    /// errors arrive through the cursor.
    pub async fn all_docs(&self, opts: Options, token: &CancellationToken) -> Result<Rows> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_CHANNEL_SIZE);
        self.client
            .read_tx
            .send(Request::AllDocs {
                db: self.name.clone(),
                opts,
                token: token.clone(),
                ready: ready_tx,
                rows: rows_tx,
            })
            .await
            .map_err(|_| Error::Internal("engine is shut down".into()))?;
        let ready = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            resp = ready_rx => resp.map_err(|_| Error::Internal("engine dropped the response".into()))?,
        };
        ready?;
        Ok(Rows {
            rx: rows_rx,
            finished: false,
        })
    }

    /// Streams the changes feed. The returned cursor carries the ETag
    /// computed atomically with the scan; `opts` is accepted for
    /// interface parity and currently ignored.
    pub async fn changes(&self, opts: Options, token: &CancellationToken) -> Result<Changes> {
        let _ = opts;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_CHANNEL_SIZE);
        self.client
            .read_tx
            .send(Request::Changes {
                db: self.name.clone(),
                token: token.clone(),
                ready: ready_tx,
                rows: rows_tx,
            })
            .await
            .map_err(|_| Error::Internal("engine is shut down".into()))?;
        let etag = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            resp = ready_rx => resp.map_err(|_| Error::Internal("engine dropped the response".into()))?,
        }?;
        Ok(Changes {
            rx: rows_rx,
            etag,
            last_seq: None,
            drained: false,
        })
    }

    /// Adds or replaces one attachment on the document's current
    /// revision (`opts.rev`), re-putting the document.
    pub async fn put_attachment(
        &self,
        id: &str,
        filename: &str,
        content_type: &str,
        data: Vec<u8>,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<String> {
        request(&self.client.write_tx, token, |resp| {
            Request::PutAttachment {
                db: self.name.clone(),
                id: id.to_string(),
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                data,
                opts,
                token: token.clone(),
                resp,
            }
        })
        .await
    }

    /// Fetches one attachment from the winning (or requested) revision.
    pub async fn get_attachment(
        &self,
        id: &str,
        filename: &str,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<Attachment> {
        request(&self.client.read_tx, token, |resp| {
            Request::GetAttachment {
                db: self.name.clone(),
                id: id.to_string(),
                filename: filename.to_string(),
                opts,
                token: token.clone(),
                resp,
            }
        })
        .await
    }

    /// Removes one attachment, re-putting the document.
    pub async fn delete_attachment(
        &self,
        id: &str,
        filename: &str,
        opts: Options,
        token: &CancellationToken,
    ) -> Result<String> {
        request(&self.client.write_tx, token, |resp| {
            Request::DeleteAttachment {
                db: self.name.clone(),
                id: id.to_string(),
                filename: filename.to_string(),
                opts,
                token: token.clone(),
                resp,
            }
        })
        .await
    }
}

// =============================================================================
// Cursors
// =============================================================================

/// One `_all_docs` row as surfaced to callers.
#[derive(Debug, Clone)]
pub struct Row {
    pub id: String,
    pub key: String,
    /// The winning revision, the `value.rev` of the CouchDB row shape.
    pub rev: String,
    /// Full body under `include_docs`.
    pub doc: Option<Value>,
}

/// Streaming `_all_docs` results. An error is terminal; rows delivered
/// before it remain valid.
pub struct Rows {
    rx: mpsc::Receiver<RowEvent<Row>>,
    finished: bool,
}

impl Rows {
    /// The next row, `None` once the stream ends.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(RowEvent::Row(row)) => Some(Ok(row)),
            Some(RowEvent::Error(err)) => {
                self.finished = true;
                Some(Err(err))
            }
            Some(RowEvent::Done) | None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Streaming changes feed with its ETag.
#[derive(Debug)]
pub struct Changes {
    rx: mpsc::Receiver<RowEvent<Change>>,
    etag: String,
    last_seq: Option<u64>,
    drained: bool,
}

impl Changes {
    /// The next change, `None` once the feed ends.
    pub async fn next(&mut self) -> Option<Result<Change>> {
        if self.drained {
            return None;
        }
        match self.rx.recv().await {
            Some(RowEvent::Row(change)) => {
                self.last_seq = Some(change.seq);
                Some(Ok(change))
            }
            Some(RowEvent::Error(err)) => Some(Err(err)),
            Some(RowEvent::Done) => {
                self.drained = true;
                None
            }
            None => None,
        }
    }

    /// `md5("<count>.<min_seq>.<max_seq>")` over the feed's rows,
    /// computed in the same transaction as the scan.
    pub fn etag(&self) -> &str {
        &self.etag
    }

    /// The seq of the last delivered row — but only once the feed has
    /// been fully drained. Before that (or after an interrupted scan) it
    /// is `None`.
    pub fn last_seq(&self) -> Option<u64> {
        if self.drained {
            self.last_seq
        } else {
            None
        }
    }
}

// =============================================================================
// Actor threads
// =============================================================================

fn run_writer(mut conn: Connection, mut rx: mpsc::Receiver<Request>) {
    while let Some(req) = rx.blocking_recv() {
        if matches!(req, Request::Shutdown) {
            break;
        }
        handle_request(&mut conn, req);
    }
    debug!("writer thread exiting");
}

fn run_reader(mut conn: Connection, rx: Arc<Mutex<mpsc::Receiver<Request>>>) {
    loop {
        // Hold the lock only while waiting; the query itself runs
        // unlocked so the pool serves requests in parallel.
        let req = {
            let mut guard = rx.lock().expect("reader channel lock");
            guard.blocking_recv()
        };
        match req {
            None | Some(Request::Shutdown) => break,
            Some(req) => handle_request(&mut conn, req),
        }
    }
    debug!("reader thread exiting");
}

/// Looks up the table trio for `name`, failing 404 when the database
/// does not exist.
fn db_tables(conn: &Connection, name: &str) -> Result<DbTables> {
    if !schema::table_exists(conn, name)? {
        return Err(Error::NotFound("database not found".into()));
    }
    Ok(DbTables::new(name))
}

fn handle_request(conn: &mut Connection, req: Request) {
    match req {
        Request::AllDbs { token, resp } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                schema::all_tables(conn)
            };
            let _ = resp.send(result);
        }
        Request::DbExists { name, token, resp } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                schema::table_exists(conn, &name)
            };
            let _ = resp.send(result);
        }
        Request::CreateDb { name, token, resp } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                schema::create_database(conn, &name)
            };
            let _ = resp.send(result);
        }
        Request::DestroyDb { name, token, resp } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                schema::destroy_database(conn, &name)
            };
            let _ = resp.send(result);
        }
        Request::Put {
            db,
            id,
            body,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db)
                    .and_then(|tables| writer::put(conn, &tables, &id, &body, &opts))
            };
            let _ = resp.send(result);
        }
        Request::Delete {
            db,
            id,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db).and_then(|tables| writer::delete(conn, &tables, &id, &opts))
            };
            let _ = resp.send(result);
        }
        Request::Get {
            db,
            id,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db).and_then(|tables| reader::get(conn, &tables, &id, &opts))
            };
            let _ = resp.send(result);
        }
        Request::PutAttachment {
            db,
            id,
            filename,
            content_type,
            data,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db).and_then(|tables| {
                    writer::put_attachment(
                        conn,
                        &tables,
                        &id,
                        &filename,
                        &content_type,
                        &data,
                        &opts,
                    )
                })
            };
            let _ = resp.send(result);
        }
        Request::GetAttachment {
            db,
            id,
            filename,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db)
                    .and_then(|tables| reader::get_attachment(conn, &tables, &id, &filename, &opts))
            };
            let _ = resp.send(result);
        }
        Request::DeleteAttachment {
            db,
            id,
            filename,
            opts,
            token,
            resp,
        } => {
            let result = if token.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                db_tables(conn, &db)
                    .and_then(|tables| writer::delete_attachment(conn, &tables, &id, &filename, &opts))
            };
            let _ = resp.send(result);
        }
        Request::AllDocs {
            db,
            opts,
            token,
            ready,
            rows,
        } => handle_all_docs(conn, db, opts, token, ready, rows),
        Request::Changes {
            db,
            token,
            ready,
            rows,
        } => handle_changes(conn, db, token, ready, rows),
        Request::Shutdown => {}
    }
}

fn handle_all_docs(
    conn: &Connection,
    db: String,
    opts: Options,
    token: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
    rows: mpsc::Sender<RowEvent<Row>>,
) {
    if token.is_cancelled() {
        let _ = ready.send(Err(Error::Cancelled));
        return;
    }
    let tables = match db_tables(conn, &db) {
        Ok(tables) => tables,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let result = views::all_docs(&tx, &tables, &opts, |row| {
        if token.is_cancelled() {
            return false;
        }
        match public_row(row) {
            Ok(row) => rows.blocking_send(RowEvent::Row(row)).is_ok(),
            Err(err) => {
                let _ = rows.blocking_send(RowEvent::Error(err));
                false
            }
        }
    });
    match result {
        Ok(true) => {
            let _ = tx.commit();
            let _ = rows.blocking_send(RowEvent::Done);
        }
        Ok(false) if token.is_cancelled() => {
            let _ = rows.blocking_send(RowEvent::Error(Error::Cancelled));
        }
        // Receiver hung up, or a conversion error already went out.
        Ok(false) => {}
        Err(err) => {
            let _ = rows.blocking_send(RowEvent::Error(err));
        }
    }
}

fn handle_changes(
    conn: &Connection,
    db: String,
    token: CancellationToken,
    ready: oneshot::Sender<Result<String>>,
    rows: mpsc::Sender<RowEvent<Change>>,
) {
    if token.is_cancelled() {
        let _ = ready.send(Err(Error::Cancelled));
        return;
    }
    let tables = match db_tables(conn, &db) {
        Ok(tables) => tables,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    // ETag and scan share the transaction, so the tag describes exactly
    // the rows about to be delivered.
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };
    match changes::etag(&tx, &tables) {
        Ok(etag) => {
            let _ = ready.send(Ok(etag));
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    }

    let result = changes::scan(&tx, &tables, |change| {
        if token.is_cancelled() {
            return false;
        }
        rows.blocking_send(RowEvent::Row(change)).is_ok()
    });
    match result {
        Ok(true) => {
            let _ = tx.commit();
            let _ = rows.blocking_send(RowEvent::Done);
        }
        Ok(false) if token.is_cancelled() => {
            let _ = rows.blocking_send(RowEvent::Error(Error::Cancelled));
        }
        Ok(false) => {}
        Err(err) => {
            let _ = rows.blocking_send(RowEvent::Error(err));
        }
    }
}

/// Converts an engine row to the public shape, parsing the body bytes.
fn public_row(row: AllDocsRow) -> Result<Row> {
    let doc = row.doc.map(|bytes| serde_json::from_slice(&bytes)).transpose()?;
    Ok(Row {
        id: row.id,
        key: row.key,
        rev: row.rev,
        doc,
    })
}
