//! # Reader Pool
//!
//! Read operations run on a pool of threads, each with its own read-only
//! SQLite connection. WAL mode gives every query a consistent snapshot of the
//! last committed transaction while the writer keeps appending.
//!
//! ```text
//!  async callers ──► mpsc ──► ┌──────────┐ ┌──────────┐ ┌──────────┐
//!                             │ reader 0 │ │ reader 1 │ │ reader N │
//!                             └────┬─────┘ └────┬─────┘ └────┬─────┘
//!                                  └────────────┼────────────┘
//!                                        read-only connections
//!                                               │
//!                                         SQLite (WAL)
//! ```
//!
//! The query functions are public and take a plain `&Connection`, so tests and
//! tools can call them without the pool.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::verify_checksum;
use crate::error::{Error, Result};
use crate::events::{EventBody, EventKind, SequencedEvent};
use crate::types::{AtUri, Cid, Did, RepoHead, Seq, Tid};

/// Size of the read request channel.
const READ_CHANNEL_SIZE: usize = 4096;

// =============================================================================
// Row Types
// =============================================================================

/// A repository head with its full `(path, cid)` record index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRepo {
    pub head: RepoHead,
    pub records: Vec<(String, Cid)>,
}

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub uri: AtUri,
    pub cid: Cid,
    pub value: Value,
    /// Revision of the commit that last wrote the record.
    pub rev: Tid,
}

/// The advisory latest root of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountRoot {
    pub root: Cid,
    pub rev: Tid,
}

fn corrupt(what: &str, value: &str) -> Error {
    Error::Corruption(format!("invalid {what} '{value}' in storage"))
}

fn cid_col(value: &str) -> Result<Cid> {
    Cid::parse(value).map_err(|_| corrupt("cid", value))
}

fn tid_col(value: &str) -> Result<Tid> {
    Tid::parse(value).map_err(|_| corrupt("rev", value))
}

// =============================================================================
// Direct Read Functions
// =============================================================================

/// Reads a repository head.
pub fn load_head(conn: &Connection, did: &Did) -> Result<Option<RepoHead>> {
    let row: Option<(String, String, String, String)> = conn
        .prepare_cached("SELECT root, data, rev, key_ref FROM repo_root WHERE did = ?")?
        .query_row([did.as_str()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?;

    row.map(|(root, data, rev, key_ref)| {
        Ok(RepoHead {
            did: did.clone(),
            root: cid_col(&root)?,
            data: cid_col(&data)?,
            rev: tid_col(&rev)?,
            key_ref,
        })
    })
    .transpose()
}

/// Reads a repository head and its record index.
///
/// Both come from one read transaction so the index matches the head.
pub fn load_repo(conn: &Connection, did: &Did) -> Result<Option<StoredRepo>> {
    conn.execute_batch("BEGIN DEFERRED")?;
    let result = load_repo_inner(conn, did);
    let _ = conn.execute_batch("COMMIT");
    result
}

fn load_repo_inner(conn: &Connection, did: &Did) -> Result<Option<StoredRepo>> {
    let Some(head) = load_head(conn, did)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT collection, rkey, cid FROM record WHERE did = ? ORDER BY collection, rkey",
    )?;
    let rows = stmt.query_map([did.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (collection, rkey, cid) = row?;
        records.push((format!("{collection}/{rkey}"), cid_col(&cid)?));
    }

    Ok(Some(StoredRepo { head, records }))
}

/// Reads one record.
pub fn get_record(conn: &Connection, uri: &AtUri) -> Result<Option<StoredRecord>> {
    let row: Option<(String, Vec<u8>, String)> = conn
        .prepare_cached(
            "SELECT cid, content, rev FROM record WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
        )?
        .query_row(
            params![uri.did.as_str(), uri.collection.as_str(), uri.rkey.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((cid, content, rev)) = row else {
        return Ok(None);
    };
    let cid = cid_col(&cid)?;
    if Cid::for_bytes(&content) != cid {
        return Err(Error::Corruption(format!("record {uri} does not hash to {cid}")));
    }
    Ok(Some(StoredRecord {
        uri: uri.clone(),
        cid,
        value: serde_json::from_slice(&content)?,
        rev: tid_col(&rev)?,
    }))
}

/// Reads up to `limit` events with a sequence number greater than `after`,
/// in ascending order. Every payload is checksum-verified.
pub fn read_log(conn: &Connection, after: Seq, limit: usize) -> Result<Vec<SequencedEvent>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, event_type, event, checksum, sequenced_ms FROM repo_seq
         WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after.as_raw() as i64, limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut events = Vec::new();
    for row in rows {
        let (seq, event_type, payload, checksum, sequenced_ms) = row?;
        verify_checksum(&payload, &checksum, || format!("event {seq}"))?;

        let kind = EventKind::parse(&event_type)?;
        let body: EventBody = serde_json::from_slice(&payload)?;
        if body.kind() != kind {
            return Err(Error::Corruption(format!(
                "event {seq} is stored as {kind} but decodes as {}",
                body.kind()
            )));
        }

        events.push(SequencedEvent {
            seq: Seq::from_raw(seq as u64),
            time_ms: sequenced_ms as u64,
            body,
        });
    }
    Ok(events)
}

/// Returns the first sequence number sequenced at or after `time_ms`.
pub fn first_seq_since(conn: &Connection, time_ms: u64) -> Result<Option<Seq>> {
    let seq: Option<i64> = conn
        .prepare_cached("SELECT MIN(seq) FROM repo_seq WHERE sequenced_ms >= ?")?
        .query_row([time_ms as i64], |row| row.get(0))?;
    Ok(seq.map(|s| Seq::from_raw(s as u64)))
}

/// Reads the advisory latest root of an account.
pub fn load_account_root(conn: &Connection, did: &Did) -> Result<Option<AccountRoot>> {
    let row: Option<(String, String)> = conn
        .prepare_cached("SELECT root, rev FROM account_root WHERE did = ?")?
        .query_row([did.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;

    row.map(|(root, rev)| {
        Ok(AccountRoot {
            root: cid_col(&root)?,
            rev: tid_col(&rev)?,
        })
    })
    .transpose()
}

// =============================================================================
// Request Types
// =============================================================================

/// A request served by the reader pool.
pub enum ReadRequest {
    LoadRepo {
        did: Did,
        response: oneshot::Sender<Result<Option<StoredRepo>>>,
    },
    LoadHead {
        did: Did,
        response: oneshot::Sender<Result<Option<RepoHead>>>,
    },
    GetRecord {
        uri: AtUri,
        response: oneshot::Sender<Result<Option<StoredRecord>>>,
    },
    ReadLog {
        after: Seq,
        limit: usize,
        response: oneshot::Sender<Result<Vec<SequencedEvent>>>,
    },
    FirstSeqSince {
        time_ms: u64,
        response: oneshot::Sender<Result<Option<Seq>>>,
    },
    AccountRoot {
        did: Did,
        response: oneshot::Sender<Result<Option<AccountRoot>>>,
    },
    /// Stops one reader thread.
    Shutdown,
}

fn serve(conn: &Connection, request: ReadRequest) -> bool {
    match request {
        ReadRequest::LoadRepo { did, response } => {
            let _ = response.send(load_repo(conn, &did));
        }
        ReadRequest::LoadHead { did, response } => {
            let _ = response.send(load_head(conn, &did));
        }
        ReadRequest::GetRecord { uri, response } => {
            let _ = response.send(get_record(conn, &uri));
        }
        ReadRequest::ReadLog {
            after,
            limit,
            response,
        } => {
            let _ = response.send(read_log(conn, after, limit));
        }
        ReadRequest::FirstSeqSince { time_ms, response } => {
            let _ = response.send(first_seq_since(conn, time_ms));
        }
        ReadRequest::AccountRoot { did, response } => {
            let _ = response.send(load_account_root(conn, &did));
        }
        ReadRequest::Shutdown => return false,
    }
    true
}

// =============================================================================
// Reader Loop
// =============================================================================

/// Pooled reader loop.
///
/// # Load Balancing
///
/// All threads share one receiver behind a mutex. Whichever thread is idle
/// takes the lock and the next request.
fn run_reader_pooled(conn: Connection, rx: Arc<Mutex<mpsc::Receiver<ReadRequest>>>) {
    loop {
        let request = {
            let Ok(mut guard) = rx.lock() else {
                warn!("reader receiver poisoned; stopping reader");
                return;
            };
            guard.blocking_recv()
        };
        match request {
            Some(request) => {
                if !serve(&conn, request) {
                    break;
                }
            }
            None => break,
        }
    }
    debug!("reader stopped");
}

/// Opens `count` read-only connections to `path` and starts a thread for each.
///
/// Connections are opened up front so a bad path fails here, not in a thread.
pub fn spawn_reader_pool(path: &Path, count: usize) -> Result<(ReaderHandle, Vec<JoinHandle<()>>)> {
    let (tx, rx) = mpsc::channel(READ_CHANNEL_SIZE);
    let rx = Arc::new(Mutex::new(rx));

    let mut threads = Vec::with_capacity(count);
    for i in 0..count.max(1) {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let rx = Arc::clone(&rx);
        let handle = std::thread::Builder::new()
            .name(format!("repohost-reader-{i}"))
            .spawn(move || run_reader_pooled(conn, rx))
            .map_err(|e| Error::Storage(format!("failed to spawn reader thread: {e}")))?;
        threads.push(handle);
    }

    Ok((ReaderHandle { tx }, threads))
}

// =============================================================================
// Reader Handle (Async Interface)
// =============================================================================

/// Async handle to the reader pool.
#[derive(Clone)]
pub struct ReaderHandle {
    tx: mpsc::Sender<ReadRequest>,
}

impl ReaderHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> ReadRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Closed("reader pool"))?;
        response_rx.await.map_err(|_| Error::Closed("reader pool"))?
    }

    pub async fn load_repo(&self, did: Did) -> Result<Option<StoredRepo>> {
        self.request(|response| ReadRequest::LoadRepo { did, response }).await
    }

    pub async fn load_head(&self, did: Did) -> Result<Option<RepoHead>> {
        self.request(|response| ReadRequest::LoadHead { did, response }).await
    }

    pub async fn get_record(&self, uri: AtUri) -> Result<Option<StoredRecord>> {
        self.request(|response| ReadRequest::GetRecord { uri, response }).await
    }

    pub async fn read_log(&self, after: Seq, limit: usize) -> Result<Vec<SequencedEvent>> {
        self.request(|response| ReadRequest::ReadLog {
            after,
            limit,
            response,
        })
        .await
    }

    pub async fn first_seq_since(&self, time_ms: u64) -> Result<Option<Seq>> {
        self.request(|response| ReadRequest::FirstSeqSince { time_ms, response })
            .await
    }

    pub async fn account_root(&self, did: Did) -> Result<Option<AccountRoot>> {
        self.request(|response| ReadRequest::AccountRoot { did, response })
            .await
    }

    /// Stops `threads` reader threads.
    pub async fn shutdown(&self, threads: usize) {
        for _ in 0..threads {
            let _ = self.tx.send(ReadRequest::Shutdown).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
