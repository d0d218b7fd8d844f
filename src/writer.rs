//! # Sequencing Writer with Group Commit
//!
//! The single owner of the read-write SQLite connection. Every mutation of
//! durable state (commits, standalone events, event deletion, account roots)
//! is a request to this actor, which runs on its own thread.
//!
//! ## Why One Writer?
//!
//! Sequence numbers must be gapless and strictly increasing. With exactly one
//! thread assigning them there is nothing to coordinate: the next number is a
//! field on the writer.
//!
//! ## Group Commit
//!
//! Requests arriving within `batch_timeout` of each other share one SQLite
//! transaction, so one fsync covers many commits:
//!
//! ```text
//! BEGIN IMMEDIATE
//!   SAVEPOINT req_0   move head, write records, append seq 41   RELEASE
//!   SAVEPOINT req_1   head CAS fails                            ROLLBACK TO
//!   SAVEPOINT req_2   append seq 42                             RELEASE
//!   UPSERT seq_high_water = 42
//! COMMIT
//! publish 41, 42 to the live tail; answer all three requests
//! ```
//!
//! ## Staged vs Committed Sequence
//!
//! The sequence counter advances per request while the batch runs
//! (`staged`). A request that rolls back to its savepoint gives its number
//! back, so the batch stays gapless. Only after COMMIT does the committed
//! counter move and do events become visible to subscribers.
//!
//! ## Invariants
//!
//! - Memory never leads disk: events are published only after COMMIT
//! - Sequence numbers strictly increase, no gaps among committed events
//! - Numbers are never reused, even after events are deleted (high-water mark)
//! - A head only moves if it still equals the root the commit was built on

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::codec::{compute_checksum, current_time_ms};
use crate::commit::CommitData;
use crate::config::WriterConfig;
use crate::error::{Error, Result};
use crate::events::{EventBody, SequencedEvent};
use crate::schema::{load_seq_high_water, SEQ_HIGH_WATER_KEY};
use crate::sequencer::LiveTail;
use crate::types::{Cid, Did, Seq, Tid};

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 4096;

/// How long the loop sleeps when no batch is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the writer.
pub enum WriteRequest {
    /// Persist a commit and append its event. Batched.
    Commit {
        commit: Box<CommitData>,
        response: oneshot::Sender<Result<Seq>>,
    },

    /// Append a standalone event (account, identity, labels). Batched.
    Event {
        body: EventBody,
        response: oneshot::Sender<Result<Seq>>,
    },

    /// Record a repository's latest root in `account_root`. Batched.
    ///
    /// Responds `true` if the stored root advanced, `false` if a newer
    /// revision was already stored.
    AccountRoot {
        did: Did,
        root: Cid,
        rev: Tid,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Delete every event of a repository. Executed immediately.
    DeleteRepoEvents {
        did: Did,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Flush the pending batch and stop.
    Shutdown,
}

/// Work item of a batch (without its response channel).
enum BatchWork {
    Commit(Box<CommitData>),
    Event(EventBody),
    AccountRoot { did: Did, root: Cid, rev: Tid },
}

/// Response channel extracted from a batch item.
enum BatchResponse {
    Seq(oneshot::Sender<Result<Seq>>),
    Root(oneshot::Sender<Result<bool>>),
}

/// Result for a batch item.
enum BatchResult {
    Seq(Result<Seq>),
    Root(Result<bool>),
}

struct BatchItem {
    work: BatchWork,
    response: BatchResponse,
}

// =============================================================================
// Staged State
// =============================================================================

/// Sequence state local to the running batch.
struct StagedState {
    next_seq: Seq,
    events: Vec<Arc<SequencedEvent>>,
}

impl StagedState {
    fn new(next_seq: Seq) -> Self {
        Self {
            next_seq,
            events: Vec::new(),
        }
    }

    fn clear(&mut self, next_seq: Seq) {
        self.next_seq = next_seq;
        self.events.clear();
    }

    /// Position to roll back to if the current request fails.
    fn mark(&self) -> (Seq, usize) {
        (self.next_seq, self.events.len())
    }

    fn reset_to(&mut self, mark: (Seq, usize)) {
        self.next_seq = mark.0;
        self.events.truncate(mark.1);
    }
}

// =============================================================================
// Writer
// =============================================================================

/// The writer that owns the read-write connection.
///
/// Runs on a dedicated thread; use [`WriterHandle`] from async code.
pub struct SeqWriter {
    conn: Connection,
    /// Next sequence number (committed).
    next_seq_committed: Seq,
    staged: StagedState,
    tail: Arc<LiveTail>,
}

impl SeqWriter {
    /// Creates a writer and recovers the sequence counter from disk.
    ///
    /// The next number is one past the larger of the highest stored event and
    /// the high-water mark, so numbers freed by deletion stay retired.
    pub fn new(conn: Connection, tail: Arc<LiveTail>) -> Result<Self> {
        let max_seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM repo_seq", [], |row| row.get(0))?;
        let high_water = load_seq_high_water(&conn)?;
        let last = (max_seq.unwrap_or(0) as u64).max(high_water);

        let next = Seq::from_raw(last + 1);
        if last > 0 {
            tail.advance_to(Seq::from_raw(last));
        }
        info!(next_seq = next.as_raw(), "sequencer recovered");

        Ok(Self {
            conn,
            next_seq_committed: next,
            staged: StagedState::new(next),
            tail,
        })
    }

    // =========================================================================
    // Batch Execution
    // =========================================================================

    /// Executes a batch:
    /// 1. BEGIN IMMEDIATE
    /// 2. each item in its own SAVEPOINT
    /// 3. persist the high-water mark
    /// 4. COMMIT
    /// 5. publish staged events, then answer
    fn execute_batch(&mut self, items: Vec<BatchItem>) {
        if items.is_empty() {
            return;
        }
        self.staged.clear(self.next_seq_committed);

        let mut work = Vec::with_capacity(items.len());
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            work.push(item.work);
            responses.push(item.response);
        }

        let started = Instant::now();
        match self.execute_batch_inner(&work) {
            Ok(results) => {
                let published = self.commit_staged_state();
                debug!(
                    items = responses.len(),
                    events = published,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "batch committed"
                );

                for (response, result) in responses.into_iter().zip(results) {
                    match (response, result) {
                        (BatchResponse::Seq(sender), BatchResult::Seq(r)) => {
                            let _ = sender.send(r);
                        }
                        (BatchResponse::Root(sender), BatchResult::Root(r)) => {
                            let _ = sender.send(r);
                        }
                        _ => unreachable!("mismatched response/result types"),
                    }
                }
            }
            Err(e) => {
                error!(error = %e, items = responses.len(), "batch commit failed");
                let msg = format!("batch commit failed: {e}");
                for response in responses {
                    match response {
                        BatchResponse::Seq(sender) => {
                            let _ = sender.send(Err(Error::Storage(msg.clone())));
                        }
                        BatchResponse::Root(sender) => {
                            let _ = sender.send(Err(Error::Storage(msg.clone())));
                        }
                    }
                }
                self.staged.clear(self.next_seq_committed);
            }
        }
    }

    /// Runs the batch inside one transaction.
    ///
    /// Uses raw SQL for transaction control so per-request savepoints can
    /// borrow the connection mutably.
    fn execute_batch_inner(&mut self, work: &[BatchWork]) -> Result<Vec<BatchResult>> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;

        let mut results = Vec::with_capacity(work.len());
        for (index, item) in work.iter().enumerate() {
            let result = match item {
                BatchWork::Commit(commit) => BatchResult::Seq(
                    self.in_savepoint(index, |w| w.execute_commit(commit)),
                ),
                BatchWork::Event(body) => BatchResult::Seq(
                    self.in_savepoint(index, |w| w.append_event(body.clone(), current_time_ms())),
                ),
                BatchWork::AccountRoot { did, root, rev } => BatchResult::Root(
                    self.in_savepoint(index, |w| w.upsert_account_root(did, root, rev)),
                ),
            };
            results.push(result);
        }

        let outcome = self.store_high_water().and_then(|_| {
            self.conn.execute("COMMIT", [])?;
            Ok(())
        });
        match outcome {
            Ok(()) => Ok(results),
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Runs `f` inside `SAVEPOINT req_<index>`.
    ///
    /// On failure the savepoint is rolled back and the staged sequence state
    /// is restored, so the failed request consumes no number.
    fn in_savepoint<T>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let name = format!("req_{index}");
        self.conn.execute(&format!("SAVEPOINT {name}"), [])?;
        let mark = self.staged.mark();

        match f(self) {
            Ok(value) => {
                self.conn.execute(&format!("RELEASE {name}"), [])?;
                Ok(value)
            }
            Err(e) => {
                self.staged.reset_to(mark);
                self.conn.execute(&format!("ROLLBACK TO {name}"), [])?;
                self.conn.execute(&format!("RELEASE {name}"), [])?;
                Err(e)
            }
        }
    }

    /// Moves the head, writes the commit block and records, appends the event.
    fn execute_commit(&mut self, commit: &CommitData) -> Result<Seq> {
        let now = current_time_ms();
        let did = commit.did.as_str();
        let head = &commit.head;

        match commit.prev_root {
            Some(prev) => {
                let changed = self
                    .conn
                    .prepare_cached(
                        "UPDATE repo_root SET root = ?1, data = ?2, rev = ?3, key_ref = ?4, indexed_ms = ?5
                         WHERE did = ?6 AND root = ?7",
                    )?
                    .execute(params![
                        head.root.to_string(),
                        head.data.to_string(),
                        head.rev.to_string(),
                        head.key_ref,
                        now as i64,
                        did,
                        prev.to_string(),
                    ])?;
                if changed == 0 {
                    let actual: Option<String> = self
                        .conn
                        .query_row("SELECT root FROM repo_root WHERE did = ?", [did], |row| {
                            row.get(0)
                        })
                        .optional()?;
                    return Err(match actual {
                        Some(actual) => Error::BadCommitSwap {
                            repo: did.to_string(),
                            expected: prev.to_string(),
                            actual,
                        },
                        None => Error::RepoNotFound(did.to_string()),
                    });
                }
            }
            None => {
                let inserted = self
                    .conn
                    .prepare_cached(
                        "INSERT OR IGNORE INTO repo_root (did, root, data, rev, key_ref, indexed_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?
                    .execute(params![
                        did,
                        head.root.to_string(),
                        head.data.to_string(),
                        head.rev.to_string(),
                        head.key_ref,
                        now as i64,
                    ])?;
                if inserted == 0 {
                    return Err(Error::RepoAlreadyExists(did.to_string()));
                }
            }
        }

        self.conn
            .prepare_cached(
                "INSERT OR IGNORE INTO repo_block (cid, did, rev, content) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                head.root.to_string(),
                did,
                head.rev.to_string(),
                commit.block,
            ])?;

        for put in &commit.puts {
            self.conn
                .prepare_cached(
                    "INSERT INTO record (did, collection, rkey, cid, content, rev, indexed_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(did, collection, rkey) DO UPDATE SET
                         cid = excluded.cid,
                         content = excluded.content,
                         rev = excluded.rev,
                         indexed_ms = excluded.indexed_ms",
                )?
                .execute(params![
                    did,
                    put.collection.as_str(),
                    put.rkey.as_str(),
                    put.cid.to_string(),
                    put.content,
                    head.rev.to_string(),
                    now as i64,
                ])?;
        }

        for delete in &commit.deletes {
            self.conn
                .prepare_cached("DELETE FROM record WHERE did = ?1 AND collection = ?2 AND rkey = ?3")?
                .execute(params![did, delete.collection.as_str(), delete.rkey.as_str()])?;
        }

        self.append_event(EventBody::Commit(commit.event.clone()), now)
    }

    /// Appends one event at the next staged sequence number.
    fn append_event(&mut self, body: EventBody, now_ms: u64) -> Result<Seq> {
        let seq = self.staged.next_seq;
        let payload = serde_json::to_vec(&body)?;
        let checksum = compute_checksum(&payload);

        self.conn
            .prepare_cached(
                "INSERT INTO repo_seq (seq, did, event_type, event, checksum, sequenced_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                seq.as_raw() as i64,
                body.did().map(|d| d.as_str()),
                body.kind().as_str(),
                payload,
                checksum,
                now_ms as i64,
            ])?;

        self.staged.next_seq = seq.next();
        self.staged.events.push(Arc::new(SequencedEvent {
            seq,
            time_ms: now_ms,
            body,
        }));
        Ok(seq)
    }

    /// Stores `root` unless a newer revision is already recorded.
    fn upsert_account_root(&mut self, did: &Did, root: &Cid, rev: &Tid) -> Result<bool> {
        let changed = self
            .conn
            .prepare_cached(
                "INSERT INTO account_root (did, root, rev, updated_ms) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(did) DO UPDATE SET
                     root = excluded.root,
                     rev = excluded.rev,
                     updated_ms = excluded.updated_ms
                 WHERE excluded.rev > account_root.rev",
            )?
            .execute(params![
                did.as_str(),
                root.to_string(),
                rev.to_string(),
                current_time_ms() as i64,
            ])?;
        Ok(changed > 0)
    }

    fn store_high_water(&mut self) -> Result<()> {
        if self.staged.next_seq == self.next_seq_committed {
            return Ok(());
        }
        let last = self.staged.next_seq.as_raw() - 1;
        self.conn
            .prepare_cached(
                "INSERT INTO repohost_metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![SEQ_HIGH_WATER_KEY, last.to_string()])?;
        Ok(())
    }

    /// Promotes staged state after COMMIT and publishes the batch's events.
    ///
    /// Returns the number of events published.
    fn commit_staged_state(&mut self) -> usize {
        self.next_seq_committed = self.staged.next_seq;
        let events = std::mem::take(&mut self.staged.events);
        let count = events.len();
        self.tail.publish(events);
        count
    }

    // =========================================================================
    // Immediate Operations
    // =========================================================================

    /// Deletes every event of a repository.
    ///
    /// Handled immediately, outside any batch: deletion is rare and callers
    /// expect it to have taken effect when the call returns.
    pub fn execute_delete_repo_events(&mut self, did: &Did) -> Result<u64> {
        let deleted = self
            .conn
            .execute("DELETE FROM repo_seq WHERE did = ?", [did.as_str()])?;
        info!(did = %did, deleted, "deleted repository events");
        Ok(deleted as u64)
    }
}

// =============================================================================
// Writer Handle (Async Interface)
// =============================================================================

/// Async handle to the writer thread.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> WriteRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::Closed("writer"))?;
        response_rx.await.map_err(|_| Error::Closed("writer"))?
    }

    /// Persists a commit; returns the sequence number of its event.
    pub async fn commit(&self, commit: CommitData) -> Result<Seq> {
        self.request(|response| WriteRequest::Commit {
            commit: Box::new(commit),
            response,
        })
        .await
    }

    /// Appends a standalone event.
    pub async fn append_event(&self, body: EventBody) -> Result<Seq> {
        self.request(|response| WriteRequest::Event { body, response }).await
    }

    /// Records a repository's latest root in the advisory table.
    pub async fn update_account_root(&self, did: Did, root: Cid, rev: Tid) -> Result<bool> {
        self.request(|response| WriteRequest::AccountRoot {
            did,
            root,
            rev,
            response,
        })
        .await
    }

    /// Deletes every event of `did`; returns how many were removed.
    pub async fn delete_repo_events(&self, did: Did) -> Result<u64> {
        self.request(|response| WriteRequest::DeleteRepoEvents { did, response })
            .await
    }

    /// Asks the writer to flush and stop. Does not wait for it.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRequest::Shutdown).await;
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

/// Runs the writer loop until shutdown or until every handle is dropped.
pub async fn run_writer(mut writer: SeqWriter, mut rx: mpsc::Receiver<WriteRequest>, config: WriterConfig) {
    let mut batch: Vec<BatchItem> = Vec::new();
    let mut batch_start = Instant::now();

    loop {
        let wait = if batch.is_empty() {
            IDLE_WAIT
        } else {
            config.batch_timeout.saturating_sub(batch_start.elapsed())
        };

        let item = match timeout(wait, rx.recv()).await {
            Ok(Some(WriteRequest::Commit { commit, response })) => BatchItem {
                work: BatchWork::Commit(commit),
                response: BatchResponse::Seq(response),
            },
            Ok(Some(WriteRequest::Event { body, response })) => BatchItem {
                work: BatchWork::Event(body),
                response: BatchResponse::Seq(response),
            },
            Ok(Some(WriteRequest::AccountRoot {
                did,
                root,
                rev,
                response,
            })) => BatchItem {
                work: BatchWork::AccountRoot { did, root, rev },
                response: BatchResponse::Root(response),
            },
            Ok(Some(WriteRequest::DeleteRepoEvents { did, response })) => {
                // Flush first so the delete also covers events queued before it.
                writer.execute_batch(std::mem::take(&mut batch));
                let _ = response.send(writer.execute_delete_repo_events(&did));
                continue;
            }
            Ok(Some(WriteRequest::Shutdown)) | Ok(None) => {
                writer.execute_batch(std::mem::take(&mut batch));
                break;
            }
            Err(_) => {
                writer.execute_batch(std::mem::take(&mut batch));
                continue;
            }
        };

        if batch.is_empty() {
            batch_start = Instant::now();
        }
        batch.push(item);
        if batch.len() >= config.batch_max_size {
            writer.execute_batch(std::mem::take(&mut batch));
        }
    }

    info!("writer stopped");
}

/// Spawns the writer on a dedicated thread.
///
/// Returns the handle and the thread's join handle; joining after
/// [`WriterHandle::shutdown`] guarantees the connection is closed.
pub fn spawn_writer(
    conn: Connection,
    tail: Arc<LiveTail>,
    config: WriterConfig,
) -> Result<(WriterHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let writer = SeqWriter::new(conn, tail)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Storage(format!("failed to create writer runtime: {e}")))?;

    let thread = std::thread::Builder::new()
        .name("repohost-writer".to_string())
        .spawn(move || rt.block_on(run_writer(writer, rx, config)))
        .map_err(|e| Error::Storage(format!("failed to spawn writer thread: {e}")))?;

    Ok((WriterHandle { tx }, thread))
}

// =============================================================================
// Tests
// =============================================================================
