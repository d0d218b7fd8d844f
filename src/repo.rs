//! # Repository Transaction Coordinator
//!
//! Serializes writes per repository and turns a batch of prepared writes into
//! at most one durable, sequenced commit.
//!
//! ## Critical Section
//!
//! ```text
//!  apply(did, writes, swap_commit)
//!    │  writes.len() > max?  ──► TooManyWrites (no lock taken)
//!    ▼
//!  lock(did)  (bounded wait)  ──► Timeout
//!    │
//!    ├─ snapshot = cached or loaded from storage ──► RepoNotFound
//!    ├─ swap_commit != head.root? ──► InvalidSwap
//!    ├─ CommitBuilder::build  (record swaps, no-op detection, signing)
//!    ├─ nothing changed? ──► results only, no commit, no event
//!    ├─ sequencer.sequence_commit  (head CAS + records + event, one txn)
//!    ├─ cache new snapshot
//!    └─ root_updater.record  (fire-and-forget)
//!  unlock
//! ```
//!
//! Writes to different repositories never wait on each other here; they
//! meet again only in the writer's group commit.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::commit::{BuildOutcome, CommitBuilder, CommitDescriptor, RepoSnapshot, WriteResult};
use crate::error::{Error, Result};
use crate::keys::Keystore;
use crate::prepare::PreparedWrite;
use crate::reader::ReaderHandle;
use crate::root_updater::RootUpdater;
use crate::sequencer::Sequencer;
use crate::tree::RecordTree;
use crate::types::{Cid, Did, RepoHead, Seq, TidClock};

/// Prune dead lock entries once the arena grows past this size.
const LOCK_ARENA_PRUNE_THRESHOLD: usize = 128;

// =============================================================================
// Per-Repository State
// =============================================================================

/// State guarded by a repository's lock.
#[derive(Default)]
struct RepoState {
    /// Committed head and tree, or `None` if they must be reloaded.
    snapshot: Option<RepoSnapshot>,
}

/// Per-repository locks.
///
/// # Rust Pattern: Weak Lock Arena
///
/// `locks` holds `Weak` references, so a repository nobody is writing to costs
/// nothing once its lock is dropped. `recent` holds strong references to the
/// most recently written repositories to keep their snapshots warm. Both maps
/// hand out the same `Arc`, so there is never more than one lock per
/// repository.
///
/// Dead weak entries are pruned once the map outgrows `prune_at`, which then
/// moves to twice the surviving size, so the scan is amortized across inserts.
struct LockArena {
    locks: HashMap<Did, Weak<Mutex<RepoState>>>,
    recent: LruCache<Did, Arc<Mutex<RepoState>>>,
    prune_at: usize,
}

impl LockArena {
    fn new(capacity: usize) -> Self {
        let recent = LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN));
        let prune_at = Self::prune_threshold(recent.cap().get(), 0);
        Self {
            locks: HashMap::new(),
            recent,
            prune_at,
        }
    }

    fn prune_threshold(capacity: usize, live: usize) -> usize {
        (2 * capacity.max(live)).max(LOCK_ARENA_PRUNE_THRESHOLD)
    }

    fn lock_for(&mut self, did: &Did) -> Arc<Mutex<RepoState>> {
        if self.locks.len() > self.prune_at {
            self.locks.retain(|_, weak| weak.strong_count() > 0);
            self.prune_at = Self::prune_threshold(self.recent.cap().get(), self.locks.len());
        }

        let lock = match self.locks.get(did).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                let lock = Arc::new(Mutex::new(RepoState::default()));
                self.locks.insert(did.clone(), Arc::downgrade(&lock));
                lock
            }
        };
        self.recent.put(did.clone(), Arc::clone(&lock));
        lock
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of applying a batch of writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    /// The new commit, or `None` if every write was a no-op.
    pub commit: Option<CommitDescriptor>,
    /// Sequence number of the commit event.
    pub seq: Option<Seq>,
    /// One entry per requested write, in request order.
    pub results: Vec<WriteResult>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Applies writes to repositories, one batch per repository at a time.
pub struct RepoTransactor {
    arena: StdMutex<LockArena>,
    reader: ReaderHandle,
    sequencer: Sequencer,
    keystore: Arc<dyn Keystore>,
    root_updater: RootUpdater,
    clock: Arc<TidClock>,
    max_writes: usize,
    lock_timeout: Duration,
}

/// Construction parameters for [`RepoTransactor`].
pub struct TransactorParts {
    pub reader: ReaderHandle,
    pub sequencer: Sequencer,
    pub keystore: Arc<dyn Keystore>,
    pub root_updater: RootUpdater,
    pub clock: Arc<TidClock>,
    pub max_writes: usize,
    pub lock_timeout: Duration,
    pub cache_capacity: usize,
}

impl RepoTransactor {
    pub fn new(parts: TransactorParts) -> Self {
        Self {
            arena: StdMutex::new(LockArena::new(parts.cache_capacity)),
            reader: parts.reader,
            sequencer: parts.sequencer,
            keystore: parts.keystore,
            root_updater: parts.root_updater,
            clock: parts.clock,
            max_writes: parts.max_writes,
            lock_timeout: parts.lock_timeout,
        }
    }

    fn lock_for(&self, did: &Did) -> Result<Arc<Mutex<RepoState>>> {
        let mut arena = self
            .arena
            .lock()
            .map_err(|_| Error::Storage("repository lock arena poisoned".to_string()))?;
        Ok(arena.lock_for(did))
    }

    async fn acquire<'a>(&self, did: &Did, lock: &'a Mutex<RepoState>) -> Result<MutexGuard<'a, RepoState>> {
        tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| Error::Timeout(format!("waiting for repository {did}")))
    }

    async fn load_snapshot(&self, did: &Did) -> Result<RepoSnapshot> {
        let stored = self
            .reader
            .load_repo(did.clone())
            .await?
            .ok_or_else(|| Error::RepoNotFound(did.to_string()))?;
        debug!(did = %did, records = stored.records.len(), "loaded repository snapshot");
        Ok(RepoSnapshot {
            head: stored.head,
            tree: RecordTree::from_entries(stored.records),
        })
    }

    fn signing_key(&self, did: &Did) -> Result<SigningKey> {
        self.keystore
            .signing_key(did)?
            .ok_or_else(|| Error::SigningKeyNotFound(did.to_string()))
    }

    /// Creates a repository with an empty first commit signed by `key`.
    pub async fn create_repo(&self, did: &Did, key: SigningKey) -> Result<(CommitDescriptor, Seq)> {
        let lock = self.lock_for(did)?;
        let mut state = self.acquire(did, &lock).await?;

        if state.snapshot.is_some() || self.reader.load_head(did.clone()).await?.is_some() {
            return Err(Error::RepoAlreadyExists(did.to_string()));
        }

        let built = CommitBuilder::new(&self.clock).genesis(did, &key)?;
        let seq = self.sequencer.sequence_commit(built.data).await?;
        // Registered only once the repository exists.
        self.keystore.store(did, key)?;

        info!(did = %did, rev = %built.descriptor.rev, seq = seq.as_raw(), "repository created");
        self.root_updater.record(&built.snapshot.head);
        state.snapshot = Some(built.snapshot);
        Ok((built.descriptor, seq))
    }

    /// Applies a batch of writes atomically.
    ///
    /// Either every write takes effect in one commit, or none does. Writes
    /// that would not change the repository are reported as no-ops; a batch
    /// made only of no-ops produces no commit and no event.
    pub async fn apply(
        &self,
        did: &Did,
        writes: Vec<PreparedWrite>,
        swap_commit: Option<Cid>,
    ) -> Result<CommitOutcome> {
        if writes.len() > self.max_writes {
            return Err(Error::TooManyWrites {
                count: writes.len(),
                max: self.max_writes,
            });
        }
        if let Some(foreign) = writes.iter().find(|w| &w.uri().did != did) {
            return Err(Error::InvalidRequest(format!(
                "write to {} in a batch for {did}",
                foreign.uri()
            )));
        }

        let lock = self.lock_for(did)?;
        let mut state = self.acquire(did, &lock).await?;

        let snapshot = match state.snapshot.take() {
            Some(snapshot) => snapshot,
            None => self.load_snapshot(did).await?,
        };

        let built = match self.build(did, &snapshot, &writes, swap_commit) {
            Ok(outcome) => outcome,
            Err(e) => {
                state.snapshot = Some(snapshot);
                return Err(e);
            }
        };
        let Some(commit) = built.commit else {
            debug!(did = %did, writes = writes.len(), "batch had no effect; skipping commit");
            state.snapshot = Some(snapshot);
            return Ok(CommitOutcome {
                commit: None,
                seq: None,
                results: built.results,
            });
        };

        // The snapshot stays unset while the commit is in flight. If this
        // future is dropped or the commit fails, the next writer reloads.
        let seq = match self.sequencer.sequence_commit(commit.data).await {
            Ok(seq) => seq,
            Err(e) => {
                if !e.is_conflict() {
                    warn!(did = %did, error = %e, "commit failed");
                }
                return Err(e);
            }
        };

        debug!(
            did = %did,
            rev = %commit.descriptor.rev,
            seq = seq.as_raw(),
            writes = writes.len(),
            "commit sequenced"
        );
        self.root_updater.record(&commit.snapshot.head);
        state.snapshot = Some(commit.snapshot);

        Ok(CommitOutcome {
            commit: Some(commit.descriptor),
            seq: Some(seq),
            results: built.results,
        })
    }

    fn build(
        &self,
        did: &Did,
        snapshot: &RepoSnapshot,
        writes: &[PreparedWrite],
        swap_commit: Option<Cid>,
    ) -> Result<BuildOutcome> {
        if let Some(expected) = swap_commit {
            if expected != snapshot.head.root {
                return Err(Error::BadCommitSwap {
                    repo: did.to_string(),
                    expected: expected.to_string(),
                    actual: snapshot.head.root.to_string(),
                });
            }
        }
        let key = self.signing_key(did)?;
        CommitBuilder::new(&self.clock).build(snapshot, writes, &key)
    }

    /// Current head of a repository.
    pub async fn head(&self, did: &Did) -> Result<Option<RepoHead>> {
        self.reader.load_head(did.clone()).await
    }
}

// =============================================================================
// Tests
// =============================================================================
