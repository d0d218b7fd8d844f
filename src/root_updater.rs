//! # Account Root Updater
//!
//! Keeps a best-effort record of every account's latest repository root.
//!
//! ## Best Effort
//!
//! The authoritative head lives in `repo_root` and moves inside the commit
//! transaction. The account-root table is a convenience copy for lookups, so
//! updating it must never slow down or fail a write:
//!
//! ```text
//!  commit succeeded ──► record(head) ──► cache.offer   (sync, in-memory)
//!                              │
//!                              └──► try_send ──► queue ──► background task
//!                                   (full? drop + warn)       │
//!                                                             ▼
//!                                                 writer: UPSERT ... WHERE newer
//!                                                 (fails? warn, move on)
//! ```
//!
//! A stored root never moves backwards: both the cache and the upsert only
//! accept a strictly newer revision.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RootUpdaterConfig;
use crate::error::Result;
use crate::reader::{AccountRoot, ReaderHandle};
use crate::types::{Cid, Did, RepoHead, Tid};
use crate::writer::WriterHandle;

// =============================================================================
// Cache
// =============================================================================

struct CachedRoot {
    root: AccountRoot,
    stored_at: Instant,
}

/// Bounded, time-limited cache of account roots.
///
/// # Rust Pattern: Interior Mutability
///
/// `LruCache::get` needs `&mut self` to bump recency, so the cache sits in a
/// `Mutex` even for reads. Critical sections are a hash lookup long.
pub struct RootCache {
    entries: Mutex<LruCache<Did, CachedRoot>>,
    ttl: Duration,
}

impl RootCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Did, CachedRoot>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached root unless it has expired.
    pub fn get(&self, did: &Did) -> Option<AccountRoot> {
        let mut entries = self.lock();
        match entries.get(did) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.root),
            Some(_) => {
                entries.pop(did);
                None
            }
            None => None,
        }
    }

    /// Caches `root` unless a newer revision is already cached.
    ///
    /// Returns true if the cache changed.
    pub fn offer(&self, did: &Did, root: AccountRoot) -> bool {
        let mut entries = self.lock();
        if let Some(existing) = entries.peek(did) {
            if existing.root.rev >= root.rev {
                return false;
            }
        }
        entries.put(
            did.clone(),
            CachedRoot {
                root,
                stored_at: Instant::now(),
            },
        );
        true
    }
}

// =============================================================================
// Updater
// =============================================================================

struct RootUpdate {
    did: Did,
    root: Cid,
    rev: Tid,
}

/// Fire-and-forget recorder of account roots.
#[derive(Clone)]
pub struct RootUpdater {
    cache: Arc<RootCache>,
    tx: mpsc::Sender<RootUpdate>,
    reader: ReaderHandle,
}

impl RootUpdater {
    /// Starts the background persistence task.
    ///
    /// The task stops when `cancel` fires or every `RootUpdater` is dropped.
    pub fn spawn(
        writer: WriterHandle,
        reader: ReaderHandle,
        config: &RootUpdaterConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let task = tokio::spawn(run_root_updater(writer, rx, cancel));
        let updater = Self {
            cache: Arc::new(RootCache::new(config.cache_capacity, config.cache_ttl)),
            tx,
            reader,
        };
        (updater, task)
    }

    /// Records a new head. Never blocks and never fails.
    pub fn record(&self, head: &RepoHead) {
        let root = AccountRoot {
            root: head.root,
            rev: head.rev,
        };
        if !self.cache.offer(&head.did, root) {
            return;
        }

        let update = RootUpdate {
            did: head.did.clone(),
            root: head.root,
            rev: head.rev,
        };
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(did = %update.did, rev = %update.rev, "account root queue full; dropping update");
            }
            Err(TrySendError::Closed(update)) => {
                debug!(did = %update.did, "account root updater stopped; dropping update");
            }
        }
    }

    /// Latest known root of `did`: cache first, then storage.
    pub async fn latest(&self, did: &Did) -> Result<Option<AccountRoot>> {
        if let Some(root) = self.cache.get(did) {
            return Ok(Some(root));
        }
        let stored = self.reader.account_root(did.clone()).await?;
        if let Some(root) = stored {
            self.cache.offer(did, root);
        }
        Ok(stored)
    }
}

async fn run_root_updater(
    writer: WriterHandle,
    mut rx: mpsc::Receiver<RootUpdate>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        match writer
            .update_account_root(update.did.clone(), update.root, update.rev)
            .await
        {
            Ok(true) => debug!(did = %update.did, rev = %update.rev, "account root updated"),
            Ok(false) => debug!(did = %update.did, rev = %update.rev, "stale account root ignored"),
            Err(e) => warn!(did = %update.did, error = %e, "failed to persist account root"),
        }
    }
    debug!("account root updater stopped");
}

// =============================================================================
// Tests
// =============================================================================
