//! # Async API for the Repository Host
//!
//! [`RepoHost`] is the public entry point. It wires the write pipeline and the
//! event log together and exposes them as plain async calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               Async Tasks                                │
//! │  create_record / put_record / delete_record / apply_writes  subscribe    │
//! └───────┬───────────────────────────────────────────────────────┬──────────┘
//!         ▼                                                       ▼
//!   WritePreparer ──► RepoTransactor (lock per repo)       SubscriptionHandler
//!                        │         │                              │
//!                        │         └──► RootUpdater (queue)       ▼
//!                        ▼                   │                 Outbox
//!                    Sequencer ◄─────────────┘           (backfill + live)
//!                        │                                   ▲        ▲
//!         ┌──────────────┴──────────────┐                    │        │
//!         ▼                             ▼                    │        │
//!  ┌──────────────┐              ┌─────────────┐             │        │
//!  │ Writer       │── publish ──►│  LiveTail   │─────────────┘        │
//!  │ (1 thread)   │              └─────────────┘                      │
//!  └──────┬───────┘              ┌─────────────┐                      │
//!         │                      │ Reader pool │──────────────────────┘
//!         ▼                      │ (N threads) │
//!  ┌─────────────┐               └──────┬──────┘
//!  │ SQLite (WAL)│◄─────────────────────┘
//!  └─────────────┘
//! ```
//!
//! ## Authorization
//!
//! Authentication happens upstream. Every write call takes the authenticated
//! writer identity and only accepts writes to that writer's own repository.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ed25519_dalek::SigningKey;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commit::{CommitDescriptor, WriteResult};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::events::{AccountEvent, AccountStatus, IdentityEvent, Label, LabelsEvent};
use crate::keys::{generate_signing_key, Keystore};
use crate::prepare::{NoSchemas, PreparedWrite, RecordSwap, RecordValidator, ValidationStatus, WriteOp, WritePreparer};
use crate::reader::{spawn_reader_pool, AccountRoot, ReaderHandle, StoredRecord};
use crate::repo::{CommitOutcome, RepoTransactor, TransactorParts};
use crate::root_updater::RootUpdater;
use crate::schema::Database;
use crate::sequencer::{LiveTail, Sequencer};
use crate::subscription::{FirehoseSubscription, SubscriptionHandler};
use crate::types::{AtUri, Cid, Did, Nsid, RecordKey, RepoHead, Seq, Tid, TidClock};
use crate::writer::{spawn_writer, WriterHandle};

// =============================================================================
// Inputs and Outputs
// =============================================================================

/// Commit reference returned by write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitMeta {
    pub cid: Cid,
    pub rev: Tid,
}

impl From<&CommitDescriptor> for CommitMeta {
    fn from(commit: &CommitDescriptor) -> Self {
        Self {
            cid: commit.cid,
            rev: commit.rev,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRecordInput {
    pub repo: Did,
    pub collection: String,
    /// Record key; a fresh TID when absent.
    pub rkey: Option<String>,
    pub record: Value,
    pub swap_commit: Option<Cid>,
    pub validate: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRecordOutput {
    pub uri: AtUri,
    pub cid: Cid,
    pub commit: Option<CommitMeta>,
    pub validation_status: Option<ValidationStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutRecordInput {
    pub repo: Did,
    pub collection: String,
    pub rkey: String,
    pub record: Value,
    pub swap_commit: Option<Cid>,
    pub swap_record: Option<RecordSwap>,
    pub validate: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutRecordOutput {
    pub uri: AtUri,
    pub cid: Cid,
    /// Absent when the record already had this exact content.
    pub commit: Option<CommitMeta>,
    pub validation_status: Option<ValidationStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRecordInput {
    pub repo: Did,
    pub collection: String,
    pub rkey: String,
    pub swap_commit: Option<Cid>,
    pub swap_record: Option<RecordSwap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteRecordOutput {
    /// Absent when the record did not exist.
    pub commit: Option<CommitMeta>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyWritesInput {
    pub repo: Did,
    pub writes: Vec<WriteOp>,
    pub swap_commit: Option<Cid>,
    pub validate: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyWritesOutput {
    pub commit: Option<CommitMeta>,
    pub results: Vec<WriteResult>,
}

/// A newly created repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoCreated {
    pub commit: CommitDescriptor,
    pub seq: Seq,
}

// =============================================================================
// RepoHost
// =============================================================================

struct HostThreads {
    writer: JoinHandle<()>,
    readers: Vec<JoinHandle<()>>,
    root_updater: tokio::task::JoinHandle<()>,
}

struct HostInner {
    config: HostConfig,
    preparer: WritePreparer,
    transactor: RepoTransactor,
    sequencer: Sequencer,
    subscriptions: SubscriptionHandler,
    root_updater: RootUpdater,
    reader: ReaderHandle,
    writer: WriterHandle,
    cancel: CancellationToken,
    threads: Mutex<Option<HostThreads>>,
}

/// Handle to a running repository host.
///
/// # Thread Safety
///
/// `RepoHost` is `Clone`, `Send` and `Sync`. All clones share the same writer
/// thread, reader pool and repository locks.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use repohost::{CreateRecordInput, Did, HostConfig, MemoryKeystore, RepoHost};
///
/// #[tokio::main]
/// async fn main() -> repohost::Result<()> {
///     let host = RepoHost::open("repos.db", Arc::new(MemoryKeystore::new()), HostConfig::default()).await?;
///     let alice = Did::parse("did:example:alice")?;
///     host.create_repo(&alice).await?;
///
///     let out = host
///         .create_record(&alice, CreateRecordInput {
///             repo: alice.clone(),
///             collection: "app.example.post".into(),
///             rkey: None,
///             record: serde_json::json!({ "text": "hi" }),
///             swap_commit: None,
///             validate: None,
///         })
///         .await?;
///     println!("wrote {}", out.uri);
///
///     host.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RepoHost {
    inner: Arc<HostInner>,
}

impl RepoHost {
    /// Opens or creates a host database at `path` with no record schemas.
    pub async fn open(path: impl AsRef<Path>, keystore: Arc<dyn Keystore>, config: HostConfig) -> Result<Self> {
        Self::open_with_validator(path, keystore, Arc::new(NoSchemas), config).await
    }

    /// Opens or creates a host database with a record schema validator.
    pub async fn open_with_validator(
        path: impl AsRef<Path>,
        keystore: Arc<dyn Keystore>,
        validator: Arc<dyn RecordValidator>,
        config: HostConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::open(path)?;

        let tail = Arc::new(LiveTail::new(config.outbox.broadcast_capacity));
        let (writer, writer_thread) = spawn_writer(db.into_connection(), Arc::clone(&tail), config.writer.clone())?;
        let (reader, reader_threads) = match spawn_reader_pool(path, config.reader_threads) {
            Ok(pool) => pool,
            Err(e) => {
                writer.shutdown().await;
                return Err(e);
            }
        };

        let sequencer = Sequencer::new(writer.clone(), reader.clone(), tail);
        let cancel = CancellationToken::new();
        let (root_updater, root_task) = RootUpdater::spawn(
            writer.clone(),
            reader.clone(),
            &config.root_updater,
            cancel.child_token(),
        );

        let clock = Arc::new(TidClock::new());
        let preparer = WritePreparer::new(Arc::clone(&clock), validator, config.max_record_bytes);
        let transactor = RepoTransactor::new(TransactorParts {
            reader: reader.clone(),
            sequencer: sequencer.clone(),
            keystore,
            root_updater: root_updater.clone(),
            clock,
            max_writes: config.max_writes_per_batch,
            lock_timeout: config.lock_timeout,
            cache_capacity: config.repo_cache_capacity,
        });
        let subscriptions = SubscriptionHandler::new(sequencer.clone(), config.outbox.clone());

        info!(
            path = %path.display(),
            readers = reader_threads.len(),
            current_seq = sequencer.current().map(|s| s.as_raw()),
            "repository host opened"
        );

        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                preparer,
                transactor,
                sequencer,
                subscriptions,
                root_updater,
                reader,
                writer,
                cancel,
                threads: Mutex::new(Some(HostThreads {
                    writer: writer_thread,
                    readers: reader_threads,
                    root_updater: root_task,
                })),
            }),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Repositories
    // -------------------------------------------------------------------------

    /// Creates a repository with a freshly generated signing key.
    pub async fn create_repo(&self, did: &Did) -> Result<RepoCreated> {
        self.create_repo_with_key(did, generate_signing_key()).await
    }

    /// Creates a repository signed by `key`.
    pub async fn create_repo_with_key(&self, did: &Did, key: SigningKey) -> Result<RepoCreated> {
        let (commit, seq) = self.inner.transactor.create_repo(did, key).await?;
        Ok(RepoCreated { commit, seq })
    }

    /// Current head of a repository.
    pub async fn get_head(&self, did: &Did) -> Result<Option<RepoHead>> {
        self.inner.transactor.head(did).await
    }

    /// Latest root recorded for an account. May briefly lag the head.
    pub async fn latest_root(&self, did: &Did) -> Result<Option<AccountRoot>> {
        self.inner.root_updater.latest(did).await
    }

    pub async fn get_record(&self, did: &Did, collection: &str, rkey: &str) -> Result<Option<StoredRecord>> {
        let uri = AtUri::new(did.clone(), Nsid::parse(collection)?, RecordKey::parse(rkey)?);
        self.inner.reader.get_record(uri).await
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    fn authorize(&self, writer: &Did, repo: &Did) -> Result<()> {
        if writer != repo {
            return Err(Error::Unauthorized {
                writer: writer.to_string(),
                repo: repo.to_string(),
            });
        }
        Ok(())
    }

    async fn apply_one(&self, did: &Did, write: PreparedWrite, swap_commit: Option<Cid>) -> Result<(WriteResult, Option<CommitMeta>)> {
        let outcome = self.inner.transactor.apply(did, vec![write], swap_commit).await?;
        let commit = outcome.commit.as_ref().map(CommitMeta::from);
        let result = outcome
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::Storage("commit returned no write result".to_string()))?;
        Ok((result, commit))
    }

    pub async fn create_record(&self, writer: &Did, input: CreateRecordInput) -> Result<CreateRecordOutput> {
        self.authorize(writer, &input.repo)?;
        let write = self.inner.preparer.prepare_create(
            &input.repo,
            &input.collection,
            input.rkey.as_deref(),
            input.record,
            input.validate,
        )?;
        let cid = record_cid(&write)?;
        let (result, commit) = self.apply_one(&input.repo, write, input.swap_commit).await?;
        Ok(CreateRecordOutput {
            uri: result.uri,
            cid,
            commit,
            validation_status: result.validation,
        })
    }

    /// Writes a record, creating it if it does not exist.
    ///
    /// Writing the content a record already has is a no-op: no commit, no
    /// event.
    pub async fn put_record(&self, writer: &Did, input: PutRecordInput) -> Result<PutRecordOutput> {
        self.authorize(writer, &input.repo)?;
        let write = self.inner.preparer.prepare_update(
            &input.repo,
            &input.collection,
            &input.rkey,
            input.record,
            input.swap_record,
            input.validate,
        )?;
        let cid = record_cid(&write)?;
        let (result, commit) = self.apply_one(&input.repo, write, input.swap_commit).await?;
        Ok(PutRecordOutput {
            uri: result.uri,
            cid,
            commit,
            validation_status: result.validation,
        })
    }

    /// Deletes a record. Deleting a missing record is a no-op.
    pub async fn delete_record(&self, writer: &Did, input: DeleteRecordInput) -> Result<DeleteRecordOutput> {
        self.authorize(writer, &input.repo)?;
        let write = self.inner.preparer.prepare_delete(
            &input.repo,
            &input.collection,
            &input.rkey,
            input.swap_record,
        )?;
        let (_, commit) = self.apply_one(&input.repo, write, input.swap_commit).await?;
        Ok(DeleteRecordOutput { commit })
    }

    /// Applies a batch of writes atomically.
    pub async fn apply_writes(&self, writer: &Did, input: ApplyWritesInput) -> Result<ApplyWritesOutput> {
        self.authorize(writer, &input.repo)?;
        let max = self.inner.config.max_writes_per_batch;
        if input.writes.len() > max {
            return Err(Error::TooManyWrites {
                count: input.writes.len(),
                max,
            });
        }

        let writes = self
            .inner
            .preparer
            .prepare_batch(&input.repo, input.writes, input.validate)?;
        let CommitOutcome { commit, results, .. } = self
            .inner
            .transactor
            .apply(&input.repo, writes, input.swap_commit)
            .await?;
        Ok(ApplyWritesOutput {
            commit: commit.as_ref().map(CommitMeta::from),
            results,
        })
    }

    // -------------------------------------------------------------------------
    // Event Log
    // -------------------------------------------------------------------------

    /// Highest sequence number assigned so far.
    pub fn current_seq(&self) -> Option<Seq> {
        self.inner.sequencer.current()
    }

    /// Subscribes to the event log.
    ///
    /// The subscription ends when `cancel` fires, when it is dropped, or when
    /// the host shuts down.
    pub async fn subscribe_repos(&self, cursor: Option<u64>, cancel: CancellationToken) -> Result<FirehoseSubscription> {
        let token = self.inner.cancel.child_token();
        let subscription = self.inner.subscriptions.subscribe_repos(cursor, token.clone()).await?;

        // Only linked once the cursor was accepted; ends with the subscription.
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
        Ok(subscription)
    }

    pub async fn sequence_account_status(&self, did: &Did, active: bool, status: Option<AccountStatus>) -> Result<Seq> {
        self.inner
            .sequencer
            .sequence_account(AccountEvent {
                did: did.clone(),
                active,
                status,
            })
            .await
    }

    pub async fn sequence_identity(&self, did: &Did, handle: Option<String>) -> Result<Seq> {
        self.inner
            .sequencer
            .sequence_identity(IdentityEvent {
                did: did.clone(),
                handle,
            })
            .await
    }

    pub async fn sequence_labels(&self, labels: Vec<Label>) -> Result<Seq> {
        self.inner.sequencer.sequence_labels(LabelsEvent { labels }).await
    }

    /// Removes every event of `did` from the log.
    ///
    /// Live subscribers are not told. The freed sequence numbers are never
    /// handed out again.
    pub async fn delete_repo_events(&self, did: &Did) -> Result<u64> {
        let removed = self.inner.sequencer.delete_all_for_repo(did).await?;
        info!(did = %did, removed, "repository events deleted");
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stops background work and waits for the writer and readers to exit.
    ///
    /// Pending writes are flushed first. Calls on any clone fail with
    /// `Closed` afterwards. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        let threads = match self.inner.threads.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(threads) = threads else {
            return;
        };

        self.inner.cancel.cancel();
        if let Err(e) = threads.root_updater.await {
            warn!(error = %e, "account root updater task failed");
        }

        self.inner.reader.shutdown(threads.readers.len()).await;
        self.inner.writer.shutdown().await;

        let joined = tokio::task::spawn_blocking(move || {
            for handle in threads.readers {
                let _ = handle.join();
            }
            threads.writer.join().is_ok()
        })
        .await;
        match joined {
            Ok(true) => debug!("repository host stopped"),
            Ok(false) => warn!("writer thread panicked"),
            Err(e) => warn!(error = %e, "failed to join host threads"),
        }
    }
}

fn record_cid(write: &PreparedWrite) -> Result<Cid> {
    write
        .cid()
        .ok_or_else(|| Error::InvalidRequest(format!("write to {} carries no record", write.uri())))
}

// =============================================================================
// Tests
// =============================================================================
