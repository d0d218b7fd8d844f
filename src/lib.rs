//! # repohost - Repository Write Pipeline and Event Sequencer
//!
//! repohost hosts user repositories for a federated data network. It provides:
//!
//! - **Atomic repository writes**: batches of up to 200 creates, updates and
//!   deletes land in one signed commit, or not at all
//! - **Optimistic concurrency**: `swapCommit` and `swapRecord` preconditions
//! - **A durable global event log**: gapless, strictly increasing sequence
//!   numbers that survive restarts
//! - **A resumable firehose**: subscribers backfill from any cursor and then
//!   follow the live tail without gaps or duplicates
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │      (create/put/delete record, apply writes, subscribe)        │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐   ┌─────────────────────────────┐
//! │  Write Preparer               │   │  Subscription Handler       │
//! │  Repo Transaction Coordinator │   │  Outbox (backfill + live)   │
//! │  Commit Builder (signing)     │   └──────────────┬──────────────┘
//! └───────────────┬───────────────┘                  │
//!                 ▼                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Sequencer / Writer Actor                        │
//! │       (single thread, owns write connection, group commit)      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite (WAL)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One writer per repository**: writes to the same repository never
//!    interleave; different repositories proceed in parallel
//! 2. **Durable ordering**: `seq` strictly increases and is never reused,
//!    not even after events are deleted
//! 3. **Revision order**: a repository's `rev` strictly increases with every
//!    commit, and its events appear in the log in commit order
//! 4. **Memory never leads disk**: the live head moves only after COMMIT
//! 5. **Exact resume**: a subscriber at cursor C sees exactly the events with
//!    `seq > C`, in order
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum and stable caller-facing codes
//! - [`config`]: Tunables with defaults and environment overrides
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Identifiers, content hashes, revision tokens, sequence numbers
//! - [`codec`]: Canonical JSON and checksums
//! - [`events`]: Event log payloads
//! - [`keys`]: Signing keys
//! - [`prepare`]: Write validation and normalization
//! - [`tree`]: Record tree
//! - [`commit`]: Commit building and signing
//! - [`repo`]: Per-repository transaction coordinator
//! - [`writer`]: Writer actor with group commit
//! - [`reader`]: Read pool
//! - [`sequencer`]: Event log front and live tail
//! - [`root_updater`]: Best-effort account root tracking
//! - [`outbox`]: Per-subscriber backfill and live delivery
//! - [`subscription`]: Firehose subscriptions
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for repohost operations.
pub mod error;

/// Configuration structs and defaults.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types.
///
/// Uses the newtype pattern so a DID can never be passed where a collection
/// name is expected, and a sequence number never where a revision is.
pub mod types;

/// Canonical encoding and checksums.
pub mod codec;

/// Event log payloads.
pub mod events;

/// Signing key storage.
pub mod keys;

/// Write preparation: validates requested mutations and computes record
/// hashes before any lock is taken.
pub mod prepare;

/// Record tree of a repository.
pub mod tree;

/// Commit building and signing.
pub mod commit;

/// Repository transaction coordinator.
pub mod repo;

/// Writer actor with group commit.
///
/// One dedicated thread owns the only read-write connection. Requests are
/// collected over a short window and executed in one transaction, each inside
/// its own SAVEPOINT so one failure does not affect the others.
pub mod writer;

/// Read operations on a pool of read-only connections.
pub mod reader;

/// Sequencer and live tail.
pub mod sequencer;

/// Best-effort account root updater.
pub mod root_updater;

/// Backfill-then-live delivery for one subscriber.
pub mod outbox;

/// Firehose subscriptions.
pub mod subscription;

/// Async API for repohost.
///
/// The main entry point is [`RepoHost`](api::RepoHost).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{
    ApplyWritesInput, ApplyWritesOutput, CommitMeta, CreateRecordInput, CreateRecordOutput,
    DeleteRecordInput, DeleteRecordOutput, PutRecordInput, PutRecordOutput, RepoCreated, RepoHost,
};
pub use commit::{CommitDescriptor, WriteResult};
pub use config::{HostConfig, OutboxConfig, RootUpdaterConfig, WriterConfig};
pub use error::{Error, Result};
pub use events::{
    AccountEvent, AccountStatus, CommitEvent, EventBody, EventKind, IdentityEvent, Label,
    LabelsEvent, RepoOp, SequencedEvent,
};
pub use keys::{Keystore, MemoryKeystore};
pub use prepare::{
    NoSchemas, RecordSwap, RecordValidator, SchemaCheck, ValidationStatus, WriteAction, WriteOp,
};
pub use reader::{AccountRoot, StoredRecord};
pub use schema::Database;
pub use subscription::{FirehoseSubscription, Frame};
pub use types::{AtUri, Cid, Did, Nsid, RecordKey, RepoHead, Seq, Tid};
