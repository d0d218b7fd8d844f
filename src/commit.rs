//! # Commit Builder
//!
//! Applies a batch of prepared writes to a staged copy of a repository's
//! record tree and, if anything changed, produces a signed commit.
//!
//! ```text
//!  RepoSnapshot (committed)          PreparedWrite[]
//!        │ clone                           │
//!        ▼                                 ▼
//!   staged RecordTree  ◄──── apply each write in order
//!        │
//!        ├── no effective ops? ──► BuildOutcome { commit: None }
//!        │
//!        ▼
//!   data = tree.root()
//!   rev  = clock.next_after(head.rev)
//!   sig  = ed25519(canonical({did, version, data, rev, prev}))
//!   cid  = hash(canonical(signed commit))
//!        │
//!        ▼
//!   BuiltCommit { descriptor, data (what to persist), snapshot (next state) }
//! ```
//!
//! The builder does no I/O. The repository coordinator runs it while holding
//! the repository lock and hands [`CommitData`] to the sequencer, which
//! persists the head move, records and event in one transaction.

use std::collections::{BTreeMap, HashMap};

use data_encoding::BASE64URL_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::codec::encode_canonical;
use crate::error::{Error, Result};
use crate::events::{CommitEvent, RepoOp};
use crate::keys::key_ref;
use crate::prepare::{PreparedRecord, PreparedWrite, ValidationStatus, WriteAction};
use crate::tree::RecordTree;
use crate::types::{AtUri, Cid, Did, Nsid, RecordKey, RepoHead, Tid, TidClock};

/// Repository format version written into every commit.
pub const COMMIT_VERSION: u8 = 3;

// =============================================================================
// Commit Objects
// =============================================================================

/// The fields covered by the signature.
#[derive(Serialize)]
struct UnsignedCommit<'a> {
    did: &'a Did,
    version: u8,
    data: Cid,
    rev: Tid,
    prev: Option<Cid>,
}

/// A signed commit as stored in `repo_block`.
///
/// `sig` is the base64url Ed25519 signature over the canonical encoding of
/// the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommit {
    pub did: Did,
    pub version: u8,
    pub data: Cid,
    pub rev: Tid,
    pub prev: Option<Cid>,
    pub sig: String,
}

impl SignedCommit {
    fn sign(did: &Did, data: Cid, rev: Tid, prev: Option<Cid>, key: &SigningKey) -> Result<Self> {
        let unsigned = UnsignedCommit {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
        };
        let signature = key.sign(&encode_canonical(&unsigned)?);
        Ok(Self {
            did: did.clone(),
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig: BASE64URL_NOPAD.encode(&signature.to_bytes()),
        })
    }

    /// Checks the signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let raw = BASE64URL_NOPAD
            .decode(self.sig.as_bytes())
            .map_err(|e| Error::Corruption(format!("commit signature is not base64url: {e}")))?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Corruption(format!("commit signature is {} bytes", raw.len())))?;

        let unsigned = UnsignedCommit {
            did: &self.did,
            version: self.version,
            data: self.data,
            rev: self.rev,
            prev: self.prev,
        };
        key.verify_strict(&encode_canonical(&unsigned)?, &Signature::from_bytes(&bytes))
            .map_err(|_| Error::Corruption(format!("bad signature on commit {} of {}", self.rev, self.did)))
    }

    /// Parses a stored commit block.
    pub fn decode(block: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(block)?)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A repository's committed head together with its record tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoSnapshot {
    pub head: RepoHead,
    pub tree: RecordTree,
}

// =============================================================================
// Outputs
// =============================================================================

/// A record row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordPut {
    pub collection: Nsid,
    pub rkey: RecordKey,
    pub cid: Cid,
    pub content: Vec<u8>,
}

/// A record row to remove.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDelete {
    pub collection: Nsid,
    pub rkey: RecordKey,
}

/// Everything the storage layer must persist for one commit.
///
/// # Systems Concept: Single Transaction
///
/// The head move, the commit block, the record rows and the event are written
/// together. A reader never observes a head whose records or event are missing.
#[derive(Debug, Clone)]
pub struct CommitData {
    pub did: Did,
    /// Head root the commit builds on; `None` for a repository's first commit.
    /// Storage moves the head only if it still equals this value.
    pub prev_root: Option<Cid>,
    pub head: RepoHead,
    /// Encoded [`SignedCommit`].
    pub block: Vec<u8>,
    pub puts: Vec<RecordPut>,
    pub deletes: Vec<RecordDelete>,
    pub event: CommitEvent,
}

/// What one requested write ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    /// The effective action. An update of a missing record reports `Create`.
    pub action: WriteAction,
    pub uri: AtUri,
    pub cid: Option<Cid>,
    pub validation: Option<ValidationStatus>,
    /// True when the write left the repository unchanged.
    pub no_op: bool,
}

/// Summary of a new commit returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitDescriptor {
    pub did: Did,
    /// Cid of the signed commit; the new head root.
    pub cid: Cid,
    pub rev: Tid,
    /// Head root before this commit.
    pub prev: Option<Cid>,
    /// Record tree root after the commit.
    pub data: Cid,
    pub prev_data: Option<Cid>,
}

/// A commit ready to persist.
#[derive(Debug, Clone)]
pub struct BuiltCommit {
    pub descriptor: CommitDescriptor,
    pub data: CommitData,
    /// The state the repository is in once `data` is persisted.
    pub snapshot: RepoSnapshot,
}

/// Result of applying a batch.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// `None` when every write was a no-op.
    pub commit: Option<BuiltCommit>,
    /// One entry per input write, in input order.
    pub results: Vec<WriteResult>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builds commits for repositories.
pub struct CommitBuilder<'a> {
    clock: &'a TidClock,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(clock: &'a TidClock) -> Self {
        Self { clock }
    }

    /// Builds the empty first commit of a new repository.
    pub fn genesis(&self, did: &Did, key: &SigningKey) -> Result<BuiltCommit> {
        let tree = RecordTree::new();
        let data = tree.root();
        let rev = self.clock.next();
        let signed = SignedCommit::sign(did, data, rev, None, key)?;
        let block = encode_canonical(&signed)?;
        let cid = Cid::for_bytes(&block);

        let head = RepoHead {
            did: did.clone(),
            root: cid,
            data,
            rev,
            key_ref: key_ref(&key.verifying_key()),
        };
        let event = CommitEvent {
            repo: did.clone(),
            commit: cid,
            rev,
            since: None,
            data,
            prev_data: None,
            ops: Vec::new(),
        };

        Ok(BuiltCommit {
            descriptor: CommitDescriptor {
                did: did.clone(),
                cid,
                rev,
                prev: None,
                data,
                prev_data: None,
            },
            data: CommitData {
                did: did.clone(),
                prev_root: None,
                head: head.clone(),
                block,
                puts: Vec::new(),
                deletes: Vec::new(),
                event,
            },
            snapshot: RepoSnapshot { head, tree },
        })
    }

    /// Applies `writes` in order on top of `snapshot`.
    ///
    /// Each write's record precondition is checked against the staged tree as
    /// it stands when the write is reached, so a delete followed by a create
    /// of the same key succeeds and two creates of the same key do not.
    pub fn build(
        &self,
        snapshot: &RepoSnapshot,
        writes: &[PreparedWrite],
        key: &SigningKey,
    ) -> Result<BuildOutcome> {
        let mut tree = snapshot.tree.clone();
        let mut ops = Vec::with_capacity(writes.len());
        let mut results = Vec::with_capacity(writes.len());
        // Latest content staged per path, for the record rows.
        let mut staged: HashMap<String, &PreparedRecord> = HashMap::new();
        let mut touched: BTreeMap<String, (Nsid, RecordKey)> = BTreeMap::new();

        for write in writes {
            let uri = write.uri();
            let path = uri.path();
            if let Some(swap) = write.swap() {
                swap.check(uri, tree.get(&path))?;
            }

            let (action, applied) = match write {
                PreparedWrite::Create(rec) => {
                    if let Some(existing) = tree.get(&path) {
                        return Err(Error::BadRecordSwap {
                            uri: uri.to_string(),
                            expected: None,
                            actual: Some(existing.to_string()),
                        });
                    }
                    tree.insert(path.clone(), rec.cid);
                    staged.insert(path.clone(), rec);
                    (WriteAction::Create, true)
                }
                PreparedWrite::Update(rec) => match tree.get(&path) {
                    Some(current) if current == rec.cid => (WriteAction::Update, false),
                    Some(_) => {
                        tree.insert(path.clone(), rec.cid);
                        staged.insert(path.clone(), rec);
                        (WriteAction::Update, true)
                    }
                    None => {
                        tree.insert(path.clone(), rec.cid);
                        staged.insert(path.clone(), rec);
                        (WriteAction::Create, true)
                    }
                },
                PreparedWrite::Delete(_) => {
                    let removed = tree.remove(&path).is_some();
                    if removed {
                        staged.remove(&path);
                    }
                    (WriteAction::Delete, removed)
                }
            };

            let validation = match write {
                PreparedWrite::Create(rec) | PreparedWrite::Update(rec) => Some(rec.validation),
                PreparedWrite::Delete(_) => None,
            };
            results.push(WriteResult {
                action,
                uri: uri.clone(),
                cid: write.cid(),
                validation,
                no_op: !applied,
            });

            if applied {
                touched.insert(path.clone(), (uri.collection.clone(), uri.rkey.clone()));
                ops.push(RepoOp {
                    action,
                    path,
                    cid: write.cid(),
                });
            }
        }

        // Steps that cancel out (create then delete of one key) leave the
        // tree where it started; nothing is signed or sequenced.
        let data = tree.root();
        if ops.is_empty() || data == snapshot.head.data {
            for result in &mut results {
                result.no_op = true;
            }
            return Ok(BuildOutcome {
                commit: None,
                results,
            });
        }

        // Persist the net effect per path, not every intermediate step.
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (path, (collection, rkey)) in touched {
            match (tree.get(&path), staged.get(&path)) {
                (Some(cid), Some(rec)) => puts.push(RecordPut {
                    collection,
                    rkey,
                    cid,
                    content: rec.bytes.clone(),
                }),
                (None, _) if snapshot.tree.get(&path).is_some() => {
                    deletes.push(RecordDelete { collection, rkey })
                }
                _ => {}
            }
        }

        let head = &snapshot.head;
        let rev = self.clock.next_after(&head.rev);
        let signed = SignedCommit::sign(&head.did, data, rev, Some(head.root), key)?;
        let block = encode_canonical(&signed)?;
        let cid = Cid::for_bytes(&block);

        let next_head = RepoHead {
            did: head.did.clone(),
            root: cid,
            data,
            rev,
            key_ref: key_ref(&key.verifying_key()),
        };
        let event = CommitEvent {
            repo: head.did.clone(),
            commit: cid,
            rev,
            since: Some(head.rev),
            data,
            prev_data: Some(head.data),
            ops,
        };

        Ok(BuildOutcome {
            commit: Some(BuiltCommit {
                descriptor: CommitDescriptor {
                    did: head.did.clone(),
                    cid,
                    rev,
                    prev: Some(head.root),
                    data,
                    prev_data: Some(head.data),
                },
                data: CommitData {
                    did: head.did.clone(),
                    prev_root: Some(head.root),
                    head: next_head.clone(),
                    block,
                    puts,
                    deletes,
                    event,
                },
                snapshot: RepoSnapshot {
                    head: next_head,
                    tree,
                },
            }),
            results,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::prepare::{NoSchemas, RecordSwap, WritePreparer};

    const POSTS: &str = "app.example.post";

    struct Fixture {
        clock: Arc<TidClock>,
        preparer: WritePreparer,
        key: SigningKey,
        did: Did,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(TidClock::with_clock_id(1));
        Fixture {
            preparer: WritePreparer::new(clock.clone(), Arc::new(NoSchemas), 4096),
            clock,
            key: SigningKey::from_bytes(&[9u8; 32]),
            did: Did::parse("did:example:alice").unwrap(),
        }
    }

    impl Fixture {
        fn genesis(&self) -> RepoSnapshot {
            CommitBuilder::new(&self.clock)
                .genesis(&self.did, &self.key)
                .unwrap()
                .snapshot
        }

        fn create(&self, rkey: &str, text: &str) -> PreparedWrite {
            self.preparer
                .prepare_create(&self.did, POSTS, Some(rkey), json!({ "text": text }), None)
                .unwrap()
        }

        fn update(&self, rkey: &str, text: &str) -> PreparedWrite {
            self.preparer
                .prepare_update(&self.did, POSTS, rkey, json!({ "text": text }), None, None)
                .unwrap()
        }

        fn delete(&self, rkey: &str) -> PreparedWrite {
            self.preparer.prepare_delete(&self.did, POSTS, rkey, None).unwrap()
        }

        fn build(&self, snapshot: &RepoSnapshot, writes: &[PreparedWrite]) -> Result<BuildOutcome> {
            CommitBuilder::new(&self.clock).build(snapshot, writes, &self.key)
        }
    }

    #[test]
    fn test_genesis_commit_is_signed_and_empty() {
        let f = fixture();
        let built = CommitBuilder::new(&f.clock).genesis(&f.did, &f.key).unwrap();

        assert!(built.data.prev_root.is_none());
        assert!(built.data.event.since.is_none());
        assert!(built.data.event.ops.is_empty());
        assert_eq!(built.descriptor.cid, Cid::for_bytes(&built.data.block));
        assert_eq!(built.snapshot.head.data, RecordTree::new().root());

        let signed = SignedCommit::decode(&built.data.block).unwrap();
        signed.verify(&f.key.verifying_key()).unwrap();
        assert_eq!(signed.version, COMMIT_VERSION);
    }

    #[test]
    fn test_commit_links_to_previous_head() {
        let f = fixture();
        let genesis = f.genesis();
        let outcome = f.build(&genesis, &[f.create("a", "hello")]).unwrap();
        let built = outcome.commit.unwrap();

        assert_eq!(built.descriptor.prev, Some(genesis.head.root));
        assert_eq!(built.data.prev_root, Some(genesis.head.root));
        assert!(built.descriptor.rev > genesis.head.rev);
        assert_eq!(built.data.event.since, Some(genesis.head.rev));
        assert_eq!(built.data.event.prev_data, Some(genesis.head.data));
        assert_eq!(built.data.puts.len(), 1);
        assert_eq!(built.snapshot.tree.len(), 1);
        // The committed snapshot was not touched.
        assert!(genesis.tree.is_empty());
    }

    #[test]
    fn test_tampered_commit_fails_verification() {
        let f = fixture();
        let genesis = f.genesis();
        let built = f.build(&genesis, &[f.create("a", "x")]).unwrap().commit.unwrap();

        let mut signed = SignedCommit::decode(&built.data.block).unwrap();
        signed.data = Cid::for_bytes(b"something else");
        assert!(matches!(
            signed.verify(&f.key.verifying_key()),
            Err(Error::Corruption(_))
        ));

        let other = SigningKey::from_bytes(&[1u8; 32]);
        let signed = SignedCommit::decode(&built.data.block).unwrap();
        assert!(signed.verify(&other.verifying_key()).is_err());
    }

    #[test]
    fn test_identical_update_is_noop() {
        let f = fixture();
        let genesis = f.genesis();
        let first = f.build(&genesis, &[f.create("a", "same")]).unwrap().commit.unwrap();

        let outcome = f.build(&first.snapshot, &[f.update("a", "same")]).unwrap();
        assert!(outcome.commit.is_none());
        assert!(outcome.results[0].no_op);
        assert_eq!(outcome.results[0].action, WriteAction::Update);
    }

    #[test]
    fn test_delete_of_missing_record_is_noop() {
        let f = fixture();
        let outcome = f.build(&f.genesis(), &[f.delete("missing")]).unwrap();
        assert!(outcome.commit.is_none());
        assert!(outcome.results[0].no_op);
        assert!(outcome.results[0].cid.is_none());
    }

    #[test]
    fn test_update_of_missing_record_reports_create() {
        let f = fixture();
        let outcome = f.build(&f.genesis(), &[f.update("new", "hi")]).unwrap();
        assert_eq!(outcome.results[0].action, WriteAction::Create);
        let built = outcome.commit.unwrap();
        assert_eq!(built.data.event.ops[0].action, WriteAction::Create);
    }

    #[test]
    fn test_mixed_batch_commits_only_effective_ops() {
        let f = fixture();
        let genesis = f.genesis();
        let base = f.build(&genesis, &[f.create("a", "one")]).unwrap().commit.unwrap();

        let outcome = f
            .build(
                &base.snapshot,
                &[f.update("a", "one"), f.create("b", "two"), f.delete("zzz")],
            )
            .unwrap();

        let no_ops: Vec<bool> = outcome.results.iter().map(|r| r.no_op).collect();
        assert_eq!(no_ops, vec![true, false, true]);
        let built = outcome.commit.unwrap();
        assert_eq!(built.data.event.ops.len(), 1);
        assert_eq!(built.data.event.ops[0].path, "app.example.post/b");
    }

    #[test]
    fn test_duplicate_create_in_batch_fails() {
        let f = fixture();
        let err = f
            .build(&f.genesis(), &[f.create("a", "1"), f.create("a", "2")])
            .unwrap_err();
        assert_eq!(err.code(), "InvalidSwap");
    }

    #[test]
    fn test_record_swap_checked_against_staged_tree() {
        let f = fixture();
        let base = f
            .build(&f.genesis(), &[f.create("a", "1")])
            .unwrap()
            .commit
            .unwrap();

        // Delete then re-create the same key in one batch.
        let outcome = f
            .build(&base.snapshot, &[f.delete("a"), f.create("a", "2")])
            .unwrap();
        assert!(outcome.commit.is_some());

        // An update expecting a stale cid fails.
        let stale = f
            .preparer
            .prepare_update(
                &f.did,
                POSTS,
                "a",
                json!({ "text": "3" }),
                Some(RecordSwap::MustMatch(Cid::for_bytes(b"stale"))),
                None,
            )
            .unwrap();
        let err = f.build(&base.snapshot, &[stale]).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_create_then_delete_commits_nothing() {
        let f = fixture();
        let genesis = f.genesis();
        let outcome = f
            .build(&genesis, &[f.create("a", "1"), f.delete("a")])
            .unwrap();

        assert!(outcome.commit.is_none());
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.no_op));
        assert_eq!(outcome.results[0].action, WriteAction::Create);
        assert_eq!(outcome.results[1].action, WriteAction::Delete);
    }

    #[test]
    fn test_delete_then_recreate_with_same_content_commits_nothing() {
        let f = fixture();
        let base = f
            .build(&f.genesis(), &[f.create("a", "1")])
            .unwrap()
            .commit
            .unwrap();

        let outcome = f
            .build(&base.snapshot, &[f.delete("a"), f.create("a", "1")])
            .unwrap();
        assert!(outcome.commit.is_none());
        assert!(outcome.results.iter().all(|r| r.no_op));
    }

    #[test]
    fn test_delete_existing_record() {
        let f = fixture();
        let base = f
            .build(&f.genesis(), &[f.create("a", "1")])
            .unwrap()
            .commit
            .unwrap();
        let built = f.build(&base.snapshot, &[f.delete("a")]).unwrap().commit.unwrap();

        assert_eq!(built.data.deletes.len(), 1);
        assert!(built.data.event.ops[0].cid.is_none());
        assert!(built.snapshot.tree.is_empty());
    }
}
