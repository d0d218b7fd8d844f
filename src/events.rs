//! # Sequenced Events
//!
//! The payloads that go into the global event log. Every event kind is one
//! variant of [`EventBody`]; the log row stores the kind in its own column so
//! it can be filtered without decoding the payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::prepare::WriteAction;
use crate::types::{Cid, Did, Seq, Tid};

// =============================================================================
// Event Kinds
// =============================================================================

/// The kind tag stored in `repo_seq.event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Commit,
    Account,
    Identity,
    Labels,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::Account => "account",
            EventKind::Identity => "identity",
            EventKind::Labels => "labels",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "commit" => Ok(EventKind::Commit),
            "account" => Ok(EventKind::Account),
            "identity" => Ok(EventKind::Identity),
            "labels" => Ok(EventKind::Labels),
            other => Err(Error::Corruption(format!("unknown event type '{other}'"))),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// One record-level change inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOp {
    pub action: WriteAction,
    /// `<collection>/<rkey>`
    pub path: String,
    /// New cid for creates and updates, `None` for deletes.
    pub cid: Option<Cid>,
}

/// A repository commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub repo: Did,
    /// Cid of the signed commit (the new repository root).
    pub commit: Cid,
    pub rev: Tid,
    /// Revision of the previous commit; `None` for a repository's first commit.
    pub since: Option<Tid>,
    /// Record tree root after the commit.
    pub data: Cid,
    /// Record tree root before the commit.
    pub prev_data: Option<Cid>,
    pub ops: Vec<RepoOp>,
}

/// Hosting status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Takendown,
    Suspended,
    Deleted,
    Deactivated,
}

/// A change to an account's hosting status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub did: Did,
    pub active: bool,
    pub status: Option<AccountStatus>,
}

/// A change to an account's identity (handle or key material).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEvent {
    pub did: Did,
    pub handle: Option<String>,
}

/// A single moderation label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Labeler identity.
    pub src: Did,
    /// Subject of the label (record uri or did).
    pub uri: String,
    pub val: String,
    /// True when the label negates an earlier one.
    #[serde(default)]
    pub neg: bool,
    pub created_ms: u64,
}

/// A batch of labels emitted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelsEvent {
    pub labels: Vec<Label>,
}

/// Kind-specific event payload.
///
/// # Rust Pattern: Internally Tagged Enum
///
/// `#[serde(tag = "$type")]` writes the variant name into the JSON object
/// itself: `{"$type":"commit","repo":...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "lowercase")]
pub enum EventBody {
    Commit(CommitEvent),
    Account(AccountEvent),
    Identity(IdentityEvent),
    Labels(LabelsEvent),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Commit(_) => EventKind::Commit,
            EventBody::Account(_) => EventKind::Account,
            EventBody::Identity(_) => EventKind::Identity,
            EventBody::Labels(_) => EventKind::Labels,
        }
    }

    /// The repository the event concerns. Label batches have none.
    pub fn did(&self) -> Option<&Did> {
        match self {
            EventBody::Commit(c) => Some(&c.repo),
            EventBody::Account(a) => Some(&a.did),
            EventBody::Identity(i) => Some(&i.did),
            EventBody::Labels(_) => None,
        }
    }
}

// =============================================================================
// Log Entries
// =============================================================================

/// One entry of the global event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: Seq,
    /// Insertion time in milliseconds since the epoch.
    pub time_ms: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

impl SequencedEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn did(&self) -> Option<&Did> {
        self.body.did()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Did {
        Did::parse("did:example:alice").unwrap()
    }

    #[test]
    fn test_kind_strings() {
        for kind in [
            EventKind::Commit,
            EventKind::Account,
            EventKind::Identity,
            EventKind::Labels,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(matches!(EventKind::parse("tombstone"), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_commit_event_json_shape() {
        let event = SequencedEvent {
            seq: Seq::from_raw(7),
            time_ms: 1_000,
            body: EventBody::Commit(CommitEvent {
                repo: alice(),
                commit: Cid::for_bytes(b"commit"),
                rev: Tid::from_parts(5, 0),
                since: None,
                data: Cid::for_bytes(b"data"),
                prev_data: None,
                ops: vec![RepoOp {
                    action: WriteAction::Create,
                    path: "app.example.post/3abc".into(),
                    cid: Some(Cid::for_bytes(b"rec")),
                }],
            }),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["$type"], "commit");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["repo"], "did:example:alice");
        assert_eq!(value["ops"][0]["action"], "create");

        let back: SequencedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), EventKind::Commit);
        assert_eq!(back.did(), Some(&alice()));
    }

    #[test]
    fn test_labels_have_no_repository() {
        let body = EventBody::Labels(LabelsEvent {
            labels: vec![Label {
                src: alice(),
                uri: "at://did:example:bob/app.example.post/1".into(),
                val: "spam".into(),
                neg: false,
                created_ms: 1,
            }],
        });
        assert_eq!(body.kind(), EventKind::Labels);
        assert!(body.did().is_none());
    }
}
