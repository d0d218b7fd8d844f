//! # Error Handling for repohost
//!
//! A single error enum ([`Error`]) covers every failure mode of the write
//! pipeline and the event stream. Callers branch on the stable string returned
//! by [`Error::code`] rather than on Rust variants when they need to surface a
//! failure over the wire.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Validation | `InvalidRecord`, `TooManyWrites` | Fix input and retry |
//! | Conflict | `BadCommitSwap`, `BadRecordSwap` | Reload state and retry |
//! | Stream | `FutureCursor`, `ConsumerTooSlow` | Pick a valid cursor / reconnect |
//! | Internal | SQLite error, checksum mismatch | Log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in repohost operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors (detected before any mutation)
    // =========================================================================

    /// The record payload failed shape or schema validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A malformed identifier or argument (did, collection, record key).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A batch carried more writes than a single commit may hold.
    ///
    /// # Why a Limit?
    ///
    /// The repository lock is held for the whole batch. Bounding the batch
    /// bounds the time every other writer to the same repository waits.
    #[error("too many writes: {count} exceeds the maximum of {max}")]
    TooManyWrites {
        /// Number of writes requested
        count: usize,
        /// Maximum allowed per batch
        max: usize,
    },

    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// The caller's expected repository root did not match the current head.
    ///
    /// # Systems Concept: Compare-and-Swap
    ///
    /// The caller read the head, built a write against it, and asks us to
    /// apply it only if nobody else committed in between. Nothing is mutated
    /// when the check fails.
    #[error("commit swap failed for {repo}: expected root {expected}, found {actual}")]
    BadCommitSwap {
        /// Repository identity
        repo: String,
        /// The root the caller expected
        expected: String,
        /// The root actually found
        actual: String,
    },

    /// The caller's expected record cid did not match the current record.
    ///
    /// `None` on either side means "no record".
    #[error("record swap failed for {uri}: expected {}, found {}", display_opt(.expected), display_opt(.actual))]
    BadRecordSwap {
        /// Record address
        uri: String,
        /// The cid the caller expected
        expected: Option<String>,
        /// The cid actually found
        actual: Option<String>,
    },

    /// A repository with this identity already has a head.
    #[error("repository already exists: {0}")]
    RepoAlreadyExists(String),

    // =========================================================================
    // Lookup and Authorization
    // =========================================================================

    /// No head exists for the repository.
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    /// No signing key is registered for the repository.
    #[error("no signing key for repository {0}")]
    SigningKeyNotFound(String),

    /// The authenticated writer does not own the target repository.
    #[error("writer {writer} may not write to repository {repo}")]
    Unauthorized {
        /// The authenticated writer identity
        writer: String,
        /// The repository the write targeted
        repo: String,
    },

    // =========================================================================
    // Stream Errors
    // =========================================================================

    /// The subscriber asked to resume from a sequence number that does not
    /// exist yet.
    #[error("cursor {cursor} is ahead of the current sequence {}", display_opt(.current))]
    FutureCursor {
        /// The cursor supplied by the caller
        cursor: u64,
        /// The current tail of the log, if any event exists
        current: Option<u64>,
    },

    /// The subscriber fell behind the live buffer and was disconnected.
    ///
    /// # Systems Concept: Backpressure
    ///
    /// Live events are fanned out through a fixed-capacity ring. A subscriber
    /// that cannot drain it loses its place; rather than grow memory without
    /// bound we terminate the stream and let the client reconnect with its
    /// last cursor.
    #[error("consumer too slow: {skipped} events dropped from the live buffer")]
    ConsumerTooSlow {
        /// Number of live events the subscriber missed
        skipped: u64,
    },

    // =========================================================================
    // Operational Errors
    // =========================================================================

    /// A caller-imposed deadline elapsed before the operation could start.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A background actor (writer, reader pool) is no longer running.
    #[error("{0} has shut down")]
    Closed(&'static str),

    /// The storage layer failed in a way that has no more specific variant,
    /// e.g. the batch transaction could not be committed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Stored data failed an integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),

    // =========================================================================
    // Internal Errors (Investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Encoding or decoding a JSON payload failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),
}

fn display_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

impl Error {
    /// Returns the stable, caller-facing error code for this error.
    ///
    /// Both swap failures share `InvalidSwap`; internal faults collapse to
    /// `InternalServerError` so storage details never leak to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRecord(_) => "InvalidRecord",
            Error::InvalidRequest(_) | Error::RepoAlreadyExists(_) => "InvalidRequest",
            Error::TooManyWrites { .. } => "TooManyWrites",
            Error::BadCommitSwap { .. } | Error::BadRecordSwap { .. } => "InvalidSwap",
            Error::RepoNotFound(_) => "RepoNotFound",
            Error::Unauthorized { .. } => "AuthRequired",
            Error::FutureCursor { .. } => "FutureCursor",
            Error::ConsumerTooSlow { .. } => "ConsumerTooSlow",
            Error::Timeout(_) => "Timeout",
            Error::SigningKeyNotFound(_)
            | Error::Closed(_)
            | Error::Storage(_)
            | Error::Corruption(_)
            | Error::Sqlite(_)
            | Error::Json(_)
            | Error::Schema(_) => "InternalServerError",
        }
    }

    /// Returns true for optimistic-concurrency conflicts.
    ///
    /// These are the only errors where reloading state and retrying the same
    /// logical write is expected to succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::BadCommitSwap { .. } | Error::BadRecordSwap { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let swap = Error::BadCommitSwap {
            repo: "did:example:alice".to_string(),
            expected: "bafyold".to_string(),
            actual: "bafynew".to_string(),
        };
        assert_eq!(
            swap.to_string(),
            "commit swap failed for did:example:alice: expected root bafyold, found bafynew"
        );

        let record = Error::BadRecordSwap {
            uri: "at://did:example:alice/app.example.post/3abc".to_string(),
            expected: Some("bafyx".to_string()),
            actual: None,
        };
        assert_eq!(
            record.to_string(),
            "record swap failed for at://did:example:alice/app.example.post/3abc: expected bafyx, found none"
        );

        let future = Error::FutureCursor {
            cursor: 10,
            current: Some(4),
        };
        assert_eq!(future.to_string(), "cursor 10 is ahead of the current sequence 4");

        let too_many = Error::TooManyWrites { count: 201, max: 200 };
        assert_eq!(too_many.to_string(), "too many writes: 201 exceeds the maximum of 200");
    }

    #[test]
    fn test_error_codes_are_stable() {
        let commit_swap = Error::BadCommitSwap {
            repo: String::new(),
            expected: String::new(),
            actual: String::new(),
        };
        let record_swap = Error::BadRecordSwap {
            uri: String::new(),
            expected: None,
            actual: None,
        };
        assert_eq!(commit_swap.code(), "InvalidSwap");
        assert_eq!(record_swap.code(), "InvalidSwap");
        assert!(commit_swap.is_conflict());
        assert!(record_swap.is_conflict());

        assert_eq!(Error::TooManyWrites { count: 1, max: 0 }.code(), "TooManyWrites");
        assert_eq!(Error::InvalidRecord("x".into()).code(), "InvalidRecord");
        assert_eq!(
            Error::FutureCursor { cursor: 1, current: None }.code(),
            "FutureCursor"
        );
        assert_eq!(Error::Closed("writer").code(), "InternalServerError");
        assert!(!Error::Closed("writer").is_conflict());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert_eq!(our_err.code(), "InternalServerError");
    }
}
