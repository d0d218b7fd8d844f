//! # SQLite Schema for repohost
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  repo_root (authoritative head)      repo_seq (event log)               │
//! │  ┌─────────────────┐                 ┌─────────────────┐                │
//! │  │ did (PK)        │                 │ seq (PK)        │                │
//! │  │ root / data     │                 │ did             │                │
//! │  │ rev / key_ref   │                 │ event_type      │                │
//! │  └─────────────────┘                 │ event (JSON)    │                │
//! │                                      │ checksum        │                │
//! │  record (current records)            └─────────────────┘                │
//! │  ┌─────────────────────────┐                                            │
//! │  │ did, collection, rkey   │         repo_block (signed commits)        │
//! │  │ cid / content / rev     │         account_root (advisory cache)      │
//! │  └─────────────────────────┘         repohost_metadata                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! - `repo_root`, `repo_block` and `record` change only inside a commit
//!   request executed by the writer actor, in the same transaction that
//!   appends the matching `repo_seq` row.
//! - `repo_seq` rows are appended only by the writer actor. Deletion is per
//!   repository; the metadata high-water mark keeps freed numbers retired.
//! - `account_root` is advisory. Losing an update there never affects
//!   correctness.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Metadata key storing the highest sequence number ever assigned.
pub const SEQ_HIGH_WATER_KEY: &str = "seq_high_water";

// =============================================================================
// DDL Statements
// =============================================================================

/// The `repo_root` table holds the authoritative head of every repository.
///
/// # Columns
///
/// - `did`: Repository identity (PK)
/// - `root`: Cid of the latest signed commit
/// - `data`: Root hash of the record tree that commit points at
/// - `rev`: Revision token (TID string; lexical order is temporal order)
/// - `key_ref`: Reference to the signing key
/// - `indexed_ms`: When the head was last moved
///
/// # Compare-and-Swap
///
/// Heads are moved with `UPDATE ... WHERE did = ? AND root = ?`; zero changed
/// rows means someone else moved the head first.
const CREATE_REPO_ROOT: &str = r#"
CREATE TABLE IF NOT EXISTS repo_root (
    did        TEXT PRIMARY KEY,
    root       TEXT NOT NULL,
    data       TEXT NOT NULL,
    rev        TEXT NOT NULL,
    key_ref    TEXT NOT NULL,
    indexed_ms INTEGER NOT NULL
)
"#;

/// The `repo_block` table stores signed commit objects by cid.
const CREATE_REPO_BLOCK: &str = r#"
CREATE TABLE IF NOT EXISTS repo_block (
    cid     TEXT PRIMARY KEY,
    did     TEXT NOT NULL,
    rev     TEXT NOT NULL,
    content BLOB NOT NULL
)
"#;

const CREATE_REPO_BLOCK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS repo_block_did_rev
ON repo_block(did, rev)
"#;

/// The `record` table holds the current record set of every repository.
///
/// # Columns
///
/// - `did`, `collection`, `rkey`: Record address (PK)
/// - `cid`: Content hash of `content`
/// - `content`: Canonical JSON encoding of the record
/// - `rev`: Revision of the commit that last wrote the record
const CREATE_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS record (
    did        TEXT NOT NULL,
    collection TEXT NOT NULL,
    rkey       TEXT NOT NULL,
    cid        TEXT NOT NULL,
    content    BLOB NOT NULL,
    rev        TEXT NOT NULL,
    indexed_ms INTEGER NOT NULL,
    PRIMARY KEY (did, collection, rkey)
)
"#;

/// The `repo_seq` table is the global, append-only event log.
///
/// # Columns
///
/// - `seq`: Global sequence number (PK). Assigned by the writer actor only.
/// - `did`: Repository the event concerns (NULL for label batches)
/// - `event_type`: `commit`, `account`, `identity` or `labels`
/// - `event`: JSON payload
/// - `checksum`: XXH3-64 of `event`, verified on every read
/// - `sequenced_ms`: Insertion time
///
/// # Invariants
///
/// - `seq` strictly increases and is never reused, even after deletes
/// - For one repository, commit events appear in commit order
const CREATE_REPO_SEQ: &str = r#"
CREATE TABLE IF NOT EXISTS repo_seq (
    seq          INTEGER PRIMARY KEY,
    did          TEXT,
    event_type   TEXT NOT NULL,
    event        BLOB NOT NULL,
    checksum     BLOB NOT NULL,
    sequenced_ms INTEGER NOT NULL
)
"#;

/// Supports `delete_all_for_repo`.
const CREATE_REPO_SEQ_DID_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS repo_seq_did
ON repo_seq(did)
"#;

/// Supports locating the start of the backfill window.
const CREATE_REPO_SEQ_TIME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS repo_seq_sequenced
ON repo_seq(sequenced_ms)
"#;

/// The `account_root` table is the fast-path "latest known commit" lookup.
///
/// Written best-effort by the account root updater; the upsert only ever moves
/// `rev` forward.
const CREATE_ACCOUNT_ROOT: &str = r#"
CREATE TABLE IF NOT EXISTS account_root (
    did        TEXT PRIMARY KEY,
    root       TEXT NOT NULL,
    rev        TEXT NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Key/value metadata: schema version and sequence high-water mark.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS repohost_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the repohost schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`. Hand it to the writer actor with
/// [`into_connection`](Database::into_connection).
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers on other connections see a consistent snapshot while
        // the writer appends.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        // Sync the WAL on commit only.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_REPO_ROOT)?;
        self.conn.execute_batch(CREATE_REPO_BLOCK)?;
        self.conn.execute_batch(CREATE_REPO_BLOCK_INDEX)?;
        self.conn.execute_batch(CREATE_RECORD)?;
        self.conn.execute_batch(CREATE_REPO_SEQ)?;
        self.conn.execute_batch(CREATE_REPO_SEQ_DID_INDEX)?;
        self.conn.execute_batch(CREATE_REPO_SEQ_TIME_INDEX)?;
        self.conn.execute_batch(CREATE_ACCOUNT_ROOT)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM repohost_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO repohost_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v.parse::<i32>().ok() == Some(SCHEMA_VERSION) => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns the connection, e.g. for the writer.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Reads the sequence high-water mark (0 when nothing was ever sequenced).
pub fn load_seq_high_water(conn: &Connection) -> Result<u64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM repohost_metadata WHERE key = ?",
            [SEQ_HIGH_WATER_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Schema(format!("corrupt {SEQ_HIGH_WATER_KEY} value '{v}'"))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        // metadata, repo_root, repo_block, record, repo_seq, account_root
        assert_eq!(table_count(db.connection()), 6);
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");

        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");
            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };

        assert!(indexes.contains(&"repo_seq_did".to_string()));
        assert!(indexes.contains(&"repo_seq_sequenced".to_string()));
        assert!(indexes.contains(&"repo_block_did_rev".to_string()));
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().expect("should create db");

        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM repohost_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("should query version");

        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE repohost_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should bump version");
        }

        let err = Database::open(&path).expect_err("newer schema must be rejected");
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }
        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(db.connection()), 6);
    }

    #[test]
    fn test_high_water_defaults_to_zero() {
        let db = Database::open_in_memory().expect("should create db");
        assert_eq!(load_seq_high_water(db.connection()).unwrap(), 0);

        db.conn
            .execute(
                "INSERT INTO repohost_metadata (key, value) VALUES (?, '17')",
                [SEQ_HIGH_WATER_KEY],
            )
            .unwrap();
        assert_eq!(load_seq_high_water(db.connection()).unwrap(), 17);
    }
}
