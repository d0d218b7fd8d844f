//! # Domain Types for repohost
//!
//! This module defines the identifiers that flow through the write pipeline and
//! the event log: repository identities, collection names, record keys,
//! timestamp identifiers, content hashes and sequence numbers.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every identifier is wrapped in its own type, and the string-backed ones can
//! only be constructed through a validating `parse`. Once a function receives a
//! [`Nsid`] it never needs to re-check the syntax.
//!
//! ## Invariants
//!
//! - [`Seq`]: Strictly increasing, never reused; `Seq::ZERO` means "before the
//!   first event"
//! - [`Tid`]: Lexical order of the string form equals numeric order, so
//!   revision tokens compare correctly as plain strings in SQLite
//! - [`Cid`]: Same canonical bytes always produce the same cid

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

// =============================================================================
// Repository Identity
// =============================================================================

/// The identity of a repository owner, e.g. `did:example:alice`.
///
/// # Syntax
///
/// `did:<method>:<id>` where the method is lowercase ASCII letters and the id
/// is non-empty and contains no whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Did(String);

/// Upper bound on the full identifier length.
const MAX_DID_LEN: usize = 2048;

impl Did {
    /// Parses and validates a repository identity.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid = |why: &str| Error::InvalidRequest(format!("invalid did '{value}': {why}"));

        if value.len() > MAX_DID_LEN {
            return Err(invalid("too long"));
        }
        let rest = value
            .strip_prefix("did:")
            .ok_or_else(|| invalid("missing did: prefix"))?;
        let (method, id) = rest
            .split_once(':')
            .ok_or_else(|| invalid("missing method separator"))?;
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(invalid("method must be lowercase letters"));
        }
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(invalid("identifier must be non-empty without whitespace"));
        }
        Ok(Self(value))
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Did {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Did> for String {
    fn from(did: Did) -> Self {
        did.0
    }
}

// =============================================================================
// Collection Names
// =============================================================================

/// A namespaced collection name, e.g. `app.example.post`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Nsid(String);

const MAX_NSID_LEN: usize = 317;
const MAX_NSID_SEGMENT_LEN: usize = 63;

impl Nsid {
    /// Parses and validates a collection name.
    ///
    /// At least three dot-separated segments, each made of ASCII letters,
    /// digits and inner hyphens.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid =
            |why: &str| Error::InvalidRequest(format!("invalid collection '{value}': {why}"));

        if value.len() > MAX_NSID_LEN {
            return Err(invalid("too long"));
        }
        let segments: Vec<&str> = value.split('.').collect();
        if segments.len() < 3 {
            return Err(invalid("expected at least three segments"));
        }
        for segment in &segments {
            if segment.is_empty() || segment.len() > MAX_NSID_SEGMENT_LEN {
                return Err(invalid("segment length out of range"));
            }
            if !segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                return Err(invalid("segment contains disallowed characters"));
            }
            if segment.starts_with('-') || segment.ends_with('-') {
                return Err(invalid("segment may not start or end with a hyphen"));
            }
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Nsid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<Nsid> for String {
    fn from(nsid: Nsid) -> Self {
        nsid.0
    }
}

// =============================================================================
// Record Keys
// =============================================================================

/// The key of a record within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

const MAX_RKEY_LEN: usize = 512;

impl RecordKey {
    /// Parses and validates a record key.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let invalid =
            |why: &str| Error::InvalidRequest(format!("invalid record key '{value}': {why}"));

        if value.is_empty() || value.len() > MAX_RKEY_LEN {
            return Err(invalid("length out of range"));
        }
        if value == "." || value == ".." {
            return Err(invalid("reserved key"));
        }
        let allowed = |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'~' | b'-');
        if !value.bytes().all(allowed) {
            return Err(invalid("contains disallowed characters"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Tid> for RecordKey {
    fn from(tid: Tid) -> Self {
        Self(tid.to_string())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RecordKey> for String {
    fn from(rkey: RecordKey) -> Self {
        rkey.0
    }
}

// =============================================================================
// Timestamp Identifiers
// =============================================================================

/// Alphabet of the sortable base32 encoding. Ordered so that lexical order of
/// encoded strings matches numeric order of the values.
const S32_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

const TID_LEN: usize = 13;
const CLOCK_ID_BITS: u32 = 10;
const CLOCK_ID_MASK: u64 = (1 << CLOCK_ID_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << 53) - 1;

/// A timestamp identifier: 53 bits of microseconds plus a 10-bit clock id.
///
/// Used both for generated record keys and for repository revision tokens.
///
/// # Layout
///
/// ```text
/// 0 | 53 bits: microseconds since epoch | 10 bits: clock id
/// ```
///
/// The string form is 13 characters of sortable base32, so comparing two
/// revisions as strings gives the same answer as comparing them as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid(u64);

impl Tid {
    /// Builds a TID from its components. Out-of-range bits are masked off.
    pub fn from_parts(timestamp_micros: u64, clock_id: u16) -> Self {
        Self(((timestamp_micros & TIMESTAMP_MASK) << CLOCK_ID_BITS) | (clock_id as u64 & CLOCK_ID_MASK))
    }

    /// Returns the timestamp component in microseconds.
    pub fn timestamp_micros(&self) -> u64 {
        self.0 >> CLOCK_ID_BITS
    }

    /// Returns the clock id component.
    pub fn clock_id(&self) -> u16 {
        (self.0 & CLOCK_ID_MASK) as u16
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Parses the 13-character string form.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidRequest(format!("invalid tid '{value}': {why}"));
        if value.len() != TID_LEN {
            return Err(invalid("must be 13 characters"));
        }
        let mut raw: u64 = 0;
        for (i, byte) in value.bytes().enumerate() {
            let digit = S32_ALPHABET
                .iter()
                .position(|&c| c == byte)
                .ok_or_else(|| invalid("invalid character"))? as u64;
            // The leading character carries the top bits; the high bit must stay clear.
            if i == 0 && digit >= 8 {
                return Err(invalid("high bit set"));
            }
            raw = (raw << 5) | digit;
        }
        Ok(Self(raw))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [S32_ALPHABET[0]; TID_LEN];
        let mut value = self.0;
        for slot in out.iter_mut().rev() {
            *slot = S32_ALPHABET[(value & 31) as usize];
            value >>= 5;
        }
        // The alphabet is ASCII, so this never fails.
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Tid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.to_string()
    }
}

/// A monotonic TID generator.
///
/// # Why Not Just Read the Clock?
///
/// Two creates in the same microsecond, or a wall clock stepping backwards,
/// would otherwise yield equal or decreasing identifiers. The generator
/// remembers the last timestamp it handed out and always moves forward.
///
/// # Rust Pattern: Lock-Free CAS Loop
///
/// The last timestamp lives in an `AtomicU64`; concurrent callers race with
/// `compare_exchange` and the loser retries with the winner's value.
#[derive(Debug)]
pub struct TidClock {
    last_micros: AtomicU64,
    clock_id: u16,
}

impl TidClock {
    /// Creates a generator with a random clock id.
    pub fn new() -> Self {
        Self::with_clock_id(rand::thread_rng().gen_range(0..(1 << CLOCK_ID_BITS)))
    }

    /// Creates a generator with a fixed clock id.
    pub fn with_clock_id(clock_id: u16) -> Self {
        Self {
            last_micros: AtomicU64::new(0),
            clock_id: clock_id & CLOCK_ID_MASK as u16,
        }
    }

    /// Returns a TID strictly greater than every TID this clock returned before.
    pub fn next(&self) -> Tid {
        self.next_at_least(0)
    }

    /// Returns a TID strictly greater than `prev` and than every earlier TID
    /// from this clock.
    pub fn next_after(&self, prev: &Tid) -> Tid {
        self.next_at_least(prev.timestamp_micros() + 1)
    }

    fn next_at_least(&self, floor: u64) -> Tid {
        let now = now_micros();
        let mut last = self.last_micros.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1).max(floor);
            match self
                .last_micros
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Tid::from_parts(candidate, self.clock_id),
                Err(actual) => last = actual,
            }
        }
    }
}

impl Default for TidClock {
    fn default() -> Self {
        Self::new()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

// =============================================================================
// Content Identifiers
// =============================================================================

/// CIDv1 header: version 1, dag-json codec (0x0129 as varint), sha2-256
/// multihash of 32 bytes.
const CID_PREFIX: [u8; 5] = [0x01, 0xa9, 0x02, 0x12, 0x20];

/// A content hash of a canonically encoded value.
///
/// # String Form
///
/// `b` (multibase base32) followed by the lowercase, unpadded RFC 4648 base32
/// encoding of the binary CID.
///
/// # Rust Pattern: Copy
///
/// The digest is a fixed 32-byte array, so `Cid` is `Copy` and can be passed
/// around by value without allocations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid([u8; 32]);

impl Cid {
    /// Hashes `data` (which must already be canonical bytes).
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Returns the sha2-256 digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the binary CID (header plus digest).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CID_PREFIX.len() + 32);
        out.extend_from_slice(&CID_PREFIX);
        out.extend_from_slice(&self.0);
        out
    }

    /// Parses the multibase string form.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidRequest(format!("invalid cid '{value}': {why}"));
        let body = value
            .strip_prefix('b')
            .ok_or_else(|| invalid("expected base32 multibase prefix"))?;
        let bytes = BASE32_NOPAD
            .decode(body.to_ascii_uppercase().as_bytes())
            .map_err(|_| invalid("not base32"))?;
        if bytes.len() != CID_PREFIX.len() + 32 || bytes[..CID_PREFIX.len()] != CID_PREFIX {
            return Err(invalid("unsupported cid version, codec or hash"));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[CID_PREFIX.len()..]);
        Ok(Self(digest))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE32_NOPAD.encode(&self.to_bytes()).to_ascii_lowercase();
        write!(f, "b{encoded}")
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_string()
    }
}

// =============================================================================
// Record Addressing
// =============================================================================

/// The address of a record: `at://<did>/<collection>/<rkey>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    pub did: Did,
    pub collection: Nsid,
    pub rkey: RecordKey,
}

impl AtUri {
    pub fn new(did: Did, collection: Nsid, rkey: RecordKey) -> Self {
        Self { did, collection, rkey }
    }

    /// Returns the path of the record inside its repository tree:
    /// `<collection>/<rkey>`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

impl Serialize for AtUri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Sequence Numbers
// =============================================================================

/// A position in the global event log.
///
/// # Invariants
///
/// - Assigned by the sequencer exactly once, strictly increasing
/// - Never reused, even after the event is deleted
/// - The first event gets 1; [`Seq::ZERO`] is the cursor meaning "nothing
///   consumed yet"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// Cursor position before the first event.
    pub const ZERO: Seq = Seq(0);

    /// The first sequence number ever assigned.
    pub const FIRST: Seq = Seq(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Repository Head
// =============================================================================

/// The current state pointer of a repository.
///
/// Owned by the coordinator for that repository; everything else reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHead {
    pub did: Did,
    /// Cid of the latest signed commit. This is what `swapCommit` compares to.
    pub root: Cid,
    /// Root of the record tree the commit points at.
    pub data: Cid,
    /// Revision token of the latest commit.
    pub rev: Tid,
    /// Reference to the key that signs this repository's commits.
    pub key_ref: String,
}

// =============================================================================
// Tests
// =============================================================================
