//! # Record Tree
//!
//! The content-addressed tree that stores a repository's records. The write
//! pipeline only needs a narrow contract from it:
//!
//! - look up the cid stored at a path
//! - stage inserts and removals on a private copy
//! - compute the root hash of the staged result
//!
//! This implementation keeps the `(path, cid)` pairs in a `BTreeMap` and
//! hashes them in path order, which gives the same root for the same record
//! set regardless of the order writes were applied in.

use std::collections::BTreeMap;

use crate::types::Cid;

/// Separates a path from its cid in the root hash input.
const PATH_TERMINATOR: u8 = 0x00;
/// Terminates one entry in the root hash input.
const ENTRY_TERMINATOR: u8 = 0x0a;

/// The record set of one repository.
///
/// # Rust Pattern: Clone-on-Stage
///
/// The coordinator keeps the committed tree; the commit builder clones it and
/// mutates the clone. If the batch fails, the clone is dropped and the
/// committed tree was never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordTree {
    entries: BTreeMap<String, Cid>,
}

impl RecordTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from stored `(path, cid)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Cid)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, path: &str) -> Option<Cid> {
        self.entries.get(path).copied()
    }

    /// Stores `cid` at `path`, returning the previous cid if any.
    pub fn insert(&mut self, path: String, cid: Cid) -> Option<Cid> {
        self.entries.insert(path, cid)
    }

    /// Removes `path`, returning the cid it held.
    pub fn remove(&mut self, path: &str) -> Option<Cid> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Cid)> {
        self.entries.iter().map(|(path, cid)| (path.as_str(), cid))
    }

    /// Computes the root hash over all entries in path order.
    pub fn root(&self) -> Cid {
        let mut input = Vec::with_capacity(self.entries.len() * 64);
        for (path, cid) in &self.entries {
            input.extend_from_slice(path.as_bytes());
            input.push(PATH_TERMINATOR);
            input.extend_from_slice(&cid.to_bytes());
            input.push(ENTRY_TERMINATOR);
        }
        Cid::for_bytes(&input)
    }
}
