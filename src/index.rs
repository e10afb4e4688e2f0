use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::hash::Hash;
use crate::repo::Repository;
use crate::types::{hash_from_blob_entry, FILES_DIR};

/// why a blob does not need staging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicate {
    /// an earlier item of this scan had the same content
    SeenThisScan,
    /// the backend already holds it
    InBackend,
}

/// what to do with one piece of content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Duplicate(Duplicate),
    Stage,
}

/// dedup index for one commit: stored hashes plus hashes staged so far
#[derive(Debug, Default)]
pub struct ContentIndex {
    existing: HashSet<Hash>,
    seen: HashSet<Hash>,
}

impl ContentIndex {
    /// query the backend's blob namespace once
    pub fn load(repo: &Repository) -> Result<Self> {
        let entries = repo.list(&format!("{}/*", FILES_DIR))?;
        let existing: HashSet<Hash> = entries
            .iter()
            .filter_map(|e| hash_from_blob_entry(e))
            .collect();
        debug!(blobs = existing.len(), "loaded content index");
        Ok(Self::from_existing(existing))
    }

    pub fn from_existing(existing: impl IntoIterator<Item = Hash>) -> Self {
        Self {
            existing: existing.into_iter().collect(),
            seen: HashSet::new(),
        }
    }

    /// decide for `hash` without recording anything
    pub fn decide(&self, hash: &Hash) -> Decision {
        if self.seen.contains(hash) {
            Decision::Duplicate(Duplicate::SeenThisScan)
        } else if self.existing.contains(hash) {
            Decision::Duplicate(Duplicate::InBackend)
        } else {
            Decision::Stage
        }
    }

    /// record that `hash` was staged in this scan
    pub fn mark_seen(&mut self, hash: Hash) {
        self.seen.insert(hash);
    }

    pub fn stored_count(&self) -> usize {
        self.existing.len()
    }

    pub fn staged_count(&self) -> usize {
        self.seen.len()
    }
}
