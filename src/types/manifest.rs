use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::types::Metadata;

/// one recorded path in a manifest
///
/// `metadata` is `None` only for entries read from the oldest manifest
/// generation, which stored bare path and hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestEntry {
    File {
        path: String,
        hash: Hash,
        metadata: Option<Metadata>,
    },
    Directory {
        path: String,
        metadata: Option<Metadata>,
    },
    Symlink {
        path: String,
        target: String,
        metadata: Option<Metadata>,
    },
}

impl ManifestEntry {
    pub fn file(path: impl Into<String>, hash: Hash, metadata: Metadata) -> Self {
        ManifestEntry::File {
            path: path.into(),
            hash,
            metadata: Some(metadata),
        }
    }

    pub fn directory(path: impl Into<String>, metadata: Metadata) -> Self {
        ManifestEntry::Directory {
            path: path.into(),
            metadata: Some(metadata),
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>, metadata: Metadata) -> Self {
        ManifestEntry::Symlink {
            path: path.into(),
            target: target.into(),
            metadata: Some(metadata),
        }
    }

    /// path relative to the committed root, '/'-separated
    pub fn path(&self) -> &str {
        match self {
            ManifestEntry::File { path, .. }
            | ManifestEntry::Directory { path, .. }
            | ManifestEntry::Symlink { path, .. } => path,
        }
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            ManifestEntry::File { metadata, .. }
            | ManifestEntry::Directory { metadata, .. }
            | ManifestEntry::Symlink { metadata, .. } => metadata.as_ref(),
        }
    }

    /// content hash, files only
    pub fn hash(&self) -> Option<&Hash> {
        match self {
            ManifestEntry::File { hash, .. } => Some(hash),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ManifestEntry::File { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ManifestEntry::File { .. } => "file",
            ManifestEntry::Directory { .. } => "directory",
            ManifestEntry::Symlink { .. } => "symlink",
        }
    }
}

/// full state of a tree at one commit
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    /// commit id, 0 while the manifest is not yet committed
    pub id: u64,
    pub timestamp: String,
    pub comment: String,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// build from entries, keeping their order and rejecting duplicate paths
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.path()) {
                return Err(Error::DuplicatePath(entry.path().to_string()));
            }
        }
        Ok(Self {
            entries,
            ..Default::default()
        })
    }

    /// attach commit identity
    pub fn with_identity(
        mut self,
        id: u64,
        timestamp: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        self.id = id;
        self.timestamp = timestamp.into();
        self.comment = comment.into();
        self
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// file entries keyed by path
    pub fn files(&self) -> BTreeMap<&str, &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_file())
            .map(|e| (e.path(), e))
            .collect()
    }

    /// look up an entry of any kind
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path() == path)
    }
}
