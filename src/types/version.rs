use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// prefix of the version namespace inside the backend
pub const VERSIONS_DIR: &str = "versions";
/// prefix of the content blob namespace inside the backend
pub const FILES_DIR: &str = "files";

const MANIFEST_SUFFIX: &str = ".manifest";
const COMMENT_SUFFIX: &str = ".comment";

/// a commit's name in the version namespace: `{id}-{timestamp}`
///
/// timestamps are UTC `%Y%m%dT%H%M%S`, so byte order is time order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VersionName {
    pub id: u64,
    pub timestamp: String,
}

impl VersionName {
    pub fn new(id: u64, timestamp: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: timestamp.into(),
        }
    }

    /// timestamp for a commit made now
    pub fn now_timestamp() -> String {
        chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string()
    }

    /// parse `{id}-{timestamp}`
    pub fn parse(s: &str) -> Result<Self> {
        let (id, timestamp) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidVersionName(s.to_string()))?;
        let id: u64 = id
            .parse()
            .map_err(|_| Error::InvalidVersionName(s.to_string()))?;
        if id == 0 || timestamp.is_empty() {
            return Err(Error::InvalidVersionName(s.to_string()));
        }
        Ok(Self::new(id, timestamp))
    }

    /// parse a backend entry name like `versions/3-20240101T000000.manifest`
    ///
    /// returns None for anything that is not a manifest in the version namespace
    pub fn from_manifest_entry(entry: &str) -> Option<Self> {
        let rest = entry.strip_prefix(VERSIONS_DIR)?.strip_prefix('/')?;
        let stem = rest.strip_suffix(MANIFEST_SUFFIX)?;
        Self::parse(stem).ok()
    }

    /// parse a backend entry name like `versions/3-20240101T000000.comment`
    pub fn from_comment_entry(entry: &str) -> Option<Self> {
        let rest = entry.strip_prefix(VERSIONS_DIR)?.strip_prefix('/')?;
        let stem = rest.strip_suffix(COMMENT_SUFFIX)?;
        Self::parse(stem).ok()
    }

    pub fn manifest_entry(&self) -> String {
        format!("{}/{}{}", VERSIONS_DIR, self, MANIFEST_SUFFIX)
    }

    pub fn comment_entry(&self) -> String {
        format!("{}/{}{}", VERSIONS_DIR, self, COMMENT_SUFFIX)
    }

    /// recency order: timestamp first, id breaks ties
    pub fn recency_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.id.cmp(&other.id))
    }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.timestamp)
    }
}

/// commit listing row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: u64,
    pub timestamp: String,
    pub comment: String,
}

impl fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5}  {}  {}", self.id, self.timestamp, self.comment)
    }
}

/// blob entry name for a content hash
pub fn blob_entry(hash: &crate::Hash) -> String {
    format!("{}/{}", FILES_DIR, hash)
}

/// content hash from a blob entry name, None for anything else
pub fn hash_from_blob_entry(entry: &str) -> Option<crate::Hash> {
    let hex = entry.strip_prefix(FILES_DIR)?.strip_prefix('/')?;
    crate::Hash::from_hex(hex).ok()
}
