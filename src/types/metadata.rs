/// ownership, permission and timestamp snapshot of one path
///
/// owner and group hold the account name when one resolves, otherwise the
/// numeric id as decimal text. times are whole seconds since the epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// permission bits (mode & 0o7777)
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    /// byte size; 0 when read from a manifest generation that predates it
    pub size: u64,
}

impl Metadata {
    /// true when permissions, owner or group differ
    pub fn access_differs(&self, other: &Metadata) -> bool {
        self.mode != other.mode || self.owner != other.owner || self.group != other.group
    }
}

/// filesystem object kinds the scanner reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryType::File => write!(f, "file"),
            EntryType::Directory => write!(f, "directory"),
            EntryType::Symlink => write!(f, "symlink"),
        }
    }
}

/// a path left out of an operation, with a machine-readable reason
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedItem {
    pub path: String,
    pub reason: String,
}

impl SkippedItem {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SkippedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.reason)
    }
}

/// reasons recorded in `SkippedItem::reason`
pub mod reason {
    pub const PERMISSION_DENIED: &str = "permission-denied";
    pub const UNREADABLE_SUBTREE: &str = "unreadable-subtree";
    pub const ELEVATED_LIST_FAILED: &str = "elevated-list-failed";
    pub const ELEVATED_HASH_FAILED: &str = "elevated-hash-failed";
    pub const ELEVATED_COPY_FAILED: &str = "elevated-copy-failed";
    pub const ELEVATED_METADATA_FAILED: &str = "elevated-metadata-failed";
    pub const STAT_FAILED: &str = "stat-failed";
    pub const READ_FAILED: &str = "read-failed";
    pub const STAGE_FAILED: &str = "stage-failed";
    pub const UNSUPPORTED_FILE_TYPE: &str = "unsupported-file-type";
    pub const MISSING_BLOB: &str = "missing-blob";
    pub const WRITE_FAILED: &str = "write-failed";
    pub const BEHIND_SYMLINK: &str = "behind-symlink";
    pub const VANISHED: &str = "vanished";
    /// absolute or `..` path in a manifest
    pub const INVALID_PATH: &str = "invalid-path";
}
