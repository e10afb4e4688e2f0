mod manifest;
mod metadata;
mod version;

pub use manifest::{Manifest, ManifestEntry};
pub use metadata::{reason, EntryType, Metadata, SkippedItem};
pub use version::{
    blob_entry, hash_from_blob_entry, CommitInfo, VersionName, FILES_DIR, VERSIONS_DIR,
};
