//! verstash - versioned, deduplicating backups over an archive engine
//!
//! every commit records a directory tree as a manifest; file contents are stored
//! once per distinct hash. persistence is delegated to an external archive
//! engine (rar, or a plain directory store) that is treated as a black box.
//!
//! # Repository layout
//!
//! - `files/<md5 hex>`: one blob per distinct content
//! - `versions/<id>-<YYYYMMDDTHHMMSS>.manifest`: tab-separated manifest
//! - `versions/<id>-<YYYYMMDDTHHMMSS>.comment`: free-form commit comment
//!
//! # Example usage
//!
//! ```no_run
//! use verstash::{ops, Repository};
//! use std::path::Path;
//!
//! let repo = Repository::dir(Path::new("/backups/store"), None);
//!
//! // record a directory
//! let outcome = ops::commit(&repo, Path::new("/home/me/docs"), "nightly", &Default::default(), None).unwrap();
//! println!("{} files added", outcome.summary().added);
//!
//! // restore commit 1
//! ops::checkout(&repo, 1, Path::new("/tmp/restore"), &Default::default(), None).unwrap();
//! ```

mod config;
mod error;
mod hash;
mod index;
mod repo;
mod versions;

pub mod backend;
pub mod codec;
pub mod elevate;
pub mod fs;
pub mod ops;
pub mod progress;
pub mod types;

pub use backend::{ArchiveBackend, DirBackend, RarBackend};
pub use config::{BackendKind, Config, ElevationConfig};
pub use elevate::ElevationContext;
pub use error::{Error, IoResultExt, Result};
pub use hash::Hash;
pub use index::{ContentIndex, Decision, Duplicate};
pub use progress::ProgressMonitor;
pub use repo::Repository;
pub use types::{
    CommitInfo, EntryType, Manifest, ManifestEntry, Metadata, SkippedItem, VersionName,
};
pub use versions::{latest_version, list_versions, next_commit_id, read_manifest, resolve_version};
