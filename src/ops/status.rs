use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::elevate::{attempt, ElevationContext};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{hash_file, relative_path, FileMetadata, Scanner};
use crate::repo::Repository;
use crate::types::{reason, EntryType, Metadata, SkippedItem};
use crate::versions::{latest_version, list_versions, read_manifest};

/// status options
#[derive(Clone, Debug, Default)]
pub struct StatusOptions {
    /// report permission, owner and group changes on unchanged content
    pub include_meta: bool,
    /// flag content changes that kept their mtime
    pub checksum: bool,
}

/// live tree against the latest commit, each list in scan order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// the commit compared against
    pub id: u64,
    pub new: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub metadata_changed: Vec<String>,
    /// content changed while mtime did not
    pub checksum_suspect: Vec<String>,
    pub skipped: Vec<SkippedItem>,
}

impl StatusReport {
    pub fn is_clean(&self) -> bool {
        self.new.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.metadata_changed.is_empty()
            && self.checksum_suspect.is_empty()
    }
}

/// compare the tree at `root` with the latest commit; touches nothing
///
/// directories missing from the tree are not reported as deleted, only files.
pub fn status(
    repo: &Repository,
    root: &Path,
    opts: &StatusOptions,
    elevation: Option<&ElevationContext>,
) -> Result<StatusReport> {
    let root = fs::canonicalize(root).with_path(root)?;
    let versions = list_versions(repo)?;
    let latest = latest_version(&versions).ok_or(Error::NoCommits)?;
    let manifest = read_manifest(repo, latest)?;
    let recorded = manifest.files();
    info!(root = %root.display(), against = latest.id, "status");

    let mut report = StatusReport {
        id: latest.id,
        ..Default::default()
    };
    let mut live: HashSet<String> = HashSet::new();

    let mut scanner = Scanner::new(&root, elevation);
    for item in scanner.by_ref() {
        if item.kind != EntryType::File {
            continue;
        }
        let rel = relative_path(&root, &item.path);
        live.insert(rel.clone());

        let Some(previous) = recorded.get(rel.as_str()) else {
            report.new.push(rel);
            continue;
        };

        let hash = match attempt(elevation, || hash_file(&item.path), |ctx| ctx.hash_file(&item.path)) {
            Ok(hash) => hash,
            Err(failed) => {
                debug!(path = %rel, error = %failed.error, "cannot hash");
                let plain = if failed.error.is_permission_denied() {
                    reason::PERMISSION_DENIED
                } else {
                    reason::READ_FAILED
                };
                report
                    .skipped
                    .push(SkippedItem::new(rel, failed.reason(reason::ELEVATED_HASH_FAILED, plain)));
                continue;
            }
        };

        let current: Option<Metadata> = attempt(
            elevation,
            || FileMetadata::from_path(&item.path).map(|m| m.to_metadata()),
            |ctx| ctx.stat(&item.path),
        )
        .ok()
        .or(item.listed);
        let stored = previous.metadata();

        if previous.hash() != Some(&hash) {
            let same_mtime = matches!(
                (stored, current.as_ref()),
                (Some(s), Some(c)) if s.mtime == c.mtime
            );
            if opts.checksum && same_mtime {
                report.checksum_suspect.push(rel);
            } else {
                report.modified.push(rel);
            }
        } else if opts.include_meta {
            if let (Some(s), Some(c)) = (stored, current.as_ref()) {
                if s.access_differs(c) {
                    report.metadata_changed.push(rel);
                }
            }
        }
    }

    report.skipped.extend(scanner.take_skipped());
    let unreadable: Vec<&str> = report.skipped.iter().map(|s| s.path.as_str()).collect();
    report.deleted = recorded
        .keys()
        .filter(|path| !live.contains(**path))
        .filter(|path| {
            !unreadable
                .iter()
                .any(|dir| *path == dir || path.strip_prefix(dir).is_some_and(|r| r.starts_with('/')))
        })
        .map(|path| path.to_string())
        .collect();

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_entry;
    use crate::hash::Hash;
    use crate::ops::commit::tests::settle;
    use crate::ops::{commit, CommitOptions};
    use crate::types::{ManifestEntry, VERSIONS_DIR};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn meta_with_mtime(mtime: i64) -> Metadata {
        Metadata {
            mode: 0o644,
            owner: "nobody".into(),
            group: "nogroup".into(),
            mtime,
            atime: mtime,
            ctime: mtime,
            size: 1,
        }
    }

    fn store_manifest(repo: &Repository, entries: &[ManifestEntry]) {
        let staging = tempdir().unwrap();
        let versions = staging.path().join(VERSIONS_DIR);
        fs::create_dir_all(&versions).unwrap();
        let text: String = entries.iter().map(|e| encode_entry(e) + "\n").collect();
        fs::write(versions.join("1-20240101T000000.manifest"), text).unwrap();
        repo.add(staging.path(), &[VERSIONS_DIR.to_string()]).unwrap();
    }

    #[test]
    fn test_new_file_and_touched_file() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        fs::write(src.path().join("a.txt"), "one").unwrap();
        store_manifest(
            &repo,
            &[ManifestEntry::file("a.txt", Hash::of_bytes(b"one"), meta_with_mtime(1000))],
        );
        fs::write(src.path().join("b.txt"), "two").unwrap();

        let report = status(&repo, src.path(), &StatusOptions::default(), None).unwrap();
        assert_eq!(report.id, 1);
        assert_eq!(report.new, vec!["b.txt"]);
        assert!(report.modified.is_empty());
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn test_checksum_suspect_takes_precedence() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        fs::write(src.path().join("a.txt"), "changed").unwrap();
        crate::fs::set_times(&src.path().join("a.txt"), 1000, 1000).unwrap();
        store_manifest(
            &repo,
            &[ManifestEntry::file("a.txt", Hash::of_bytes(b"original"), meta_with_mtime(1000))],
        );

        let plain = status(&repo, src.path(), &StatusOptions::default(), None).unwrap();
        assert_eq!(plain.modified, vec!["a.txt"]);
        assert!(plain.checksum_suspect.is_empty());

        let opts = StatusOptions {
            checksum: true,
            ..Default::default()
        };
        let checked = status(&repo, src.path(), &opts, None).unwrap();
        assert_eq!(checked.checksum_suspect, vec!["a.txt"]);
        assert!(checked.modified.is_empty());
    }

    #[test]
    fn test_deleted_and_metadata_changed() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let root = src.path();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/keep.txt"), "keep").unwrap();
        fs::write(root.join("drop.txt"), "drop").unwrap();
        settle(root);
        let repo = Repository::dir(store.path(), None);
        commit(&repo, root, "", &CommitOptions::default(), None).unwrap();

        fs::remove_file(root.join("drop.txt")).unwrap();
        fs::set_permissions(root.join("dir/keep.txt"), fs::Permissions::from_mode(0o600)).unwrap();

        let report = status(&repo, root, &StatusOptions::default(), None).unwrap();
        assert_eq!(report.deleted, vec!["drop.txt"]);
        assert!(report.metadata_changed.is_empty());

        let opts = StatusOptions {
            include_meta: true,
            ..Default::default()
        };
        let report = status(&repo, root, &opts, None).unwrap();
        assert_eq!(report.metadata_changed, vec!["dir/keep.txt"]);
    }

    #[test]
    fn test_missing_directory_not_reported() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_manifest(&repo, &[ManifestEntry::directory("olddir", meta_with_mtime(5))]);

        let report = status(&repo, src.path(), &StatusOptions::default(), None).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_no_commits() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        let result = status(&repo, src.path(), &StatusOptions::default(), None);
        assert!(matches!(result, Err(Error::NoCommits)));
    }
}
