use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::codec::encode_manifest;
use crate::elevate::{attempt, ElevationContext};
use crate::error::{IoResultExt, Result};
use crate::fs::{
    hash_file, open_for_read, read_symlink_target, relative_path, FileMetadata, Scanner,
};
use crate::index::{ContentIndex, Decision};
use crate::repo::Repository;
use crate::types::{
    reason, EntryType, Manifest, ManifestEntry, Metadata, SkippedItem, VersionName, FILES_DIR,
    VERSIONS_DIR,
};
use crate::versions::{latest_version, list_versions, next_commit_id, read_version_text};

/// commit options
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    /// also record the in-root targets of symlinks as files
    pub follow_symlinks: bool,
}

/// counts and skips of one commit run
#[derive(Clone, Debug, Default)]
pub struct CommitSummary {
    /// the new commit, or the latest one when nothing changed
    pub id: Option<u64>,
    pub scanned: usize,
    /// blobs staged for the backend
    pub added: usize,
    /// files whose content was already stored or staged
    pub duplicate: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub total_bytes: u64,
    pub skipped: Vec<SkippedItem>,
    pub elapsed: Duration,
}

impl CommitSummary {
    /// true when some paths were left out
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

#[derive(Clone, Debug)]
pub enum CommitOutcome {
    Committed(CommitSummary),
    /// the tree matches the latest commit exactly; nothing was written
    NoChanges(CommitSummary),
}

impl CommitOutcome {
    pub fn summary(&self) -> &CommitSummary {
        match self {
            CommitOutcome::Committed(s) | CommitOutcome::NoChanges(s) => s,
        }
    }
}

/// commit the tree at `root`
///
/// blobs are staged in a private temp dir mirroring the backend layout and
/// written together with the manifest in one backend call. if the backend
/// write fails the staging dir is dropped and no commit becomes visible.
pub fn commit(
    repo: &Repository,
    root: &Path,
    comment: &str,
    opts: &CommitOptions,
    elevation: Option<&ElevationContext>,
) -> Result<CommitOutcome> {
    let started = Instant::now();
    let root = fs::canonicalize(root).with_path(root)?;
    info!(root = %root.display(), repo = %repo.describe(), "committing");

    let index = ContentIndex::load(repo)?;
    let staging = tempfile::tempdir().with_path(std::env::temp_dir())?;
    let files_dir = staging.path().join(FILES_DIR);
    fs::create_dir_all(&files_dir).with_path(&files_dir)?;

    let mut builder = ManifestBuilder {
        root: &root,
        files_dir,
        elevation,
        index,
        entries: Vec::new(),
        recorded: HashSet::new(),
        summary: CommitSummary::default(),
    };

    let mut scanner = Scanner::new(&root, elevation);
    for item in scanner.by_ref() {
        builder.summary.scanned += 1;
        match item.kind {
            EntryType::Directory => builder.add_directory(&item.path, item.listed),
            EntryType::Symlink => {
                builder.add_symlink(&item.path, item.listed);
                if opts.follow_symlinks {
                    builder.follow(&item.path);
                }
            }
            EntryType::File => builder.add_file(&item.path, item.listed),
        }
    }
    let mut summary = builder.summary;
    summary.skipped.extend(scanner.take_skipped());
    summary.skipped.sort_by(|a, b| a.path.cmp(&b.path));
    for item in &summary.skipped {
        warn!(path = %item.path, reason = %item.reason, "skipped");
    }

    let manifest = Manifest::from_entries(builder.entries)?;
    let text = encode_manifest(&manifest);

    let versions = list_versions(repo)?;
    if let Some(latest) = latest_version(&versions) {
        let (previous, _) = read_version_text(repo, latest)?;
        if previous == text {
            info!(latest = latest.id, "no changes since last commit");
            summary.id = Some(latest.id);
            summary.added = 0;
            summary.elapsed = started.elapsed();
            return Ok(CommitOutcome::NoChanges(summary));
        }
    }

    let version = VersionName::new(next_commit_id(&versions), VersionName::now_timestamp());
    let versions_dir = staging.path().join(VERSIONS_DIR);
    fs::create_dir_all(&versions_dir).with_path(&versions_dir)?;
    let manifest_path = staging.path().join(version.manifest_entry());
    fs::write(&manifest_path, &text).with_path(&manifest_path)?;
    let comment_path = staging.path().join(version.comment_entry());
    fs::write(&comment_path, comment).with_path(&comment_path)?;

    let mut names = vec![VERSIONS_DIR.to_string()];
    if summary.added > 0 {
        names.insert(0, FILES_DIR.to_string());
    }
    repo.add(staging.path(), &names)?;

    summary.id = Some(version.id);
    summary.elapsed = started.elapsed();
    info!(
        id = version.id,
        added = summary.added,
        duplicate = summary.duplicate,
        skipped = summary.skipped.len(),
        "committed"
    );
    Ok(CommitOutcome::Committed(summary))
}

/// accumulates manifest entries and stages new content
struct ManifestBuilder<'a> {
    root: &'a Path,
    files_dir: PathBuf,
    elevation: Option<&'a ElevationContext>,
    index: ContentIndex,
    entries: Vec<ManifestEntry>,
    /// relative paths already in `entries`
    recorded: HashSet<String>,
    summary: CommitSummary,
}

impl ManifestBuilder<'_> {
    fn skip(&mut self, rel: &str, why: &str) {
        self.summary.skipped.push(SkippedItem::new(rel, why));
    }

    fn record(&mut self, entry: ManifestEntry) {
        self.recorded.insert(entry.path().to_string());
        self.entries.push(entry);
    }

    /// metadata for `path`: a fresh lstat, elevated when needed
    fn stat(&mut self, path: &Path, rel: &str) -> Option<Metadata> {
        match attempt(
            self.elevation,
            || FileMetadata::from_path(path).map(|m| m.to_metadata()),
            |ctx| ctx.stat(path),
        ) {
            Ok(meta) => Some(meta),
            Err(failed) => {
                debug!(path = %rel, error = %failed.error, "stat failed");
                self.skip(rel, failed.reason(reason::ELEVATED_METADATA_FAILED, reason::STAT_FAILED));
                None
            }
        }
    }

    fn add_directory(&mut self, path: &Path, listed: Option<Metadata>) {
        let rel = relative_path(self.root, path);
        let meta = match listed {
            Some(meta) => meta,
            None => match self.stat(path, &rel) {
                Some(meta) => meta,
                None => return,
            },
        };
        self.summary.directories += 1;
        self.record(ManifestEntry::directory(rel, meta));
    }

    fn add_symlink(&mut self, path: &Path, listed: Option<Metadata>) {
        let rel = relative_path(self.root, path);
        let target = match attempt(
            self.elevation,
            || read_symlink_target(path),
            |ctx| ctx.read_link(path),
        ) {
            Ok(target) => target,
            Err(failed) => {
                self.skip(&rel, failed.reason(reason::ELEVATED_METADATA_FAILED, reason::READ_FAILED));
                return;
            }
        };
        let meta = match listed {
            Some(meta) => meta,
            None => match self.stat(path, &rel) {
                Some(meta) => meta,
                None => return,
            },
        };
        self.summary.symlinks += 1;
        self.record(ManifestEntry::symlink(rel, target, meta));
    }

    /// record the target of a symlink as a file at its own path, when it is
    /// a regular file inside the root
    fn follow(&mut self, link: &Path) {
        let target = match fs::canonicalize(link) {
            Ok(target) => target,
            Err(e) => {
                debug!(link = %link.display(), error = %e, "not following dangling link");
                return;
            }
        };
        if !target.starts_with(self.root) || !target.is_file() {
            debug!(link = %link.display(), target = %target.display(), "not following");
            return;
        }
        self.add_file(&target, None);
    }

    fn add_file(&mut self, path: &Path, listed: Option<Metadata>) {
        let rel = relative_path(self.root, path);
        if self.recorded.contains(&rel) {
            return;
        }

        let hash = match attempt(self.elevation, || hash_file(path), |ctx| ctx.hash_file(path)) {
            Ok(hash) => hash,
            Err(failed) => {
                let plain = if failed.error.is_permission_denied() {
                    reason::PERMISSION_DENIED
                } else {
                    reason::READ_FAILED
                };
                debug!(path = %rel, error = %failed.error, "hash failed");
                self.skip(&rel, failed.reason(reason::ELEVATED_HASH_FAILED, plain));
                return;
            }
        };

        // metadata is read after hashing so the recorded atime is the settled one
        let meta = match listed {
            Some(listed) => attempt(
                self.elevation,
                || FileMetadata::from_path(path).map(|m| m.to_metadata()),
                |ctx| ctx.stat(path),
            )
            .unwrap_or(listed),
            None => match self.stat(path, &rel) {
                Some(meta) => meta,
                None => return,
            },
        };

        match self.index.decide(&hash) {
            Decision::Duplicate(why) => {
                debug!(path = %rel, hash = %hash, ?why, "duplicate content");
                self.summary.duplicate += 1;
            }
            Decision::Stage => {
                let dest = self.files_dir.join(hash.to_hex());
                if let Err(failed) = attempt(
                    self.elevation,
                    || stage_copy(path, &dest),
                    |ctx| ctx.copy_file(path, &dest),
                ) {
                    let _ = fs::remove_file(&dest);
                    debug!(path = %rel, error = %failed.error, "staging failed");
                    self.skip(&rel, failed.reason(reason::ELEVATED_COPY_FAILED, reason::STAGE_FAILED));
                    return;
                }
                self.index.mark_seen(hash);
                self.summary.added += 1;
            }
        }

        self.summary.total_bytes += meta.size;
        self.record(ManifestEntry::file(rel, hash, meta));
    }
}

/// copy source content into the staging area without touching its atime
fn stage_copy(src: &Path, dest: &Path) -> Result<()> {
    let mut input = open_for_read(src).with_path(src)?;
    let mut output = File::create(dest).with_path(dest)?;
    std::io::copy(&mut input, &mut output).with_path(src)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hash::Hash;
    use crate::versions::read_manifest;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;
    use walkdir::WalkDir;

    /// pin atimes after mtimes so reads cannot move them again
    pub(crate) fn settle(root: &Path) {
        let now = chrono::Utc::now().timestamp();
        let mut paths: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap().into_path())
            .filter(|p| !p.symlink_metadata().unwrap().file_type().is_symlink())
            .collect();
        paths.reverse();
        for path in paths {
            crate::fs::set_times(&path, now, now - 100).unwrap();
        }
    }

    /// an elevation program stand-in: drops the credential, strips its own
    /// options and runs `body` with the elevated command in "$@"
    pub(crate) fn fake_elevation(dir: &Path, body: &str) -> ElevationContext {
        let script = dir.join("fake-sudo");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\nread -r _cred\nwhile [ \"$1\" != \"--\" ]; do shift; done\nshift\n{}",
                body
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        ElevationContext::new(script.to_string_lossy(), "pw", Duration::from_secs(10))
    }

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("docs/deep")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("docs/b.txt"), "bravo").unwrap();
        fs::write(root.join("docs/deep/copy.txt"), "alpha").unwrap();
        symlink("a.txt", root.join("link")).unwrap();
        settle(root);
    }

    fn blob_count(repo: &Repository) -> usize {
        repo.list("files/*").unwrap().len()
    }

    #[test]
    fn test_commit_records_all_kinds() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        sample_tree(src.path());
        let repo = Repository::dir(store.path(), None);

        let outcome = commit(&repo, src.path(), "first", &CommitOptions::default(), None).unwrap();
        let summary = match outcome {
            CommitOutcome::Committed(s) => s,
            other => panic!("expected commit, got {:?}", other),
        };
        assert_eq!(summary.id, Some(1));
        assert_eq!(summary.scanned, 6);
        assert_eq!(summary.added, 2);
        assert_eq!(summary.duplicate, 1);
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.total_bytes, 15);
        assert!(!summary.is_partial());
        assert_eq!(blob_count(&repo), 2);

        let versions = list_versions(&repo).unwrap();
        let manifest = read_manifest(&repo, &versions[0]).unwrap();
        assert_eq!(manifest.comment, "first");
        let paths: Vec<&str> = manifest.entries().iter().map(|e| e.path()).collect();
        assert_eq!(
            paths,
            vec!["a.txt", "docs", "docs/b.txt", "docs/deep", "docs/deep/copy.txt", "link"]
        );
        assert_eq!(
            manifest.get("docs/deep/copy.txt").unwrap().hash(),
            Some(&Hash::of_bytes(b"alpha"))
        );
    }

    #[test]
    fn test_unchanged_tree_is_idempotent() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        sample_tree(src.path());
        let repo = Repository::dir(store.path(), None);

        commit(&repo, src.path(), "one", &CommitOptions::default(), None).unwrap();
        let again = commit(&repo, src.path(), "two", &CommitOptions::default(), None).unwrap();

        assert!(matches!(again, CommitOutcome::NoChanges(_)));
        assert_eq!(again.summary().id, Some(1));
        assert_eq!(list_versions(&repo).unwrap().len(), 1);
    }

    #[test]
    fn test_dedup_across_commits() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        sample_tree(src.path());
        let repo = Repository::dir(store.path(), None);
        commit(&repo, src.path(), "one", &CommitOptions::default(), None).unwrap();

        fs::write(src.path().join("new.txt"), "bravo").unwrap();
        fs::write(src.path().join("other.txt"), "charlie").unwrap();
        let outcome = commit(&repo, src.path(), "two", &CommitOptions::default(), None).unwrap();

        let summary = outcome.summary();
        assert_eq!(summary.id, Some(2));
        assert_eq!(summary.added, 1);
        assert_eq!(summary.duplicate, 4);
        assert_eq!(blob_count(&repo), 3);
    }

    #[test]
    fn test_commit_id_follows_highest() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        sample_tree(src.path());

        // ids 1, 2 and 4 already exist
        let staging = tempdir().unwrap();
        let versions_dir = staging.path().join(VERSIONS_DIR);
        fs::create_dir_all(&versions_dir).unwrap();
        for id in [1, 2, 4] {
            fs::write(versions_dir.join(format!("{}-2000010{}T000000.manifest", id, id)), "").unwrap();
        }
        let repo = Repository::dir(store.path(), None);
        repo.add(staging.path(), &[VERSIONS_DIR.to_string()]).unwrap();

        let outcome = commit(&repo, src.path(), "", &CommitOptions::default(), None).unwrap();
        assert_eq!(outcome.summary().id, Some(5));
    }

    #[test]
    fn test_follow_records_target_once() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::create_dir(src.path().join("z")).unwrap();
        fs::write(src.path().join("z/target.txt"), "t").unwrap();
        symlink("z/target.txt", src.path().join("a-link")).unwrap();
        symlink("/etc/hostname", src.path().join("outside")).unwrap();
        settle(src.path());
        let repo = Repository::dir(store.path(), None);

        let opts = CommitOptions {
            follow_symlinks: true,
        };
        commit(&repo, src.path(), "", &opts, None).unwrap();

        let versions = list_versions(&repo).unwrap();
        let manifest = read_manifest(&repo, &versions[0]).unwrap();
        let paths: Vec<(&str, &str)> = manifest
            .entries()
            .iter()
            .map(|e| (e.path(), e.type_name()))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("a-link", "symlink"),
                ("z/target.txt", "file"),
                ("outside", "symlink"),
                ("z", "directory"),
            ]
        );
    }

    #[test]
    fn test_backend_failure_leaves_no_commit() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        sample_tree(src.path());
        let repo = Repository::dir(&store.path().join("repo"), None);
        commit(&repo, src.path(), "", &CommitOptions::default(), None).unwrap();
        fs::write(src.path().join("more.txt"), "more").unwrap();

        // a read-only store cannot take the new entries
        fs::set_permissions(store.path().join("repo/files"), fs::Permissions::from_mode(0o555)).unwrap();
        let result = commit(&repo, src.path(), "", &CommitOptions::default(), None);
        fs::set_permissions(store.path().join("repo/files"), fs::Permissions::from_mode(0o755)).unwrap();

        assert!(result.is_err());
        assert_eq!(list_versions(&repo).unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(src.path().join("open.txt"), "open").unwrap();
        fs::write(src.path().join("secret.txt"), "secret").unwrap();
        fs::set_permissions(src.path().join("secret.txt"), fs::Permissions::from_mode(0o000)).unwrap();
        let repo = Repository::dir(store.path(), None);

        let outcome = commit(&repo, src.path(), "", &CommitOptions::default(), None).unwrap();
        let summary = outcome.summary();
        assert!(summary.is_partial());
        assert_eq!(
            summary.skipped,
            vec![SkippedItem::new("secret.txt", reason::PERMISSION_DENIED)]
        );
        assert_eq!(summary.added, 1);
    }

    #[test]
    fn test_unreadable_file_committed_through_elevation() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let tools = tempdir().unwrap();
        let secret = src.path().join("secret.txt");
        fs::write(src.path().join("open.txt"), "open").unwrap();
        fs::write(&secret, "secret").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();

        let calls = tools.path().join("calls.log");
        let ctx = fake_elevation(
            tools.path(),
            &format!(
                "echo \"$1\" >> '{calls}'\nchmod 600 '{secret}'\n\"$@\"\nrc=$?\nchmod 000 '{secret}'\nexit $rc\n",
                calls = calls.display(),
                secret = secret.display(),
            ),
        );
        let repo = Repository::dir(store.path(), None);

        let outcome = commit(&repo, src.path(), "", &CommitOptions::default(), Some(&ctx)).unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let summary = outcome.summary();
        assert!(summary.skipped.is_empty(), "{:?}", summary.skipped);
        assert_eq!(summary.added, 2);
        assert_eq!(fs::read_to_string(&calls).unwrap(), "md5sum\ncat\n");

        let blob = store.path().join("files").join(Hash::of_bytes(b"secret").to_hex());
        assert_eq!(fs::read_to_string(blob).unwrap(), "secret");
        let manifest = read_manifest(&repo, &list_versions(&repo).unwrap()[0]).unwrap();
        let entry = manifest.get("secret.txt").unwrap();
        assert_eq!(entry.metadata().unwrap().mode & 0o777, 0);
    }

    #[test]
    fn test_failed_elevated_hash_is_recorded() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let tools = tempdir().unwrap();
        let secret = src.path().join("secret.txt");
        fs::write(&secret, "secret").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
        let ctx = fake_elevation(tools.path(), "echo denied >&2\nexit 1\n");
        let repo = Repository::dir(store.path(), None);

        let outcome = commit(&repo, src.path(), "", &CommitOptions::default(), Some(&ctx)).unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        assert_eq!(
            outcome.summary().skipped,
            vec![SkippedItem::new("secret.txt", reason::ELEVATED_HASH_FAILED)]
        );
        assert_eq!(outcome.summary().added, 0);
    }
}
