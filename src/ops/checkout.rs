use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::elevate::{attempt, ElevationContext, FailedAttempt};
use crate::error::{IoResultExt, Result};
use crate::fs::{
    create_symlink, place_file, resolve_group, resolve_owner, set_mode, set_owner,
    set_symlink_owner, set_times,
};
use crate::hash::Hash;
use crate::repo::Repository;
use crate::types::{blob_entry, reason, ManifestEntry, Metadata, SkippedItem};
use crate::versions::{list_versions, read_manifest, resolve_version};

/// checkout options
#[derive(Clone, Debug, Default)]
pub struct CheckoutOptions {
    /// create plain directories instead of symlinks
    pub force_directory: bool,
}

/// counts and per-path errors of one checkout
#[derive(Clone, Debug, Default)]
pub struct CheckoutSummary {
    pub id: u64,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    /// symlinks replaced by plain directories
    pub fallback_directories: usize,
    pub skipped: Vec<SkippedItem>,
    pub elapsed: Duration,
}

impl CheckoutSummary {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// rebuild commit `id` under `dest`
///
/// existing files at the same paths are overwritten. directory metadata is
/// restored last, deepest first, so placing files cannot disturb it.
pub fn checkout(
    repo: &Repository,
    id: u64,
    dest: &Path,
    opts: &CheckoutOptions,
    elevation: Option<&ElevationContext>,
) -> Result<CheckoutSummary> {
    let started = Instant::now();
    let versions = list_versions(repo)?;
    let version = resolve_version(&versions, id)?;
    let manifest = read_manifest(repo, version)?;
    info!(version = %version, dest = %dest.display(), entries = manifest.len(), "checking out");

    fs::create_dir_all(dest).with_path(dest)?;

    let mut placer = Placer {
        dest,
        elevation,
        privileged: elevation.is_some() || nix::unistd::geteuid().is_root(),
        summary: CheckoutSummary {
            id,
            ..Default::default()
        },
    };

    // directories and links first; files are collected for one extraction
    let mut dirs: Vec<(&str, Option<&Metadata>)> = Vec::new();
    let mut links: HashSet<&str> = HashSet::new();
    let mut fallback_roots: Vec<&str> = Vec::new();
    let mut files: Vec<(&str, &Hash, Option<&Metadata>)> = Vec::new();

    for entry in manifest.entries() {
        if !stays_inside(entry.path()) {
            warn!(path = %entry.path(), "manifest path leaves the destination");
            placer.skip(entry.path(), reason::INVALID_PATH);
            continue;
        }
        match entry {
            ManifestEntry::Directory { path, metadata } => {
                let target = dest.join(path);
                match fs::create_dir_all(&target) {
                    Ok(()) => {
                        placer.summary.directories += 1;
                        dirs.push((path.as_str(), metadata.as_ref()));
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "cannot create directory");
                        placer.skip(path, reason::WRITE_FAILED);
                    }
                }
            }
            ManifestEntry::Symlink {
                path,
                target,
                metadata,
            } => {
                if !opts.force_directory && placer.place_symlink(path, target, metadata.as_ref()) {
                    links.insert(path.as_str());
                    continue;
                }
                match fs::create_dir_all(dest.join(path)) {
                    Ok(()) => {
                        debug!(path = %path, "directory in place of symlink");
                        placer.summary.fallback_directories += 1;
                        fallback_roots.push(path.as_str());
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "cannot create fallback directory");
                        placer.skip(path, reason::WRITE_FAILED);
                    }
                }
            }
            ManifestEntry::File {
                path,
                hash,
                metadata,
            } => files.push((path.as_str(), hash, metadata.as_ref())),
        }
    }

    // a file below a real symlink would be written through it
    files.retain(|(path, _, _)| {
        let behind = links.iter().any(|link| is_below(path, link))
            && !fallback_roots.iter().any(|root| is_below(path, root));
        if behind {
            placer.skip(path, reason::BEHIND_SYMLINK);
        }
        !behind
    });

    let names: Vec<String> = files
        .iter()
        .map(|(_, hash, _)| blob_entry(hash))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let blobs = tempfile::tempdir().with_path(std::env::temp_dir())?;
    repo.extract(&names, blobs.path())?;

    for (path, hash, metadata) in files {
        let blob = blobs.path().join(blob_entry(hash));
        if !blob.is_file() {
            warn!(path = %path, hash = %hash, "content blob missing from repository");
            placer.skip(path, reason::MISSING_BLOB);
            continue;
        }
        placer.place_file(path, &blob, metadata);
    }

    dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.matches('/').count()));
    for (path, metadata) in dirs {
        if let Some(meta) = metadata {
            placer.restore_metadata(path, meta, false);
        }
    }

    let mut summary = placer.summary;
    summary.elapsed = started.elapsed();
    info!(
        files = summary.files,
        directories = summary.directories,
        symlinks = summary.symlinks,
        skipped = summary.skipped.len(),
        "checkout finished"
    );
    Ok(summary)
}

/// true for relative paths without `..`, so joining cannot leave the destination
fn stays_inside(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// true when `path` lies strictly inside `dir`
fn is_below(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}

struct Placer<'a> {
    dest: &'a Path,
    elevation: Option<&'a ElevationContext>,
    /// ownership is only restored as root or through elevation
    privileged: bool,
    summary: CheckoutSummary,
}

impl Placer<'_> {
    fn skip(&mut self, path: &str, why: &str) {
        self.summary.skipped.push(SkippedItem::new(path, why));
    }

    fn target(&self, path: &str) -> PathBuf {
        self.dest.join(path)
    }

    fn metadata_failed(&mut self, path: &str, failed: FailedAttempt) {
        let plain = if failed.error.is_permission_denied() {
            reason::PERMISSION_DENIED
        } else {
            reason::WRITE_FAILED
        };
        debug!(path = %path, error = %failed.error, "metadata restore failed");
        self.skip(path, failed.reason(reason::ELEVATED_METADATA_FAILED, plain));
    }

    /// create and verify a symlink; false means the caller falls back
    fn place_symlink(&mut self, path: &str, target: &str, metadata: Option<&Metadata>) -> bool {
        let link = self.target(path);
        if let Some(parent) = link.parent() {
            if fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        if let Err(e) = create_symlink(&link, target) {
            debug!(path = %path, error = %e, "symlink not created");
            return false;
        }
        self.summary.symlinks += 1;

        if let Some(meta) = metadata.filter(|_| self.privileged) {
            if let (Some(uid), Some(gid)) = (resolve_owner(&meta.owner), resolve_group(&meta.group)) {
                if let Err(failed) = attempt(
                    self.elevation,
                    || set_symlink_owner(&link, uid, gid),
                    |ctx| ctx.lchown(&link, &meta.owner, &meta.group),
                ) {
                    self.metadata_failed(path, failed);
                }
            }
        }
        true
    }

    fn place_file(&mut self, path: &str, blob: &Path, metadata: Option<&Metadata>) {
        let target = self.target(path);
        if let Some(parent) = target.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = %path, error = %e, "cannot create parent directory");
                self.skip(path, reason::WRITE_FAILED);
                return;
            }
        }
        if let Err(e) = place_file(blob, &target) {
            warn!(path = %path, error = %e, "cannot write file");
            self.skip(path, reason::WRITE_FAILED);
            return;
        }
        self.summary.files += 1;

        if let Some(meta) = metadata {
            self.restore_metadata(path, meta, true);
        }
    }

    /// chmod, then chown/chgrp when privileged, then times last
    fn restore_metadata(&mut self, path: &str, meta: &Metadata, is_file: bool) {
        let target = self.target(path);

        if let Err(failed) = attempt(
            self.elevation,
            || set_mode(&target, meta.mode),
            |ctx| ctx.chmod(&target, meta.mode),
        ) {
            self.metadata_failed(path, failed);
            return;
        }

        if self.privileged {
            match (resolve_owner(&meta.owner), resolve_group(&meta.group)) {
                (Some(uid), Some(gid)) => {
                    if let Err(failed) = attempt(
                        self.elevation,
                        || set_owner(&target, uid, gid),
                        |ctx| ctx.chown(&target, &meta.owner, &meta.group),
                    ) {
                        self.metadata_failed(path, failed);
                        return;
                    }
                    // chown drops setuid/setgid on non-directories
                    if meta.mode & 0o6000 != 0 {
                        if let Err(failed) = attempt(
                            self.elevation,
                            || set_mode(&target, meta.mode),
                            |ctx| ctx.chmod(&target, meta.mode),
                        ) {
                            self.metadata_failed(path, failed);
                            return;
                        }
                    }
                }
                _ => debug!(path = %path, owner = %meta.owner, group = %meta.group, "unknown owner, not restored"),
            }
        }

        if let Err(failed) = attempt(
            self.elevation,
            || set_times(&target, meta.atime, meta.mtime),
            |ctx| ctx.touch(&target, meta.atime, meta.mtime),
        ) {
            self.metadata_failed(path, failed);
            return;
        }
        if !is_file {
            debug!(path = %path, "directory metadata restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_entry;
    use crate::ops::commit::tests::{fake_elevation, settle};
    use crate::ops::{commit, CommitOptions};
    use crate::types::VERSIONS_DIR;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use tempfile::tempdir;
    use walkdir::WalkDir;

    fn meta(mode: u32) -> Metadata {
        Metadata {
            mode,
            owner: crate::fs::owner_name(nix::unistd::getuid().as_raw()),
            group: crate::fs::group_name(nix::unistd::getgid().as_raw()),
            mtime: 1_600_000_000,
            atime: 1_600_000_500,
            ctime: 1_600_000_000,
            size: 0,
        }
    }

    /// write a hand-made commit straight into a directory store
    fn store_commit(repo: &Repository, entries: &[ManifestEntry], blobs: &[&[u8]]) {
        let staging = tempdir().unwrap();
        let files = staging.path().join("files");
        let versions = staging.path().join(VERSIONS_DIR);
        fs::create_dir_all(&files).unwrap();
        fs::create_dir_all(&versions).unwrap();
        for blob in blobs {
            fs::write(files.join(Hash::of_bytes(blob).to_hex()), blob).unwrap();
        }
        let text: String = entries.iter().map(|e| encode_entry(e) + "\n").collect();
        fs::write(versions.join("1-20240101T000000.manifest"), text).unwrap();
        repo.add(staging.path(), &["files".to_string(), VERSIONS_DIR.to_string()])
            .unwrap();
    }

    fn relative_files(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut out: Vec<(String, Vec<u8>)> = WalkDir::new(root)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_roundtrip() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let root = src.path();
        fs::create_dir_all(root.join("etc/conf.d")).unwrap();
        fs::write(root.join("etc/conf.d/a.conf"), "a=1\n").unwrap();
        fs::write(root.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        fs::write(root.join("same.txt"), "a=1\n").unwrap();
        fs::write(root.join("run.sh"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("run.sh"), fs::Permissions::from_mode(0o750)).unwrap();
        symlink("etc/hosts", root.join("hosts")).unwrap();
        settle(root);

        let repo = Repository::dir(store.path(), None);
        let committed = commit(&repo, root, "rt", &CommitOptions::default(), None).unwrap();
        let id = committed.summary().id.unwrap();

        let summary = checkout(&repo, id, out.path(), &CheckoutOptions::default(), None).unwrap();
        assert!(!summary.is_partial(), "{:?}", summary.skipped);
        assert_eq!(summary.files, 4);
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.symlinks, 1);

        let original: Vec<_> = relative_files(root)
            .into_iter()
            .filter(|(p, _)| p != "hosts")
            .collect();
        assert_eq!(relative_files(out.path()), original);
        assert_eq!(fs::read_link(out.path().join("hosts")).unwrap().to_string_lossy(), "etc/hosts");

        let src_meta = fs::metadata(root.join("run.sh")).unwrap();
        let out_meta = fs::metadata(out.path().join("run.sh")).unwrap();
        assert_eq!(out_meta.mode() & 0o7777, 0o750);
        assert_eq!(out_meta.mtime(), src_meta.mtime());

        let src_dir = fs::metadata(root.join("etc")).unwrap();
        let out_dir = fs::metadata(out.path().join("etc")).unwrap();
        assert_eq!(out_dir.mtime(), src_dir.mtime());
    }

    #[test]
    fn test_symlink_failure_falls_back_to_directory() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::symlink("link", "elsewhere", meta(0o777)),
                ManifestEntry::file("link/inner.txt", Hash::of_bytes(b"inner"), meta(0o644)),
                ManifestEntry::file("top.txt", Hash::of_bytes(b"top"), meta(0o644)),
            ],
            &[b"inner", b"top"],
        );

        // a non-empty directory in the way makes the symlink impossible
        fs::create_dir(out.path().join("link")).unwrap();
        fs::write(out.path().join("link/keep"), "k").unwrap();

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), None).unwrap();
        assert_eq!(summary.fallback_directories, 1);
        assert_eq!(summary.symlinks, 0);
        assert_eq!(summary.files, 2);
        assert!(!summary.is_partial());
        assert!(out.path().join("link").symlink_metadata().unwrap().is_dir());
        assert_eq!(fs::read_to_string(out.path().join("link/inner.txt")).unwrap(), "inner");
    }

    #[test]
    fn test_force_directory() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::symlink("lib", "lib64", meta(0o777)),
                ManifestEntry::file("lib/x.so", Hash::of_bytes(b"elf"), meta(0o755)),
            ],
            &[b"elf"],
        );

        let opts = CheckoutOptions {
            force_directory: true,
        };
        let summary = checkout(&repo, 1, out.path(), &opts, None).unwrap();
        assert_eq!(summary.fallback_directories, 1);
        assert!(out.path().join("lib").symlink_metadata().unwrap().is_dir());
        assert_eq!(fs::read(out.path().join("lib/x.so")).unwrap(), b"elf");
    }

    #[test]
    fn test_file_behind_real_symlink_skipped() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::symlink("lib", "/tmp", meta(0o777)),
                ManifestEntry::file("lib/x.so", Hash::of_bytes(b"elf"), meta(0o755)),
            ],
            &[b"elf"],
        );

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), None).unwrap();
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.skipped, vec![SkippedItem::new("lib/x.so", reason::BEHIND_SYMLINK)]);
    }

    #[test]
    fn test_missing_blob_does_not_abort() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::file("gone.txt", Hash::of_bytes(b"gone"), meta(0o644)),
                ManifestEntry::file("here.txt", Hash::of_bytes(b"here"), meta(0o644)),
            ],
            &[b"here"],
        );

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), None).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped, vec![SkippedItem::new("gone.txt", reason::MISSING_BLOB)]);
        assert_eq!(fs::read_to_string(out.path().join("here.txt")).unwrap(), "here");
    }

    #[test]
    fn test_directory_metadata_restored_after_files() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::directory("d", meta(0o750)),
                ManifestEntry::directory("d/e", meta(0o700)),
                ManifestEntry::file("d/e/f.txt", Hash::of_bytes(b"f"), meta(0o600)),
            ],
            &[b"f"],
        );

        checkout(&repo, 1, out.path(), &CheckoutOptions::default(), None).unwrap();
        for (path, mode) in [("d", 0o750), ("d/e", 0o700), ("d/e/f.txt", 0o600)] {
            let m = fs::metadata(out.path().join(path)).unwrap();
            assert_eq!(m.mode() & 0o7777, mode, "{}", path);
            assert_eq!(m.mtime(), 1_600_000_000, "{}", path);
            assert_eq!(m.atime(), 1_600_000_500, "{}", path);
        }
    }

    #[test]
    fn test_unknown_commit() {
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        let result = checkout(&repo, 3, out.path(), &CheckoutOptions::default(), None);
        assert!(matches!(result, Err(crate::Error::CommitNotFound(3))));
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("a/b", "a"));
        assert!(!is_below("ab/c", "a"));
        assert!(!is_below("a", "a"));
    }

    fn owned_by_root(mode: u32) -> Metadata {
        Metadata {
            owner: "root".to_string(),
            group: "root".to_string(),
            ..meta(mode)
        }
    }

    #[test]
    fn test_setuid_bits_survive_ownership_restore() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::file("su", Hash::of_bytes(b"su"), owned_by_root(0o4755)),
                ManifestEntry::file("wall", Hash::of_bytes(b"wall"), owned_by_root(0o2755)),
            ],
            &[b"su", b"wall"],
        );

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), None).unwrap();
        assert!(summary.skipped.is_empty(), "{:?}", summary.skipped);
        let mode = |name: &str| fs::metadata(out.path().join(name)).unwrap().mode() & 0o7777;
        assert_eq!(mode("su"), 0o4755);
        assert_eq!(mode("wall"), 0o2755);
    }

    #[test]
    fn test_ownership_restored_through_elevation() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tools = tempdir().unwrap();
        let calls = tools.path().join("calls.log");
        let ctx = fake_elevation(
            tools.path(),
            &format!("echo \"$@\" >> '{}'\nexit 0\n", calls.display()),
        );
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::file("owned.txt", Hash::of_bytes(b"owned"), owned_by_root(0o640)),
                ManifestEntry::symlink("link", "owned.txt", owned_by_root(0o777)),
            ],
            &[b"owned"],
        );

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), Some(&ctx)).unwrap();
        assert!(summary.skipped.is_empty(), "{:?}", summary.skipped);

        let log = fs::read_to_string(&calls).unwrap();
        let link = out.path().join("link");
        let file = out.path().join("owned.txt");
        assert!(log.contains(&format!("chown -h root:root -- {}", link.display())), "{}", log);
        assert!(log.contains(&format!("chown root:root -- {}", file.display())), "{}", log);
        // mode and times were ours to set without elevation
        assert!(!log.contains("chmod") && !log.contains("touch"), "{}", log);
        assert_eq!(fs::metadata(&file).unwrap().mtime(), 1_600_000_000);
    }

    #[test]
    fn test_failed_elevated_restore_is_recorded() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let store = tempdir().unwrap();
        let out = tempdir().unwrap();
        let tools = tempdir().unwrap();
        let ctx = fake_elevation(tools.path(), "echo 'not permitted' >&2\nexit 1\n");
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[ManifestEntry::file("owned.txt", Hash::of_bytes(b"owned"), owned_by_root(0o640))],
            &[b"owned"],
        );

        let summary = checkout(&repo, 1, out.path(), &CheckoutOptions::default(), Some(&ctx)).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(
            summary.skipped,
            vec![SkippedItem::new("owned.txt", reason::ELEVATED_METADATA_FAILED)]
        );
        assert_eq!(fs::read_to_string(out.path().join("owned.txt")).unwrap(), "owned");
    }

    #[test]
    fn test_paths_leaving_destination_rejected() {
        let store = tempdir().unwrap();
        let parent = tempdir().unwrap();
        let out = parent.path().join("out");
        let repo = Repository::dir(store.path(), None);
        store_commit(
            &repo,
            &[
                ManifestEntry::file("../escape.txt", Hash::of_bytes(b"x"), meta(0o644)),
                ManifestEntry::directory("/abs", meta(0o755)),
                ManifestEntry::file("ok.txt", Hash::of_bytes(b"x"), meta(0o644)),
            ],
            &[b"x"],
        );

        let summary = checkout(&repo, 1, &out, &CheckoutOptions::default(), None).unwrap();
        assert_eq!(
            summary.skipped,
            vec![
                SkippedItem::new("../escape.txt", reason::INVALID_PATH),
                SkippedItem::new("/abs", reason::INVALID_PATH),
            ]
        );
        assert_eq!(summary.files, 1);
        assert!(!parent.path().join("escape.txt").exists());
        assert_eq!(summary.directories, 0);
    }

    #[test]
    fn test_stays_inside() {
        assert!(stays_inside("a/b.txt"));
        assert!(stays_inside("./a"));
        assert!(!stays_inside("../a"));
        assert!(!stays_inside("a/../../b"));
        assert!(!stays_inside("/etc/passwd"));
    }
}
