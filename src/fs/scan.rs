use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::elevate::ElevationContext;
use crate::error::{Error, Result};
use crate::fs::{relative_path, FileType};
use crate::types::{reason, EntryType, Metadata, SkippedItem};

/// one object found by the scanner
#[derive(Debug, Clone)]
pub struct ScanItem {
    /// absolute path
    pub path: PathBuf,
    pub kind: EntryType,
    /// metadata captured by an elevated listing, when the item came from one
    pub listed: Option<Metadata>,
}

/// lazy pre-order walk of a tree, children in byte order
///
/// a directory is yielded after its own listing was read, so the atime
/// recorded for it is the one the listing left behind. subtrees that cannot
/// be listed are re-listed through the elevation context when one is held,
/// otherwise skipped and recorded in `skipped()`.
///
/// the walk can be restarted from the root until an elevated listing has
/// been consumed; after that `restart` fails.
pub struct Scanner<'a> {
    root: PathBuf,
    elevation: Option<&'a ElevationContext>,
    /// paths still to classify, last element next
    stack: Vec<PathBuf>,
    /// items produced by an elevated subtree listing
    listed: VecDeque<ScanItem>,
    skipped: Vec<SkippedItem>,
    started: bool,
    fallback_taken: bool,
}

impl<'a> Scanner<'a> {
    pub fn new(root: &Path, elevation: Option<&'a ElevationContext>) -> Self {
        Self {
            root: root.to_path_buf(),
            elevation,
            stack: Vec::new(),
            listed: VecDeque::new(),
            skipped: Vec::new(),
            started: false,
            fallback_taken: false,
        }
    }

    /// paths left out so far
    pub fn skipped(&self) -> &[SkippedItem] {
        &self.skipped
    }

    /// move the skip records out
    pub fn take_skipped(&mut self) -> Vec<SkippedItem> {
        std::mem::take(&mut self.skipped)
    }

    /// true once an elevated listing has fed this walk
    pub fn used_elevation(&self) -> bool {
        self.fallback_taken
    }

    /// rewind to the root
    pub fn restart(&mut self) -> Result<()> {
        if self.fallback_taken {
            return Err(Error::ScanNotRestartable);
        }
        self.stack.clear();
        self.listed.clear();
        self.skipped.clear();
        self.started = false;
        Ok(())
    }

    fn skip(&mut self, path: &Path, why: &str) {
        let rel = relative_path(&self.root, path);
        debug!(path = %rel, reason = why, "skipping");
        self.skipped.push(SkippedItem::new(rel, why));
    }

    /// queue a directory's children, or fall back to an elevated listing
    fn expand(&mut self, dir: &Path) {
        match read_children(dir) {
            Ok(mut children) => {
                children.sort();
                self.stack.extend(children.into_iter().rev());
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => match self.elevation {
                Some(ctx) => match ctx.list_subtree(dir) {
                    Ok(entries) => {
                        debug!(dir = %dir.display(), count = entries.len(), "elevated listing");
                        self.fallback_taken = true;
                        for entry in entries {
                            match entry.kind {
                                Some(kind) => self.listed.push_back(ScanItem {
                                    path: entry.path,
                                    kind,
                                    listed: Some(entry.metadata),
                                }),
                                None => self.skip(&entry.path, reason::UNSUPPORTED_FILE_TYPE),
                            }
                        }
                    }
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "elevated listing failed");
                        self.skip(dir, reason::ELEVATED_LIST_FAILED);
                    }
                },
                None => self.skip(dir, reason::UNREADABLE_SUBTREE),
            },
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list directory");
                self.skip(dir, reason::READ_FAILED);
            }
        }
    }
}

fn read_children(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect()
}

impl Iterator for Scanner<'_> {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        if !self.started {
            self.started = true;
            let root = self.root.clone();
            self.expand(&root);
        }

        loop {
            if let Some(item) = self.listed.pop_front() {
                return Some(item);
            }

            let path = self.stack.pop()?;
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.skip(&path, reason::VANISHED);
                    continue;
                }
                // listable but not searchable parent: ask the elevation program
                Err(e) if e.kind() == ErrorKind::PermissionDenied => match self.elevation {
                    Some(ctx) => match ctx.stat_entry(&path) {
                        Ok(entry) => match entry.kind {
                            Some(kind) => {
                                debug!(path = %path.display(), "elevated stat");
                                if kind == EntryType::Directory {
                                    self.expand(&path);
                                }
                                return Some(ScanItem {
                                    path,
                                    kind,
                                    listed: Some(entry.metadata),
                                });
                            }
                            None => {
                                self.skip(&path, reason::UNSUPPORTED_FILE_TYPE);
                                continue;
                            }
                        },
                        Err(err) => {
                            debug!(path = %path.display(), error = %err, "elevated stat failed");
                            self.skip(&path, reason::ELEVATED_METADATA_FAILED);
                            continue;
                        }
                    },
                    None => {
                        self.skip(&path, reason::PERMISSION_DENIED);
                        continue;
                    }
                },
                Err(_) => {
                    self.skip(&path, reason::STAT_FAILED);
                    continue;
                }
            };

            let kind = match FileType::from_metadata(&meta) {
                FileType::Directory => {
                    self.expand(&path);
                    EntryType::Directory
                }
                FileType::Symlink => EntryType::Symlink,
                FileType::Regular => EntryType::File,
                FileType::Other => {
                    self.skip(&path, reason::UNSUPPORTED_FILE_TYPE);
                    continue;
                }
            };

            return Some(ScanItem {
                path,
                kind,
                listed: None,
            });
        }
    }
}
