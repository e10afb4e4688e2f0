use crate::error::Result;
use crate::repo::Repository;
use crate::types::Manifest;
use crate::versions::{list_versions, read_manifest, resolve_version};

/// file-level differences between two manifests, each list sorted by path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// only in the second manifest
    pub added: Vec<String>,
    /// only in the first manifest
    pub removed: Vec<String>,
    /// in both, with different content
    pub changed: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// compare the file entries of two manifests
///
/// directories and symlinks are not compared.
pub fn diff(a: &Manifest, b: &Manifest) -> DiffResult {
    let old = a.files();
    let new = b.files();
    let mut result = DiffResult::default();

    for (path, entry) in &new {
        match old.get(path) {
            None => result.added.push(path.to_string()),
            Some(previous) if previous.hash() != entry.hash() => {
                result.changed.push(path.to_string())
            }
            Some(_) => {}
        }
    }
    result.removed = old
        .keys()
        .filter(|path| !new.contains_key(*path))
        .map(|path| path.to_string())
        .collect();

    result
}

/// compare two commits by id
pub fn diff_commits(repo: &Repository, id_a: u64, id_b: u64) -> Result<DiffResult> {
    let versions = list_versions(repo)?;
    let a = read_manifest(repo, resolve_version(&versions, id_a)?)?;
    let b = read_manifest(repo, resolve_version(&versions, id_b)?)?;
    Ok(diff(&a, &b))
}
