//! the version namespace: committed manifests and their comments

use std::collections::HashMap;
use std::fs;

use tracing::debug;

use crate::codec::decode_manifest;
use crate::error::{Error, IoResultExt, Result};
use crate::repo::Repository;
use crate::types::{Manifest, VersionName, VERSIONS_DIR};

/// every committed version, ordered by id then recency
pub fn list_versions(repo: &Repository) -> Result<Vec<VersionName>> {
    let entries = repo.list(&format!("{}/*", VERSIONS_DIR))?;
    let mut versions: Vec<VersionName> = entries
        .iter()
        .filter_map(|e| VersionName::from_manifest_entry(e))
        .collect();
    versions.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.recency_cmp(b)));
    Ok(versions)
}

/// the most recent version: highest timestamp, id breaks ties
pub fn latest_version(versions: &[VersionName]) -> Option<&VersionName> {
    versions.iter().max_by(|a, b| a.recency_cmp(b))
}

/// the version for `id`; when several manifests carry it the most recent wins
pub fn resolve_version(versions: &[VersionName], id: u64) -> Result<&VersionName> {
    versions
        .iter()
        .filter(|v| v.id == id)
        .max_by(|a, b| a.recency_cmp(b))
        .ok_or(Error::CommitNotFound(id))
}

/// one past the highest id ever used; ids in gaps are never handed out again
pub fn next_commit_id(versions: &[VersionName]) -> u64 {
    versions.iter().map(|v| v.id).max().map_or(1, |max| max + 1)
}

/// raw manifest text and comment of one version
pub fn read_version_text(repo: &Repository, version: &VersionName) -> Result<(String, String)> {
    let scratch = tempfile::tempdir().with_path(std::env::temp_dir())?;
    let manifest_name = version.manifest_entry();
    let comment_name = version.comment_entry();
    repo.extract(&[manifest_name.clone(), comment_name.clone()], scratch.path())?;

    let manifest_path = scratch.path().join(&manifest_name);
    let text = match fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Corruption(format!(
                "manifest {} is listed but cannot be extracted",
                manifest_name
            )))
        }
        Err(e) => return Err(e).with_path(&manifest_path),
    };
    let comment = fs::read_to_string(scratch.path().join(&comment_name)).unwrap_or_default();
    Ok((text, comment.trim_end_matches('\n').to_string()))
}

/// decoded manifest of one version, with its identity attached
pub fn read_manifest(repo: &Repository, version: &VersionName) -> Result<Manifest> {
    let (text, comment) = read_version_text(repo, version)?;
    let manifest = decode_manifest(&text)?;
    debug!(version = %version, entries = manifest.len(), "read manifest");
    Ok(manifest.with_identity(version.id, version.timestamp.clone(), comment))
}

/// comments for many versions with a single extraction
pub fn read_comments(
    repo: &Repository,
    versions: &[VersionName],
) -> Result<HashMap<VersionName, String>> {
    if versions.is_empty() {
        return Ok(HashMap::new());
    }
    let scratch = tempfile::tempdir().with_path(std::env::temp_dir())?;
    let names: Vec<String> = versions.iter().map(|v| v.comment_entry()).collect();
    repo.extract(&names, scratch.path())?;

    let mut comments = HashMap::with_capacity(versions.len());
    for (version, name) in versions.iter().zip(&names) {
        let comment = fs::read_to_string(scratch.path().join(name)).unwrap_or_default();
        comments.insert(version.clone(), comment.trim_end_matches('\n').to_string());
    }
    Ok(comments)
}
