use crate::error::{Error, Result};
use crate::repo::Repository;
use crate::types::{CommitInfo, Manifest};
use crate::versions::{latest_version, list_versions, read_comments, read_manifest, resolve_version};

/// all commits with their comments, ordered by id
pub fn list(repo: &Repository) -> Result<Vec<CommitInfo>> {
    let versions = list_versions(repo)?;
    let mut comments = read_comments(repo, &versions)?;
    Ok(versions
        .into_iter()
        .map(|v| {
            let comment = comments.remove(&v).unwrap_or_default();
            CommitInfo {
                id: v.id,
                timestamp: v.timestamp,
                comment,
            }
        })
        .collect())
}

/// the most recent commit
pub fn latest(repo: &Repository) -> Result<CommitInfo> {
    let versions = list_versions(repo)?;
    let version = latest_version(&versions).ok_or(Error::NoCommits)?;
    let manifest = read_manifest(repo, version)?;
    Ok(CommitInfo {
        id: manifest.id,
        timestamp: manifest.timestamp,
        comment: manifest.comment,
    })
}

/// the decoded manifest of commit `id`
pub fn show(repo: &Repository, id: u64) -> Result<Manifest> {
    let versions = list_versions(repo)?;
    read_manifest(repo, resolve_version(&versions, id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::commit::tests::settle;
    use crate::ops::{commit, CommitOptions};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_list_latest_show() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        let repo = Repository::dir(store.path(), None);
        assert!(list(&repo).unwrap().is_empty());
        assert!(matches!(latest(&repo), Err(Error::NoCommits)));

        fs::write(src.path().join("a"), "1").unwrap();
        settle(src.path());
        commit(&repo, src.path(), "first", &CommitOptions::default(), None).unwrap();
        fs::write(src.path().join("b"), "2").unwrap();
        settle(src.path());
        commit(&repo, src.path(), "second", &CommitOptions::default(), None).unwrap();

        let commits = list(&repo).unwrap();
        let summary: Vec<(u64, &str)> = commits.iter().map(|c| (c.id, c.comment.as_str())).collect();
        assert_eq!(summary, vec![(1, "first"), (2, "second")]);

        let newest = latest(&repo).unwrap();
        assert_eq!(newest.id, 2);
        assert_eq!(newest.comment, "second");

        let manifest = show(&repo, 1).unwrap();
        assert_eq!(manifest.files().keys().copied().collect::<Vec<_>>(), vec!["a"]);
        assert!(matches!(show(&repo, 9), Err(Error::CommitNotFound(9))));
    }
}
