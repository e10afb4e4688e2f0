use tracing::info;

use crate::error::Result;
use crate::repo::Repository;

/// ask the backend to check and repair the repository
pub fn repair(repo: &Repository) -> Result<()> {
    info!(repo = %repo.describe(), "repairing");
    repo.repair()?;
    info!("repair finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ops::commit::tests::settle;
    use crate::ops::{commit, CommitOptions};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_repair_reports_damage() {
        let src = tempdir().unwrap();
        let store = tempdir().unwrap();
        fs::write(src.path().join("f"), "payload").unwrap();
        settle(src.path());
        let repo = Repository::dir(store.path(), None);
        commit(&repo, src.path(), "", &CommitOptions::default(), None).unwrap();
        repair(&repo).unwrap();

        let blob = repo.list("files/*").unwrap().remove(0);
        fs::write(store.path().join(&blob), "bitrot").unwrap();
        assert!(matches!(repair(&repo), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_repair_without_repository() {
        let store = tempdir().unwrap();
        let repo = Repository::dir(&store.path().join("missing"), None);
        assert!(matches!(repair(&repo), Err(Error::NoRepository(_))));
    }
}
