use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{compile_pattern, entry_matches, ArchiveBackend};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::hash_file;
use crate::hash::Hash;
use crate::types::{hash_from_blob_entry, FILES_DIR};

const STORE_FILE: &str = "store.toml";
const STORE_FORMAT: u32 = 1;

/// store.toml at the root of a directory store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct StoreConfig {
    format: u32,
    /// md5 of the password, when the store was created with one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password_md5: Option<String>,
}

/// a plain directory laid out like the archive namespace
///
/// entries are ordinary files under the root. there is no encryption and no
/// recovery record: the password only gates access, and `repair` can detect
/// damaged blobs but not rebuild them.
#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE)
    }

    fn load_store(&self) -> Result<Option<StoreConfig>> {
        let path = self.store_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).with_path(&path)?;
        Ok(Some(toml::from_str(&content)?))
    }

    /// the store, or NoRepository when it was never written
    fn require_store(&self) -> Result<StoreConfig> {
        self.load_store()?
            .ok_or_else(|| Error::NoRepository(self.root.clone()))
    }

    fn check_password(store: &StoreConfig, password: Option<&str>) -> Result<()> {
        match (&store.password_md5, password) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(Error::Authentication("password required".to_string())),
            (Some(digest), Some(pw)) => {
                if Hash::of_bytes(pw.as_bytes()).to_hex() == *digest {
                    Ok(())
                } else {
                    Err(Error::Authentication("incorrect password".to_string()))
                }
            }
        }
    }

    fn create_store(&self, password: Option<&str>) -> Result<StoreConfig> {
        fs::create_dir_all(&self.root).with_path(&self.root)?;
        let store = StoreConfig {
            format: STORE_FORMAT,
            password_md5: password.map(|pw| Hash::of_bytes(pw.as_bytes()).to_hex()),
        };
        let path = self.store_path();
        fs::write(&path, toml::to_string_pretty(&store)?).with_path(&path)?;
        Ok(store)
    }

    /// every stored entry name, sorted
    fn entry_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io {
                path: e.path().unwrap_or(&self.root).to_path_buf(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if rel == STORE_FILE || rel.is_empty() {
                continue;
            }
            names.push(rel);
        }
        Ok(names)
    }

    /// copy one file into the store through a temp file; existing entries win
    fn store_entry(&self, src: &Path, rel: &Path) -> Result<bool> {
        let dest = self.root.join(rel);
        if dest.exists() {
            return Ok(false);
        }
        let parent = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).with_path(parent)?;

        let tmp = tempfile::NamedTempFile::new_in(parent).with_path(parent)?;
        fs::copy(src, tmp.path()).with_path(src)?;
        tmp.persist(&dest).map_err(|e| Error::Io {
            path: dest.clone(),
            source: e.error,
        })?;
        Ok(true)
    }
}

impl ArchiveBackend for DirBackend {
    fn list(&self, pattern: &str, password: Option<&str>) -> Result<Vec<String>> {
        let Some(store) = self.load_store()? else {
            return Ok(Vec::new());
        };
        Self::check_password(&store, password)?;
        let pattern = compile_pattern(pattern)?;
        Ok(self
            .entry_names()?
            .into_iter()
            .filter(|name| entry_matches(&pattern, name))
            .collect())
    }

    fn add(
        &self,
        base: &Path,
        names: &[String],
        _redundancy_percent: u8,
        password: Option<&str>,
    ) -> Result<()> {
        let store = match self.load_store()? {
            Some(store) => store,
            None => self.create_store(password)?,
        };
        Self::check_password(&store, password)?;

        let mut added = 0usize;
        let mut kept = 0usize;
        for name in names {
            let top = base.join(name);
            for entry in WalkDir::new(&top).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Io {
                    path: top.clone(),
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk error")),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
                if self.store_entry(entry.path(), rel)? {
                    added += 1;
                } else {
                    kept += 1;
                }
            }
        }
        debug!(store = %self.root.display(), added, kept, "stored entries");
        Ok(())
    }

    fn extract(&self, names: &[String], dest: &Path, password: Option<&str>) -> Result<()> {
        let store = self.require_store()?;
        Self::check_password(&store, password)?;

        for name in names {
            let src = self.root.join(name);
            if !src.is_file() {
                debug!(entry = %name, "not in store");
                continue;
            }
            let target = dest.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).with_path(parent)?;
            }
            fs::copy(&src, &target).with_path(&target)?;
        }
        Ok(())
    }

    fn repair(&self, password: Option<&str>) -> Result<()> {
        let store = self.require_store()?;
        Self::check_password(&store, password)?;

        let mut damaged = Vec::new();
        for name in self.entry_names()? {
            let Some(expected) = hash_from_blob_entry(&name) else {
                if name.starts_with(FILES_DIR) {
                    warn!(entry = %name, "unexpected entry in blob namespace");
                }
                continue;
            };
            let actual = hash_file(&self.root.join(&name))?;
            if actual != expected {
                warn!(entry = %name, actual = %actual, "blob content does not match its name");
                damaged.push(name);
            }
        }

        if damaged.is_empty() {
            Ok(())
        } else {
            Err(Error::Corruption(format!(
                "{} damaged blob(s): {}",
                damaged.len(),
                damaged.join(", ")
            )))
        }
    }

    fn test_password(&self, password: &str) -> Result<bool> {
        let Some(store) = self.load_store()? else {
            return Ok(true);
        };
        match Self::check_password(&store, Some(password)) {
            Ok(()) => Ok(true),
            Err(Error::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}
