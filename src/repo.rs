use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::backend::{ArchiveBackend, DirBackend, RarBackend};
use crate::config::{BackendKind, Config};
use crate::error::Result;

/// a verstash repository: one archive backend plus the session password
pub struct Repository {
    backend: Box<dyn ArchiveBackend>,
    password: Option<String>,
    redundancy_percent: u8,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("backend", &self.backend.describe())
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("redundancy_percent", &self.redundancy_percent)
            .finish()
    }
}

impl Repository {
    pub fn new(backend: Box<dyn ArchiveBackend>, password: Option<String>, redundancy_percent: u8) -> Self {
        Self {
            backend,
            password,
            redundancy_percent,
        }
    }

    /// open the repository at `location` with the configured engine
    pub fn open(
        config: &Config,
        location: &Path,
        password: Option<String>,
        show_progress: bool,
    ) -> Result<Self> {
        let backend: Box<dyn ArchiveBackend> = match config.backend {
            BackendKind::Rar => Box::new(
                RarBackend::new(config.archiver.clone(), location)?
                    .low_priority(config.low_priority)
                    .show_progress(show_progress),
            ),
            BackendKind::Dir => Box::new(DirBackend::new(location)),
        };
        debug!(backend = %backend.describe(), "opened repository");
        Ok(Self::new(backend, password, config.redundancy_percent))
    }

    /// a directory store at `path`
    pub fn dir(path: &Path, password: Option<String>) -> Self {
        Self::new(Box::new(DirBackend::new(path)), password, 0)
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// replace the session password (after prompting)
    pub fn set_password(&mut self, password: Option<String>) {
        self.password = password;
    }

    pub fn redundancy_percent(&self) -> u8 {
        self.redundancy_percent
    }

    pub fn list(&self, pattern: &str) -> Result<Vec<String>> {
        self.backend.list(pattern, self.password())
    }

    pub fn add(&self, base: &Path, names: &[String]) -> Result<()> {
        self.backend
            .add(base, names, self.redundancy_percent, self.password())
    }

    pub fn extract(&self, names: &[String], dest: &Path) -> Result<()> {
        self.backend.extract(names, dest, self.password())
    }

    pub fn repair(&self) -> Result<()> {
        self.backend.repair(self.password())
    }

    pub fn test_password(&self, password: &str) -> Result<bool> {
        self.backend.test_password(password)
    }
}
