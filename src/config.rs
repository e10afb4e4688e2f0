use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};

/// which archive engine holds the repository
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// the external rar archiver, one archive file
    #[default]
    Rar,
    /// a plain directory store
    Dir,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "rar" => Ok(BackendKind::Rar),
            "dir" => Ok(BackendKind::Dir),
            other => Err(format!("unknown backend '{}' (expected rar or dir)", other)),
        }
    }
}

/// elevation program settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationConfig {
    pub program: String,
    /// wall-clock limit per elevated command
    pub timeout_secs: u64,
    /// entries visited when probing a root for unreadable items
    pub probe_limit: usize,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            program: "sudo".to_string(),
            timeout_secs: 300,
            probe_limit: 10_000,
        }
    }
}

impl ElevationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// user configuration stored in config.toml
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    /// default repository location when none is given on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    /// archiver executable for the rar backend
    pub archiver: String,
    /// recovery record size in percent of the archive
    pub redundancy_percent: u8,
    pub low_priority: bool,
    pub elevation: ElevationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Rar,
            archive: None,
            archiver: "rar".to_string(),
            redundancy_percent: 3,
            low_priority: false,
            elevation: ElevationConfig::default(),
        }
    }
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// load config from file, or defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// `<config dir>/verstash/config.toml` for this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "verstash")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
