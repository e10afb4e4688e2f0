use std::path::PathBuf;

/// error type for verstash operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("password required or incorrect: {0}")]
    Authentication(String),

    #[error("repository not found at {0}")]
    NoRepository(PathBuf),

    #[error("commit not found: {0}")]
    CommitNotFound(u64),

    #[error("no commits in repository")]
    NoCommits,

    #[error("permission denied at {path}: {reason}")]
    Permission { path: PathBuf, reason: String },

    #[error("repository damaged: {0} (run `verstash repair`)")]
    Corruption(String),

    #[error("backend {operation} failed with status {code}: {message}")]
    Backend {
        operation: &'static str,
        code: i32,
        message: String,
    },

    #[error("invalid manifest line {line}: {message}")]
    InvalidManifestLine { line: usize, message: String },

    #[error("duplicate manifest path: {0}")]
    DuplicatePath(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("invalid version name: {0}")]
    InvalidVersionName(String),

    #[error("elevated command `{command}` failed: {message}")]
    ElevationFailed { command: String, message: String },

    #[error("elevated command `{command}` timed out after {secs}s")]
    ElevationTimeout { command: String, secs: u64 },

    #[error("scan cannot restart after an elevated fallback listing")]
    ScanNotRestartable,

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// true for failures a retry with elevated privileges could fix
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Permission { .. } => true,
            Error::Io { source, .. } => source.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
///
/// permission denials become `Error::Permission`, everything else `Error::Io`.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| {
            let path = path.into();
            if source.kind() == std::io::ErrorKind::PermissionDenied {
                Error::Permission {
                    path,
                    reason: source.to_string(),
                }
            } else {
                Error::Io { path, source }
            }
        })
    }
}
