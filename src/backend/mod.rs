//! archive engines the repository persists into
//!
//! a backend stores named entries (`files/<hash>`, `versions/<name>.manifest`,
//! `versions/<name>.comment`) and knows nothing about what they mean.

mod dir;
mod rar;

use std::path::Path;

pub use dir::DirBackend;
pub use rar::RarBackend;

use crate::error::{Error, Result};

/// black-box storage engine
pub trait ArchiveBackend {
    /// entry names matching a glob `pattern`; an absent store lists nothing
    fn list(&self, pattern: &str, password: Option<&str>) -> Result<Vec<String>>;

    /// add the trees `names` (relative to `base`) in one call
    fn add(
        &self,
        base: &Path,
        names: &[String],
        redundancy_percent: u8,
        password: Option<&str>,
    ) -> Result<()>;

    /// extract `names` under `dest`, keeping their relative paths;
    /// names the store does not hold are left out
    fn extract(&self, names: &[String], dest: &Path, password: Option<&str>) -> Result<()>;

    fn repair(&self, password: Option<&str>) -> Result<()>;

    /// whether `password` opens the store
    fn test_password(&self, password: &str) -> Result<bool>;

    /// human readable location for logs
    fn describe(&self) -> String;
}

/// what a successful backend status means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// nothing matched the requested names
    NoMatch,
}

/// status codes the archive engine reserves for password problems
pub const AUTH_STATUS_CODES: [i32; 2] = [11, 255];

/// map an archive engine exit code onto the error taxonomy
///
/// 0 and 1 (warnings) succeed, 10 means no matching entries, 3 reports a
/// damaged archive and the reserved codes mean a missing or wrong password.
pub fn map_status(operation: &'static str, code: i32, message: &str) -> Result<Status> {
    match code {
        0 | 1 => Ok(Status::Ok),
        10 => Ok(Status::NoMatch),
        3 => Err(Error::Corruption(format!("{}: {}", operation, message))),
        c if AUTH_STATUS_CODES.contains(&c) => Err(Error::Authentication(format!(
            "{} refused (status {})",
            operation, c
        ))),
        c => Err(Error::Backend {
            operation,
            code: c,
            message: message.to_string(),
        }),
    }
}

/// glob match where `*` stays inside one path component
pub(crate) fn entry_matches(pattern: &glob::Pattern, name: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    pattern.matches_with(name, options)
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| Error::Backend {
        operation: "list",
        code: -1,
        message: format!("bad pattern {}: {}", pattern, e),
    })
}
