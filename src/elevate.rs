//! privilege elevation for unreadable sources and ownership restoration
//!
//! the credential lives only inside an `ElevationContext` for the length of
//! one run. it is fed to the elevation program on stdin and never written
//! to disk, the environment or the log.

use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Hash;
use crate::progress::{pump, Stream};
use crate::types::{EntryType, Metadata};

/// find(1) format: type, mode, owner, group, mtime, atime, ctime, size, path
const FIND_FORMAT: &str = "%y\t%m\t%u\t%g\t%T@\t%A@\t%C@\t%s\t%p\n";

/// held credential for elevated sub-operations
pub struct ElevationContext {
    program: String,
    credential: String,
    timeout: Duration,
}

impl fmt::Debug for ElevationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevationContext")
            .field("program", &self.program)
            .field("credential", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// one entry from an elevated subtree listing
#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub path: PathBuf,
    /// None for fifos, sockets and devices
    pub kind: Option<EntryType>,
    pub metadata: Metadata,
}

/// an attempt that failed both plainly and (if possible) elevated
#[derive(Debug)]
pub struct FailedAttempt {
    pub error: Error,
    pub elevated: bool,
}

impl FailedAttempt {
    /// skip reason: `elevated_reason` when elevation was tried, else `plain_reason`
    pub fn reason(&self, elevated_reason: &'static str, plain_reason: &'static str) -> &'static str {
        if self.elevated {
            elevated_reason
        } else {
            plain_reason
        }
    }
}

/// run `plain`; on a permission failure retry once through `elevated`
pub fn attempt<T>(
    elevation: Option<&ElevationContext>,
    plain: impl FnOnce() -> Result<T>,
    elevated: impl FnOnce(&ElevationContext) -> Result<T>,
) -> std::result::Result<T, FailedAttempt> {
    match plain() {
        Ok(v) => Ok(v),
        Err(e) if e.is_permission_denied() => match elevation {
            Some(ctx) => {
                debug!(error = %e, "retrying with elevation");
                elevated(ctx).map_err(|error| FailedAttempt {
                    error,
                    elevated: true,
                })
            }
            None => Err(FailedAttempt {
                error: e,
                elevated: false,
            }),
        },
        Err(e) => Err(FailedAttempt {
            error: e,
            elevated: false,
        }),
    }
}

impl ElevationContext {
    pub fn new(program: impl Into<String>, credential: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            credential: credential.into(),
            timeout,
        }
    }

    /// check the credential by running a no-op
    pub fn verify(&self) -> Result<()> {
        self.run("true", &[], None).map(|_| ())
    }

    /// list a whole subtree (excluding `dir` itself), sorted by path
    pub fn list_subtree(&self, dir: &Path) -> Result<Vec<ListedEntry>> {
        let lines = self.run(
            "find",
            &[
                dir.as_os_str(),
                OsStr::new("-mindepth"),
                OsStr::new("1"),
                OsStr::new("-printf"),
                OsStr::new(FIND_FORMAT),
            ],
            None,
        )?;
        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            match parse_find_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!(line = %line, "unparseable elevated listing line"),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// metadata of a single path we cannot stat ourselves
    pub fn stat(&self, path: &Path) -> Result<Metadata> {
        self.stat_entry(path).map(|entry| entry.metadata)
    }

    /// type and metadata of a single path, for children of unsearchable directories
    pub fn stat_entry(&self, path: &Path) -> Result<ListedEntry> {
        let lines = self.run(
            "find",
            &[
                path.as_os_str(),
                OsStr::new("-maxdepth"),
                OsStr::new("0"),
                OsStr::new("-printf"),
                OsStr::new(FIND_FORMAT),
            ],
            None,
        )?;
        lines
            .first()
            .and_then(|l| parse_find_line(l))
            .ok_or_else(|| Error::ElevationFailed {
                command: "find".to_string(),
                message: "no output".to_string(),
            })
    }

    /// target of a symlink inside a directory we cannot search
    pub fn read_link(&self, path: &Path) -> Result<String> {
        let lines = self.run("readlink", &[OsStr::new("--"), path.as_os_str()], None)?;
        lines.into_iter().next().ok_or_else(|| Error::ElevationFailed {
            command: "readlink".to_string(),
            message: "no output".to_string(),
        })
    }

    /// md5 of a file we cannot read ourselves
    pub fn hash_file(&self, path: &Path) -> Result<Hash> {
        let lines = self.run("md5sum", &[OsStr::new("--"), path.as_os_str()], None)?;
        let hex = lines
            .first()
            .and_then(|l| l.split_whitespace().next())
            .ok_or_else(|| Error::ElevationFailed {
                command: "md5sum".to_string(),
                message: "no output".to_string(),
            })?;
        // md5sum escapes odd file names with a leading backslash
        Hash::from_hex(hex.trim_start_matches('\\'))
    }

    /// copy an unreadable file's content into `dest` (owned by us)
    pub fn copy_file(&self, src: &Path, dest: &Path) -> Result<()> {
        let out = File::create(dest).with_path(dest)?;
        self.run("cat", &[OsStr::new("--"), src.as_os_str()], Some(out))
            .map(|_| ())
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let mode = format!("{:o}", mode & 0o7777);
        self.run("chmod", &[OsStr::new(&mode), OsStr::new("--"), path.as_os_str()], None)
            .map(|_| ())
    }

    /// chown and chgrp in one call
    pub fn chown(&self, path: &Path, owner: &str, group: &str) -> Result<()> {
        let owner_group = format!("{}:{}", owner, group);
        self.run("chown", &[OsStr::new(&owner_group), OsStr::new("--"), path.as_os_str()], None)
            .map(|_| ())
    }

    /// ownership of a symlink itself
    pub fn lchown(&self, path: &Path, owner: &str, group: &str) -> Result<()> {
        let owner_group = format!("{}:{}", owner, group);
        self.run(
            "chown",
            &[OsStr::new("-h"), OsStr::new(&owner_group), OsStr::new("--"), path.as_os_str()],
            None,
        )
        .map(|_| ())
    }

    /// set mtime, then atime
    pub fn touch(&self, path: &Path, atime: i64, mtime: i64) -> Result<()> {
        let m = format!("@{}", mtime);
        let a = format!("@{}", atime);
        self.run(
            "touch",
            &[OsStr::new("-m"), OsStr::new("-d"), OsStr::new(&m), OsStr::new("--"), path.as_os_str()],
            None,
        )?;
        self.run(
            "touch",
            &[OsStr::new("-a"), OsStr::new("-d"), OsStr::new(&a), OsStr::new("--"), path.as_os_str()],
            None,
        )
        .map(|_| ())
    }

    /// run one command elevated; stdout lines are returned unless redirected
    fn run(&self, cmd: &str, args: &[&OsStr], stdout: Option<File>) -> Result<Vec<String>> {
        debug!(program = %self.program, command = cmd, "elevated command");
        let mut command = Command::new(&self.program);
        command
            .args(["-S", "-p", "", "--", cmd])
            .args(args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped());
        match stdout {
            Some(file) => command.stdout(Stdio::from(file)),
            None => command.stdout(Stdio::piped()),
        };

        let mut child = command.spawn().with_path(&self.program)?;
        if let Some(mut stdin) = child.stdin.take() {
            // a closed stdin only means the program did not ask
            let _ = writeln!(stdin, "{}", self.credential);
        }

        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = pump(&mut child, Some(self.timeout), |stream, line| match stream {
            Stream::Stdout => out.push(line.to_string()),
            Stream::Stderr => err.push(line.to_string()),
        })?;

        match outcome {
            Ok(status) if status.success() => Ok(out),
            Ok(status) => Err(Error::ElevationFailed {
                command: cmd.to_string(),
                message: if err.is_empty() {
                    format!("exit status {}", status)
                } else {
                    err.join("; ")
                },
            }),
            Err(_) => Err(Error::ElevationTimeout {
                command: cmd.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn parse_find_line(line: &str) -> Option<ListedEntry> {
    let fields: Vec<&str> = line.splitn(9, '\t').collect();
    if fields.len() != 9 {
        return None;
    }
    let kind = match fields[0] {
        "f" => Some(EntryType::File),
        "d" => Some(EntryType::Directory),
        "l" => Some(EntryType::Symlink),
        _ => None,
    };
    let secs = |s: &str| s.split('.').next().and_then(|w| w.parse::<i64>().ok());
    Some(ListedEntry {
        path: PathBuf::from(fields[8]),
        kind,
        metadata: Metadata {
            mode: u32::from_str_radix(fields[1], 8).ok()?,
            owner: fields[2].to_string(),
            group: fields[3].to_string(),
            mtime: secs(fields[4])?,
            atime: secs(fields[5])?,
            ctime: secs(fields[6])?,
            size: fields[7].parse().ok()?,
        },
    })
}

/// true when `root` (or anything a bounded walk under it reaches) is unreadable
pub fn needs_elevation(root: &Path, probe_limit: usize) -> bool {
    if nix::unistd::geteuid().is_root() {
        return false;
    }
    if std::fs::read_dir(root).is_err() {
        return true;
    }
    for entry in WalkDir::new(root).follow_links(false).into_iter().take(probe_limit) {
        match entry {
            Err(e) => {
                if e.io_error()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::PermissionDenied)
                {
                    return true;
                }
            }
            Ok(entry) if entry.file_type().is_file() => {
                if let Err(e) = File::open(entry.path()) {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        return true;
                    }
                }
            }
            Ok(_) => {}
        }
    }
    false
}

/// prompt for the credential once and check it
pub fn obtain_credential(program: &str, timeout: Duration) -> Result<ElevationContext> {
    let prompt = format!("[{}] password for elevated access: ", program);
    let credential = rpassword::prompt_password(prompt).with_path("/dev/tty")?;
    let ctx = ElevationContext::new(program, credential, timeout);
    ctx.verify()?;
    Ok(ctx)
}
