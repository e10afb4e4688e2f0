use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::{compile_pattern, entry_matches, map_status, ArchiveBackend, Status};
use crate::error::{Error, IoResultExt, Result};
use crate::progress::{MonitorReport, ProgressMonitor};

/// the external `rar` archiver over one archive file
///
/// the archiver provides compression, AES-256 encryption of data and headers,
/// recovery records and repair. passwords go on its command line only.
#[derive(Debug, Clone)]
pub struct RarBackend {
    program: String,
    archive: PathBuf,
    low_priority: bool,
    show_progress: bool,
}

impl RarBackend {
    /// `archive` is made absolute so `add` can run inside the staging dir
    pub fn new(program: impl Into<String>, archive: &Path) -> Result<Self> {
        let archive = if archive.is_absolute() {
            archive.to_path_buf()
        } else {
            std::env::current_dir().with_path(archive)?.join(archive)
        };
        Ok(Self {
            program: program.into(),
            archive,
            low_priority: false,
            show_progress: false,
        })
    }

    /// run the archiver at the lowest scheduling priority
    pub fn low_priority(mut self, enabled: bool) -> Self {
        self.low_priority = enabled;
        self
    }

    /// draw a progress bar for add and extract
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    fn command(&self, verb: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(verb);
        if self.low_priority {
            cmd.arg("-ri1");
        }
        cmd
    }

    /// `-p<pw>` to decrypt, `-p-` to never prompt
    fn password_switch(password: Option<&str>) -> String {
        match password {
            Some(pw) => format!("-p{}", pw),
            None => "-p-".to_string(),
        }
    }

    /// run without a progress bar and capture everything
    fn run_quiet(&self, operation: &'static str, cmd: &mut Command) -> Result<(Status, Vec<String>)> {
        debug!(archive = %self.archive.display(), operation, "running archiver");
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_path(&self.program)?;
        let stdout: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(-1);
        let status = map_status(operation, code, &stderr)?;
        Ok((status, stdout))
    }

    fn check_report(operation: &'static str, report: &MonitorReport) -> Result<Status> {
        let code = report.status.code().unwrap_or(-1);
        map_status(operation, code, &report.error_summary())
    }
}

impl ArchiveBackend for RarBackend {
    fn list(&self, pattern: &str, password: Option<&str>) -> Result<Vec<String>> {
        if !self.archive.exists() {
            return Ok(Vec::new());
        }
        let mut cmd = self.command("lb");
        cmd.arg(Self::password_switch(password))
            .arg(&self.archive)
            .arg(pattern);
        let (status, lines) = self.run_quiet("list", &mut cmd)?;
        if status == Status::NoMatch {
            return Ok(Vec::new());
        }

        let pattern = compile_pattern(pattern)?;
        let mut names: Vec<String> = lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| entry_matches(&pattern, l))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn add(
        &self,
        base: &Path,
        names: &[String],
        redundancy_percent: u8,
        password: Option<&str>,
    ) -> Result<()> {
        let expected = names
            .iter()
            .flat_map(|n| WalkDir::new(base.join(n)))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64;
        info!(archive = %self.archive.display(), files = expected, "adding to archive");

        let mut cmd = self.command("a");
        cmd.current_dir(base)
            .arg("-r")
            .arg("-y")
            .arg(format!("-rr{}%", redundancy_percent));
        match password {
            Some(pw) => cmd.arg(format!("-hp{}", pw)),
            None => cmd.arg("-p-"),
        };
        cmd.arg(&self.archive).args(names);

        let report = ProgressMonitor::new("adding", expected, self.show_progress).run(&mut cmd)?;
        match Self::check_report("add", &report)? {
            Status::Ok => Ok(()),
            Status::NoMatch => Err(Error::Backend {
                operation: "add",
                code: 10,
                message: "nothing to add".to_string(),
            }),
        }
    }

    fn extract(&self, names: &[String], dest: &Path, password: Option<&str>) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if !self.archive.exists() {
            return Err(Error::NoRepository(self.archive.clone()));
        }

        let mut list = tempfile::NamedTempFile::new().with_path(std::env::temp_dir())?;
        for name in names {
            writeln!(list, "{}", name).with_path(list.path())?;
        }
        list.flush().with_path(list.path())?;

        let mut dest_arg = dest.as_os_str().to_os_string();
        dest_arg.push("/");

        let mut cmd = self.command("x");
        cmd.arg("-o+")
            .arg("-y")
            .arg(Self::password_switch(password))
            .arg(&self.archive)
            .arg(format!("@{}", list.path().display()))
            .arg(dest_arg);

        let report = ProgressMonitor::new("extracting", names.len() as u64, self.show_progress)
            .run(&mut cmd)?;
        Self::check_report("extract", &report).map(|_| ())
    }

    fn repair(&self, password: Option<&str>) -> Result<()> {
        if !self.archive.exists() {
            return Err(Error::NoRepository(self.archive.clone()));
        }
        let mut cmd = self.command("r");
        cmd.arg("-y")
            .arg(Self::password_switch(password))
            .arg(&self.archive);
        if let Some(dir) = self.archive.parent() {
            cmd.current_dir(dir);
        }
        let report = ProgressMonitor::new("repairing", 0, self.show_progress).run(&mut cmd)?;
        Self::check_report("repair", &report).map(|_| ())
    }

    fn test_password(&self, password: &str) -> Result<bool> {
        if !self.archive.exists() {
            return Ok(true);
        }
        let mut cmd = self.command("t");
        cmd.arg(Self::password_switch(Some(password)))
            .arg(&self.archive);
        match self.run_quiet("test", &mut cmd) {
            Ok(_) => Ok(true),
            Err(Error::Authentication(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        format!("rar:{}", self.archive.display())
    }
}
