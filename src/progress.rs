//! subprocess output pumping and completion estimates
//!
//! long-running backend commands are watched through a poll loop over the
//! child's stdout and stderr. lines are delivered in the order each stream
//! produced them. the percentage shown is an estimate only; success or
//! failure always comes from the exit status.

use std::io::Read;
use std::os::fd::AsFd;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// milliseconds each poll waits before checking the deadline again
const POLL_INTERVAL_MS: u16 = 100;

/// which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// the child ran past its deadline and was killed
#[derive(Debug)]
pub struct TimedOut;

struct Pipe<R> {
    reader: R,
    buf: Vec<u8>,
    open: bool,
}

impl<R: Read> Pipe<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            open: true,
        }
    }

    /// read what is available and hand out complete lines
    fn fill(&mut self, stream: Stream, on_line: &mut dyn FnMut(Stream, &str)) -> std::io::Result<()> {
        let mut chunk = [0u8; 8192];
        let n = match self.reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };
        if n == 0 {
            self.open = false;
            self.flush(stream, on_line);
            return Ok(());
        }
        self.buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            if !text.trim().is_empty() {
                on_line(stream, &*text);
            }
        }
        Ok(())
    }

    fn flush(&mut self, stream: Stream, on_line: &mut dyn FnMut(Stream, &str)) {
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            if !text.trim().is_empty() {
                on_line(stream, text.as_str());
            }
        }
    }
}

/// drive a spawned child to completion, delivering its output line by line
///
/// pipes that were not captured are ignored. with a timeout the child is
/// killed once the deadline passes and `Ok(Err(TimedOut))` is returned.
pub fn pump(
    child: &mut Child,
    timeout: Option<Duration>,
    mut on_line: impl FnMut(Stream, &str),
) -> Result<std::result::Result<ExitStatus, TimedOut>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut out: Option<Pipe<ChildStdout>> = child.stdout.take().map(Pipe::new);
    let mut err: Option<Pipe<ChildStderr>> = child.stderr.take().map(Pipe::new);

    loop {
        let out_open = out.as_ref().is_some_and(|p| p.open);
        let err_open = err.as_ref().is_some_and(|p| p.open);
        if !out_open && !err_open {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return kill_after_timeout(child);
        }

        let (out_ready, err_ready) = {
            let mut fds = Vec::with_capacity(2);
            if let Some(p) = out.as_ref().filter(|p| p.open) {
                fds.push(PollFd::new(p.reader.as_fd(), PollFlags::POLLIN));
            }
            if let Some(p) = err.as_ref().filter(|p| p.open) {
                fds.push(PollFd::new(p.reader.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    return Err(Error::Io {
                        path: "<child pipes>".into(),
                        source: std::io::Error::from(e),
                    })
                }
            }
            let ready: Vec<bool> = fds
                .iter()
                .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
                .collect();
            let out_ready = out_open && ready[0];
            let err_ready = err_open && ready[if out_open { 1 } else { 0 }];
            (out_ready, err_ready)
        };

        if out_ready {
            if let Some(p) = out.as_mut() {
                p.fill(Stream::Stdout, &mut on_line).with_path("<child stdout>")?;
            }
        }
        if err_ready {
            if let Some(p) = err.as_mut() {
                p.fill(Stream::Stderr, &mut on_line).with_path("<child stderr>")?;
            }
        }
    }

    // pipes are closed; reap the child, still honoring the deadline
    loop {
        if let Some(status) = child.try_wait().with_path("<child>")? {
            return Ok(Ok(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return kill_after_timeout(child);
        }
        std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
    }
}

fn kill_after_timeout(child: &mut Child) -> Result<std::result::Result<ExitStatus, TimedOut>> {
    debug!(pid = child.id(), "killing child after timeout");
    let _ = child.kill();
    let _ = child.wait();
    Ok(Err(TimedOut))
}

/// how a backend output line counts toward progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// one unit of work finished
    Success,
    Error,
    Other,
}

/// recognize per-item success markers ("... OK") and error lines
pub fn classify_line(line: &str) -> LineClass {
    let trimmed = line.trim_end();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("error") || lower.contains("cannot ") || lower.contains("failed") {
        LineClass::Error
    } else if lower == "all ok" || lower == "done" {
        LineClass::Other
    } else if trimmed.ends_with(" OK") || trimmed == "OK" {
        LineClass::Success
    } else {
        LineClass::Other
    }
}

/// completion estimate while running: never reports 100 before exit
pub fn estimate_percent(done: u64, expected: u64) -> u64 {
    if expected == 0 {
        return 0;
    }
    (done.saturating_mul(100) / expected).min(99)
}

/// what a monitored run produced
#[derive(Debug)]
pub struct MonitorReport {
    pub status: ExitStatus,
    pub completed: u64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl MonitorReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// last few stderr lines (or stdout error lines), for error messages
    pub fn error_summary(&self) -> String {
        let lines: Vec<&str> = if self.stderr.is_empty() {
            self.stdout
                .iter()
                .filter(|l| classify_line(l) == LineClass::Error)
                .map(String::as_str)
                .collect()
        } else {
            self.stderr.iter().map(String::as_str).collect()
        };
        let start = lines.len().saturating_sub(5);
        lines[start..].join("; ")
    }
}

/// watches one backend subprocess and renders an estimated percentage
pub struct ProgressMonitor {
    bar: ProgressBar,
    expected: u64,
}

impl ProgressMonitor {
    /// `expected` is the number of success markers a complete run prints
    pub fn new(label: &str, expected: u64, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg:>10} [{bar:40.cyan/blue}] {pos:>3}% {elapsed_precise}")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(label.to_string());
        Self { bar, expected }
    }

    /// spawn `cmd` with captured output and follow it to exit
    pub fn run(self, cmd: &mut Command) -> Result<MonitorReport> {
        let program = format!("{:?}", cmd.get_program());
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_path(&program)?;

        let mut completed = 0u64;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let bar = &self.bar;
        let expected = self.expected;

        let outcome = pump(&mut child, None, |stream, line| {
            match stream {
                Stream::Stdout => {
                    if classify_line(line) == LineClass::Success {
                        completed += 1;
                        bar.set_position(estimate_percent(completed, expected));
                    }
                    stdout.push(line.to_string());
                }
                Stream::Stderr => stderr.push(line.to_string()),
            }
        })?;

        // no deadline was given, so the child always ran to exit
        let status = match outcome {
            Ok(status) => status,
            Err(TimedOut) => child.wait().with_path(&program)?,
        };

        self.bar.set_position(100);
        if status.success() {
            self.bar.finish_with_message("done");
        } else {
            self.bar.abandon_with_message("failed");
        }

        Ok(MonitorReport {
            status,
            completed,
            stdout,
            stderr,
        })
    }
}
