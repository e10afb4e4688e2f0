//! verstash CLI - versioned, deduplicating backups over an archive engine

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use verstash::elevate::{needs_elevation, obtain_credential, ElevationContext};
use verstash::ops::{
    checkout, commit, diff_commits, latest, list, repair, show, status, CheckoutOptions, CommitOptions,
    CommitOutcome, StatusOptions,
};
use verstash::{BackendKind, Config, Error, IoResultExt, Repository, SkippedItem};

#[derive(Parser)]
#[command(name = "verstash")]
#[command(about = "versioned, deduplicating backups over an archive engine")]
#[command(version)]
struct Cli {
    /// repository location (rar archive file or store directory)
    #[arg(short, long)]
    archive: Option<PathBuf>,

    /// archive engine: rar or dir
    #[arg(long)]
    backend: Option<BackendKind>,

    /// repository password
    #[arg(short, long)]
    password: Option<String>,

    /// config file (default: platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// run the archiver at low priority
    #[arg(long)]
    low_priority: bool,

    /// debug logging
    #[arg(short, long)]
    verbose: bool,

    /// warnings only, no progress bars
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// record the current state of a directory
    Commit {
        /// directory to back up
        root: PathBuf,

        /// commit comment
        #[arg(short, long, default_value = "")]
        message: String,

        /// also store in-root symlink targets as files
        #[arg(long)]
        follow_symlinks: bool,
    },

    /// list commits
    List {
        /// only the most recent commit
        #[arg(long)]
        latest: bool,
    },

    /// show the entries of one commit
    Show {
        id: u64,
    },

    /// restore a commit into a directory
    Checkout {
        id: u64,

        /// destination directory
        destination: PathBuf,

        /// create directories instead of symlinks
        #[arg(long)]
        force_dir: bool,

        /// restore ownership through the elevation program
        #[arg(long)]
        elevate: bool,
    },

    /// compare two commits
    Diff {
        id_a: u64,
        id_b: u64,
    },

    /// compare a directory with the latest commit
    Status {
        root: PathBuf,

        /// report permission/owner/group changes
        #[arg(long)]
        include_meta: bool,

        /// flag content changes that kept their mtime
        #[arg(long)]
        checksum: bool,
    },

    /// check and repair the repository
    Repair,
}

/// how a run ended, for the exit code
enum Completion {
    Clean,
    /// finished, but some paths were skipped
    Partial,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(Completion::Clean) => ExitCode::SUCCESS,
        Ok(Completion::Partial) => ExitCode::from(2),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("verstash={}", level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: logging already initialized");
    }
}

fn load_config(cli: &Cli) -> verstash::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)?,
            None => Config::default(),
        },
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if cli.low_priority {
        config.low_priority = true;
    }
    Ok(config)
}

fn run(cli: &Cli) -> verstash::Result<Completion> {
    let config = load_config(cli)?;
    let location = cli
        .archive
        .clone()
        .or_else(|| config.archive.clone())
        .ok_or_else(|| Error::NoRepository(PathBuf::from("<unset: pass --archive>")))?;
    let mut repo = Repository::open(&config, &location, cli.password.clone(), !cli.quiet)?;

    // one credential prompt per run, before any repository work
    let elevation = match &cli.command {
        Commands::Commit { root, .. } | Commands::Status { root, .. } => {
            elevation_for_source(root, &config)
        }
        Commands::Checkout { elevate: true, .. } => elevation_for_restore(&config),
        _ => None,
    };

    match execute(cli, &repo, elevation.as_ref()) {
        Err(Error::Authentication(message)) if cli.password.is_none() => {
            eprintln!("{}", message);
            let password = rpassword::prompt_password("repository password: ").with_path("/dev/tty")?;
            if !repo.test_password(&password)? {
                return Err(Error::Authentication("wrong password".to_string()));
            }
            repo.set_password(Some(password));
            execute(cli, &repo, elevation.as_ref())
        }
        other => other,
    }
}

fn elevation_for_source(root: &Path, config: &Config) -> Option<ElevationContext> {
    if !needs_elevation(root, config.elevation.probe_limit) {
        return None;
    }
    eprintln!("some paths under {} are not readable", root.display());
    elevation_for_restore(config)
}

fn elevation_for_restore(config: &Config) -> Option<ElevationContext> {
    if nix::unistd::geteuid().is_root() {
        return None;
    }
    match obtain_credential(&config.elevation.program, config.elevation.timeout()) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            warn!(error = %e, "continuing without elevation");
            None
        }
    }
}

fn report_skipped(skipped: &[SkippedItem]) -> Completion {
    for item in skipped {
        eprintln!("skipped: {}", item);
    }
    if skipped.is_empty() {
        Completion::Clean
    } else {
        Completion::Partial
    }
}

fn execute(
    cli: &Cli,
    repo: &Repository,
    elevation: Option<&ElevationContext>,
) -> verstash::Result<Completion> {
    match &cli.command {
        Commands::Commit {
            root,
            message,
            follow_symlinks,
        } => {
            let opts = CommitOptions {
                follow_symlinks: *follow_symlinks,
            };
            let outcome = commit(repo, root, message, &opts, elevation)?;
            let summary = outcome.summary();
            match &outcome {
                CommitOutcome::Committed(s) => println!(
                    "committed {}: {} scanned, {} added, {} duplicate, {} skipped, {} dirs, {} symlinks, {} bytes in {:.1?}",
                    s.id.unwrap_or_default(),
                    s.scanned,
                    s.added,
                    s.duplicate,
                    s.skipped.len(),
                    s.directories,
                    s.symlinks,
                    s.total_bytes,
                    s.elapsed
                ),
                CommitOutcome::NoChanges(s) => {
                    println!("no changes since commit {}", s.id.unwrap_or_default())
                }
            }
            Ok(report_skipped(&summary.skipped))
        }

        Commands::List { latest: true } => {
            println!("{}", latest(repo)?);
            Ok(Completion::Clean)
        }

        Commands::List { latest: false } => {
            for info in list(repo)? {
                println!("{}", info);
            }
            Ok(Completion::Clean)
        }

        Commands::Show { id } => {
            let manifest = show(repo, *id)?;
            println!("commit {} at {}", manifest.id, manifest.timestamp);
            if !manifest.comment.is_empty() {
                println!("    {}", manifest.comment);
            }
            println!();
            for entry in manifest.entries() {
                match entry.hash() {
                    Some(hash) => println!("{:<9} {} {}", entry.type_name(), hash, entry.path()),
                    None => println!("{:<9} {:32} {}", entry.type_name(), "", entry.path()),
                }
            }
            Ok(Completion::Clean)
        }

        Commands::Checkout {
            id,
            destination,
            force_dir,
            ..
        } => {
            let opts = CheckoutOptions {
                force_directory: *force_dir,
            };
            let summary = checkout(repo, *id, destination, &opts, elevation)?;
            println!(
                "checked out {} to {}: {} files, {} dirs, {} symlinks ({} as directories) in {:.1?}",
                summary.id,
                destination.display(),
                summary.files,
                summary.directories,
                summary.symlinks,
                summary.fallback_directories,
                summary.elapsed
            );
            Ok(report_skipped(&summary.skipped))
        }

        Commands::Diff { id_a, id_b } => {
            let result = diff_commits(repo, *id_a, *id_b)?;
            for path in &result.added {
                println!("+ {}", path);
            }
            for path in &result.removed {
                println!("- {}", path);
            }
            for path in &result.changed {
                println!("M {}", path);
            }
            Ok(Completion::Clean)
        }

        Commands::Status {
            root,
            include_meta,
            checksum,
        } => {
            let opts = StatusOptions {
                include_meta: *include_meta,
                checksum: *checksum,
            };
            let report = status(repo, root, &opts, elevation)?;
            for path in &report.new {
                println!("? {}", path);
            }
            for path in &report.modified {
                println!("M {}", path);
            }
            for path in &report.deleted {
                println!("D {}", path);
            }
            for path in &report.metadata_changed {
                println!("m {}", path);
            }
            for path in &report.checksum_suspect {
                println!("! {} (content changed, mtime did not)", path);
            }
            if report.is_clean() {
                println!("clean against commit {}", report.id);
            }
            Ok(report_skipped(&report.skipped))
        }

        Commands::Repair => {
            repair(repo)?;
            println!("repository ok");
            Ok(Completion::Clean)
        }
    }
}
