//! Command-line surface for revisio.
//!
//! An application links this crate with its own registry and exposes it as a
//! binary:
//!
//! ```no_run
//! use revisio::{Revision, RevisionRegistry};
//!
//! fn registry() -> RevisionRegistry {
//!     RevisionRegistry::new(vec![Revision::root("0.1.0")])
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     revisio_cli::main_with(registry())
//! }
//! ```
//!
//! Every command except `list` operates on a profile from the config file,
//! chosen with `--profile` or `REVISIO_PROFILE`.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use revisio::{
    AssumeYes, Confirm, Direction, MigrationReport, RevisionRegistry, Runner, HEAD,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod config;

use config::ConfigFile;

#[derive(Parser, Debug)]
#[command(name = "revisio")]
#[command(version, about = "Move a database along its revision chain")]
pub struct CliArgs {
    /// Profile to operate on, as named in the config file
    #[arg(short, long, env = "REVISIO_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (default: ./revisio.toml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Answer yes to every destructive-step confirmation
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Show the revision the database is at
    Current,
    /// List revisions, newest first, optionally within a `from:to` range
    History {
        #[arg(short, long)]
        range: Option<String>,
    },
    /// Apply revisions up to REVISION
    Upgrade {
        #[arg(default_value = HEAD)]
        revision: String,
    },
    /// Undo revisions down to REVISION
    Downgrade { revision: String },
    /// Show the steps a migration to REVISION would run
    Preview {
        #[arg(default_value = HEAD)]
        revision: String,
    },
    /// List every defined revision (no database required)
    List,
    /// Record REVISION as current without running anything
    Stamp { revision: String },
}

/// Prompts on stderr and reads the answer from stdin. Anything but `y` or
/// `yes` declines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool, revisio::Error> {
        let mut stderr = io::stderr().lock();
        write!(stderr, "{} [y/N] ", prompt)?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

/// Install a stderr subscriber whose level follows `-v`. `RUST_LOG` wins when
/// set.
pub fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .try_init();
}

/// Process exit code for a failed command.
pub fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<revisio::Error>() {
        Some(revisio::Error::UserAborted { .. }) => 2,
        Some(revisio::Error::IrreversibleRevision(_)) => 3,
        Some(revisio::Error::MigrationStepFailed { .. })
        | Some(revisio::Error::MarkerNotRecorded { .. }) => 4,
        _ => 1,
    }
}

/// Parse the process arguments, run the command, and map the outcome to an
/// exit code.
pub fn main_with(registry: RevisionRegistry) -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(args.verbose);
    match run(registry, args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {:#}", error);
            if let Some(revisio_error) = error.downcast_ref::<revisio::Error>() {
                for path in revisio_error.export_paths() {
                    eprintln!("Exported rows kept at {}", path.display());
                }
            }
            ExitCode::from(exit_code(&error))
        }
    }
}

/// Run `args` against the terminal.
pub fn run(registry: RevisionRegistry, args: CliArgs) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.yes {
        run_with(registry, &args, &mut out, AssumeYes)
    } else {
        run_with(registry, &args, &mut out, TerminalConfirm)
    }
}

/// Run `args`, writing output to `out` and asking `confirm` before
/// destructive steps of an interactive profile.
pub fn run_with(
    registry: RevisionRegistry,
    args: &CliArgs,
    out: &mut dyn Write,
    confirm: impl Confirm + 'static,
) -> Result<()> {
    if args.command == Commands::List {
        return list(&registry, out);
    }

    let Some(profile) = args.profile.as_deref() else {
        bail!("no profile given; pass --profile or set REVISIO_PROFILE");
    };
    let config = ConfigFile::discover(args.config.as_deref())?;
    let database = config.database_path(config.profile(profile)?);
    let runner_config = config.runner_config(profile)?;

    tracing::debug!(profile, database = %database.display(), "Opening store");
    // only an upgrade may bring a new database into existence
    let mut store = if matches!(args.command, Commands::Upgrade { .. }) {
        runner_config.open_sqlite(&database)?
    } else {
        runner_config.open_existing_sqlite(&database)?
    };
    let runner = Runner::new(registry, runner_config).with_confirm(confirm);

    match &args.command {
        Commands::Current => {
            let current = runner.current(&mut store)?;
            let marker = if current == runner.registry().head().id() {
                " (head)"
            } else {
                ""
            };
            writeln!(out, "{}: {}{}", profile, current, marker)?;
        }
        Commands::History { range } => {
            let current = runner.current(&mut store)?;
            for revision in runner.history(range.as_deref())? {
                write!(
                    out,
                    "{} -> {}",
                    revision.parent().unwrap_or("<root>"),
                    revision.id()
                )?;
                if let Some(description) = revision.summary() {
                    write!(out, ", {}", description)?;
                }
                if !revision.is_reversible() {
                    write!(out, " [irreversible]")?;
                }
                if revision.id() == current {
                    write!(out, " (current)")?;
                }
                writeln!(out)?;
            }
        }
        Commands::Upgrade { revision } => {
            let report = runner.upgrade(&mut store, revision)?;
            print_report(profile, &report, out)?;
        }
        Commands::Downgrade { revision } => {
            let report = runner.downgrade(&mut store, revision)?;
            print_report(profile, &report, out)?;
        }
        Commands::Preview { revision } => {
            let planned = runner.preview(&mut store, revision)?;
            if planned.is_empty() {
                writeln!(out, "{}: nothing to do", profile)?;
            }
            for step in planned {
                write!(
                    out,
                    "{} {} (marker -> {})",
                    verb(step.direction),
                    step.revision,
                    step.target
                )?;
                if step.destructive > 0 {
                    write!(
                        out,
                        ", {} destructive operation(s), rows will be exported first",
                        step.destructive
                    )?;
                }
                writeln!(out)?;
            }
        }
        Commands::Stamp { revision } => {
            let previous = runner.stamp(&mut store, revision)?;
            let now = runner.current(&mut store)?;
            writeln!(out, "{}: stamped {} (was {})", profile, now, previous)?;
        }
        Commands::List => list(runner.registry(), out)?,
    }
    Ok(())
}

fn verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Forward => "upgrade",
        Direction::Backward => "downgrade",
    }
}

fn list(registry: &RevisionRegistry, out: &mut dyn Write) -> Result<()> {
    let revisions = registry.revisions();
    writeln!(out, "Defined revisions ({}):", revisions.len())?;
    for revision in revisions {
        writeln!(out, "  {}", revision.id())?;
        if let Some(description) = revision.summary() {
            writeln!(out, "      {}", description)?;
        }
    }
    Ok(())
}

fn print_report(profile: &str, report: &MigrationReport, out: &mut dyn Write) -> Result<()> {
    if report.is_noop() {
        writeln!(out, "{}: already at {}", profile, report.to)?;
        return Ok(());
    }
    writeln!(out, "{}: {} -> {}", profile, report.from, report.to)?;
    for step in &report.steps {
        writeln!(
            out,
            "  {} {} ({} ms)",
            verb(step.direction),
            step.revision,
            step.duration.as_millis()
        )?;
    }
    for export in &report.exports {
        if export.retained {
            writeln!(
                out,
                "  exported {} row(s) of {} to {}",
                export.rows,
                export.predicate,
                export.location.display()
            )?;
        } else {
            writeln!(
                out,
                "  exported {} row(s) of {} (discarded)",
                export.rows, export.predicate
            )?;
        }
    }
    Ok(())
}
