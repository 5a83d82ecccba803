//! jqs v0.1 — entry point.
//!
//! All user-facing output is plain text on stdout. Tracing logs go to
//! stderr only, at a verbosity controlled by repeated `-v`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jqs::error::JqsError;
use jqs::launcher;
use jqs::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "jqs")]
#[command(about = "Single-user, single-host batch job queue", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Override the jobs root directory (defaults to $JQS_ROOT or $HOME/jqs).
    #[arg(long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a script's `#JS` directives, assign a jobid, and enqueue it.
    Submit {
        /// Path to the job script.
        script: String,
    },

    /// List all jobs in all three directories.
    Q,

    /// Print the full decoded record for one job.
    Info {
        /// Job id.
        jobid: u64,
    },

    /// Request cancellation of a job.
    Cancel {
        /// Job id.
        jobid: u64,
    },

    /// Print free/total cores and memory.
    Nodes,

    /// Run the scheduler tick loop in the foreground. Does not return.
    Scheduler,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        let code = match e.downcast_ref::<JqsError>() {
            Some(jqs_err) => jqs_err.exit_code(),
            None => 3,
        };
        eprintln!("error: {e:#}");
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.root.as_deref();

    match cli.command {
        Command::Submit { script } => {
            jqs::cli::submit::execute(jqs::cli::submit::SubmitOpts { script: &script, root })?;
        }
        Command::Q => {
            jqs::cli::list::execute(jqs::cli::list::ListOpts { root })?;
        }
        Command::Info { jobid } => {
            jqs::cli::info::execute(jqs::cli::info::InfoOpts { jobid, root })?;
        }
        Command::Cancel { jobid } => {
            jqs::cli::cancel::execute(jqs::cli::cancel::CancelOpts { jobid, root })?;
        }
        Command::Nodes => {
            jqs::cli::nodes::execute(jqs::cli::nodes::NodesOpts { root })?;
        }
        Command::Scheduler => {
            let paths = jqs::paths::Paths::new(jqs::paths::resolve_root(root));
            paths.ensure_layout().map_err(|e| JqsError::FatalInit {
                message: format!("cannot initialize root directory: {e:#}"),
            })?;
            // Fail fast on a corrupt limits.json rather than looping forever
            // inside the tick (spec §7: "terminates only on... (a) unreadable
            // limits.json at startup"). A missing file was already seeded
            // with a default by ensure_layout above, so this only catches an
            // existing file that fails to parse.
            jqs::accountant::load_limits(&paths).map_err(|e| JqsError::FatalInit {
                message: format!("cannot read limits.json: {e:#}"),
            })?;
            let launcher = launcher::resolve();
            let mut scheduler = Scheduler::new(paths, launcher);
            scheduler.run_forever()?;
        }
    }
    Ok(())
}
