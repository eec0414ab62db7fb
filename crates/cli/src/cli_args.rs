use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line arguments for bgrun
#[derive(Parser, Debug)]
#[clap(
    name = "bgrun",
    about = "Run long generative tasks in the background and follow them by polling"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to <config dir>/bgrun/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Slot to operate on; overrides runtime.slot
    #[arg(long, global = true)]
    pub slot: Option<String>,

    /// Print views and records as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a task and follow it until it finishes. Ctrl-C requests cancellation.
    Run {
        task: String,
        #[arg(long)]
        max_turns: Option<u32>,
        /// Stop after this many events
        #[arg(long)]
        max_events: Option<usize>,
    },
    /// Follow a job started by another process
    Watch {
        /// Job id; defaults to the slot's current job
        #[arg(long)]
        job: Option<String>,
    },
    /// Show the slot's current job once
    Status,
    /// Ask the slot's running job to stop
    Cancel,
    /// Clear a slot left running by a worker that died
    Reset {
        /// Required; the slot must also be stale
        #[arg(long)]
        force: bool,
    },
    /// Browse finished runs
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List archived runs, newest first
    List,
    /// Show one run with all of its events
    Show { job_id: String },
    /// Find runs by description or event text
    Search { query: String },
    /// Delete a run from the archive
    Delete { job_id: String },
    /// Totals across the archive
    Stats,
}
