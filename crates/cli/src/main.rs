use anyhow::{Context, Result, anyhow, bail};
use bgrun::config::{BgrunConfig, load_or_default};
use bgrun::controller::{request_cancel, reset_stale};
use bgrun::{
    FsStateStore, HistoryArchive, JobController, JobId, JobWatcher, PollingClient, StateStore,
    WatchOutcome,
};
use clap::Parser;
use colored::*;
use std::sync::Arc;

mod cli_args;
mod render;
mod tracing;

use crate::tracing::setup_logging;
use cli_args::{CliArgs, Commands, HistoryCommand};
use render::{EventPrinter, print_record, print_record_line, print_stats, print_view};

/// Everything a command needs for one slot.
struct Slot {
    config: BgrunConfig,
    store: Arc<dyn StateStore>,
    archive: Arc<HistoryArchive>,
    json: bool,
}

impl Slot {
    async fn open(args: &CliArgs) -> Result<Self> {
        let config = load_or_default(args.config.as_deref()).await?;
        let name = args.slot.as_deref().unwrap_or(&config.runtime.slot);
        let data_dir = config.data_dir()?;
        let store = FsStateStore::open_slot(&data_dir, name)
            .with_context(|| format!("Failed to open slot '{}' in {:?}", name, data_dir))?;
        let archive = HistoryArchive::open(config.history_path()?, config.runtime.history_capacity)
            .context("Failed to open history archive")?;
        Ok(Self {
            store: Arc::new(store),
            archive: Arc::new(archive),
            json: args.json,
            config,
        })
    }

    fn client(&self) -> Arc<PollingClient> {
        Arc::new(PollingClient::new(Arc::clone(&self.store)).with_archive(Arc::clone(&self.archive)))
    }

    fn watcher(&self, job_id: JobId) -> JobWatcher {
        JobWatcher::new(self.client(), job_id).with_poll_interval(self.config.poll_interval())
    }

    async fn current_job_id(&self) -> Result<JobId> {
        self.store
            .read_job()
            .await?
            .map(|job| job.id)
            .ok_or_else(|| anyhow!("No job in this slot"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;
    let args = CliArgs::parse();
    let slot = Slot::open(&args).await?;

    match args.command {
        Commands::Run {
            task,
            max_turns,
            max_events,
        } => run(&slot, task, max_turns, max_events).await,
        Commands::Watch { job } => {
            let job_id = match job {
                Some(id) => id.parse::<JobId>().map_err(|e| anyhow!(e))?,
                None => slot.current_job_id().await?,
            };
            let mut printer = EventPrinter::new();
            let outcome = slot.watcher(job_id).wait(|view| printer.show(view)).await?;
            drop(printer);
            finish(&slot, outcome)
        }
        Commands::Status => status(&slot).await,
        Commands::Cancel => {
            let job_id = slot.current_job_id().await?;
            if request_cancel(slot.store.as_ref(), &job_id).await? {
                println!("{} Cancellation requested for job {}", "✓".bright_green(), job_id);
            } else {
                println!("{} Job {} is not running", "!".bright_yellow(), job_id);
            }
            Ok(())
        }
        Commands::Reset { force } => {
            if !force {
                bail!("Refusing to reset without --force");
            }
            if reset_stale(slot.store.as_ref(), slot.config.stale_after()).await? {
                println!("{} Slot cleared", "✓".bright_green());
            } else {
                println!("{} No running job; nothing to reset", "!".bright_yellow());
            }
            Ok(())
        }
        Commands::History { command } => history(&slot, command).await,
    }
}

async fn run(
    slot: &Slot,
    task: String,
    max_turns: Option<u32>,
    max_events: Option<usize>,
) -> Result<()> {
    let factory = slot.config.generator_factory()?;
    let controller = JobController::with_options(
        Arc::clone(&slot.store),
        factory,
        slot.config.controller_options(),
    );
    let job_id = controller
        .submit(slot.config.job_params(task, max_turns, max_events))
        .await?;
    if !slot.json {
        println!("{} job {}", "Started".bright_green(), job_id);
    }

    let watcher = slot.watcher(job_id.clone());
    let outcome = {
        let mut printer = EventPrinter::new();
        let wait = watcher.wait(|view| {
            if !slot.json {
                printer.show(view)
            }
        });
        tokio::pin!(wait);

        let mut cancel_sent = false;
        loop {
            tokio::select! {
                outcome = &mut wait => break outcome?,
                signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                    signal?;
                    cancel_sent = true;
                    eprintln!("{}", "Cancelling after the current step...".bright_yellow());
                    controller.request_cancel(&job_id).await?;
                }
            }
        }
    };

    // Let the worker record its final job state before the process exits.
    controller.join().await?;
    finish(slot, outcome)
}

fn finish(slot: &Slot, outcome: WatchOutcome) -> Result<()> {
    let view = match outcome {
        WatchOutcome::Finished(view) => view,
        WatchOutcome::TimedOut(view) => view,
    };
    if slot.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        println!();
        print_view(&view, slot.config.stale_after());
    }
    match view.error_message {
        Some(message) if view.status == bgrun::JobStatus::Error => {
            Err(anyhow!("Job {} failed: {}", view.job_id, message))
        }
        _ => Ok(()),
    }
}

async fn status(slot: &Slot) -> Result<()> {
    let Some(view) = slot.client().poll_current().await? else {
        println!("{} Slot is idle", "!".bright_yellow());
        return Ok(());
    };
    if slot.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view, slot.config.stale_after());
    }
    Ok(())
}

async fn history(slot: &Slot, command: HistoryCommand) -> Result<()> {
    let archive = &slot.archive;
    match command {
        HistoryCommand::List => {
            let records = archive.list().await?;
            if slot.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("{} No archived runs", "!".bright_yellow());
            } else {
                records.iter().for_each(print_record_line);
            }
        }
        HistoryCommand::Show { job_id } => {
            let job_id = job_id.parse::<JobId>().map_err(|e| anyhow!(e))?;
            let record = archive
                .get(&job_id)
                .await?
                .ok_or_else(|| anyhow!("No archived run for job {}", job_id))?;
            if slot.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        HistoryCommand::Search { query } => {
            let records = archive.search(&query).await?;
            if slot.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("{} No runs match '{}'", "!".bright_yellow(), query);
            } else {
                records.iter().for_each(print_record_line);
            }
        }
        HistoryCommand::Delete { job_id } => {
            let job_id = job_id.parse::<JobId>().map_err(|e| anyhow!(e))?;
            if archive.delete(&job_id).await? {
                println!("{} Run {} has been deleted.", "✓".bright_green(), job_id);
            } else {
                println!("{} Run {} not found", "!".bright_yellow(), job_id);
            }
        }
        HistoryCommand::Stats => {
            let stats = archive.stats().await?;
            if slot.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
        }
    }
    Ok(())
}
