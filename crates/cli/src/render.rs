use bgrun::{ArchiveStats, ClientView, Event, HistoryRecord, JobStatus, Payload};
use colored::*;
use spinners::{Spinner, Spinners};
use std::io::{self, IsTerminal, Write};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Prints the events of successive views exactly once, with a spinner while
/// the job is quiet.
pub struct EventPrinter {
    next_sequence: u64,
    spinner: Option<Spinner>,
    interactive: bool,
}

impl EventPrinter {
    pub fn new() -> Self {
        Self {
            next_sequence: 0,
            spinner: None,
            interactive: io::stdout().is_terminal(),
        }
    }

    pub fn show(&mut self, view: &ClientView) {
        let fresh = view.events_from(self.next_sequence);
        if !fresh.is_empty() {
            self.stop_spinner();
            for event in fresh {
                print_event(event);
            }
            if let Some(last) = fresh.last() {
                self.next_sequence = last.sequence + 1;
            }
        }

        if view.status.is_terminal() {
            self.stop_spinner();
        } else if self.interactive && self.spinner.is_none() {
            self.spinner = Some(Spinner::new(
                Spinners::Dots12,
                "Working...".bright_magenta().to_string(),
            ));
        }
    }

    fn stop_spinner(&mut self) {
        if let Some(mut sp) = self.spinner.take() {
            sp.stop();
            print!("\r\x1B[K");
            io::stdout().flush().ok();
        }
    }
}

impl Default for EventPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventPrinter {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}

pub fn print_event(event: &Event) {
    let body = match &event.payload {
        Payload::Text(text) => text.clone(),
        Payload::Structured(value) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
    };
    println!(
        "{} {} {}",
        format!("[{}]", event.sequence).dimmed(),
        format!("{}:", event.source).bright_cyan().bold(),
        body
    );
}

pub fn status_label(status: JobStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        JobStatus::Idle => label.dimmed(),
        JobStatus::Running => label.bright_yellow(),
        JobStatus::Completed => label.bright_green(),
        JobStatus::Error => label.bright_red(),
        JobStatus::Cancelled => label.bright_blue(),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

pub fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

pub fn print_view(view: &ClientView, stale_after: Duration) {
    println!("{} {}", "Job:".bold(), view.job_id);
    println!("{} {}", "Status:".bold(), status_label(view.status));
    if let Some(task) = &view.task_description {
        println!("{} {}", "Task:".bold(), task);
    }
    if let Some(started_at) = view.started_at {
        println!("{} {}", "Started:".bold(), format_time(started_at));
    }
    println!("{} {}", "Elapsed:".bold(), format_duration(view.elapsed));
    println!("{} {}", "Events:".bold(), view.events.len());
    if let Some(last) = view.last_activity {
        println!("{} {}", "Last write:".bold(), format_time(last));
    }
    if let Some(message) = &view.error_message {
        println!("{} {}", "Error:".bright_red(), message);
    }
    if view.is_stale(stale_after) {
        println!(
            "{} no writes for over {}; the worker may have died. Run `bgrun reset --force` to clear the slot.",
            "!".bright_yellow(),
            format_duration(stale_after)
        );
    }
}

pub fn print_record_line(record: &HistoryRecord) {
    println!(
        "{}  {:<9}  {:>4} events  {:>8}  {}  {}",
        format_time(record.started_at),
        status_label(record.status),
        record.event_count,
        format_duration(record.duration()),
        record.job_id.to_string().dimmed(),
        record.task_description
    );
}

pub fn print_record(record: &HistoryRecord) {
    println!("{} {}", "Job:".bold(), record.job_id);
    println!("{} {}", "Task:".bold(), record.task_description);
    println!("{} {}", "Status:".bold(), status_label(record.status));
    println!("{} {}", "Started:".bold(), format_time(record.started_at));
    println!("{} {}", "Duration:".bold(), format_duration(record.duration()));
    if let Some(message) = &record.error_message {
        println!("{} {}", "Error:".bright_red(), message);
    }
    println!();
    for event in &record.events {
        print_event(event);
    }
}

pub fn print_stats(stats: &ArchiveStats) {
    println!("{} {}", "Runs:".bold(), stats.total_runs);
    println!(
        "  {} completed, {} cancelled, {} failed",
        stats.completed.to_string().bright_green(),
        stats.cancelled.to_string().bright_blue(),
        stats.failed.to_string().bright_red()
    );
    println!("{} {}", "Events:".bold(), stats.total_events);
    match stats.latest_run {
        Some(at) => println!("{} {}", "Latest run:".bold(), format_time(at)),
        None => println!("{} none", "Latest run:".bold()),
    }
}
