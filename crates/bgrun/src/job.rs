//! Job identity, parameters and lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque handle for one run. Time-ordered, so ids sort by submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("job id must not be empty".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Submission parameters, immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub task_description: String,
    pub max_turns: u32,
    /// Soft cap on persisted events; reaching it ends the run normally.
    pub max_events: usize,
}

impl JobParams {
    pub fn new(task_description: impl Into<String>, max_turns: u32, max_events: usize) -> Self {
        Self {
            task_description: task_description.into(),
            max_turns,
            max_events,
        }
    }
}

/// The controller's durable record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(flatten)]
    pub params: JobParams,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub finished_at: Option<OffsetDateTime>,
}

impl Job {
    pub fn start(params: JobParams) -> Self {
        Self {
            id: JobId::generate(),
            status: JobStatus::Running,
            params,
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
        }
    }

    /// Wall-clock time since start; stops advancing once the job has finished.
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(OffsetDateTime::now_utc);
        elapsed_between(self.started_at, end)
    }
}

pub(crate) fn elapsed_between(start: OffsetDateTime, end: OffsetDateTime) -> Duration {
    let delta = end - start;
    if delta.is_negative() {
        Duration::ZERO
    } else {
        Duration::try_from(delta).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_ordered() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Idle.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn elapsed_freezes_after_finish() {
        let mut job = Job::start(JobParams::new("task", 5, 10));
        job.started_at = OffsetDateTime::now_utc() - time::Duration::seconds(30);
        job.finished_at = Some(job.started_at + time::Duration::seconds(12));
        assert_eq!(job.elapsed(), Duration::from_secs(12));
    }

    #[test]
    fn job_record_round_trips_flattened_params() {
        let job = Job::start(JobParams::new("analyse sales", 20, 10));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["task_description"], "analyse sales");
        assert_eq!(json["status"], "running");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn empty_job_id_is_rejected() {
        assert!("  ".parse::<JobId>().is_err());
        assert_eq!("abc".parse::<JobId>().unwrap().as_str(), "abc");
    }
}
