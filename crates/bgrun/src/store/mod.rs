//! Durable state store for one slot.
//!
//! A slot holds the snapshot, the two terminal markers, the cancellation
//! control flag and the controller's job record for whichever job currently
//! occupies it. Every record is stamped with the [`JobId`] that wrote it and
//! reads for a different job id report absence, so a reader can never mistake
//! a previous run's state for the current one.
//!
//! ## Write discipline
//!
//! - Every write replaces the whole record; nothing is appended in place.
//! - Snapshot and markers have one writer (the adapter); the job record has
//!   one writer (the controller). Readers never lock.
//! - Completion and error markers are mutually exclusive per job.

pub mod fs;
pub mod memory;

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;

use crate::error::JobResult;
use crate::events::Event;
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The full ordered event list of a job, written as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub job_id: JobId,
    pub events: Vec<Event>,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub job_id: JobId,
    pub event_count: usize,
    /// True when the loop stopped because cancellation was observed.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub job_id: JobId,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: JobId,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

/// Kind of terminal marker, used in conflict diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Completion,
    Error,
}

impl MarkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerKind::Completion => "completion",
            MarkerKind::Error => "error",
        }
    }
}

/// Crash-tolerant persistence for one slot, readable concurrently with writes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the snapshot with `events`. Readers see either the previous or
    /// the new snapshot, never a partial one.
    async fn write_snapshot(&self, job_id: &JobId, events: &[Event]) -> JobResult<()>;

    /// The most recently completed snapshot write for `job_id`.
    async fn read_snapshot(&self, job_id: &JobId) -> JobResult<Option<Vec<Event>>>;

    /// Record normal (or cancelled) loop exit. Idempotent; fails with
    /// `ConflictingMarker` if an error marker exists.
    async fn write_completion(
        &self,
        job_id: &JobId,
        event_count: usize,
        cancelled: bool,
    ) -> JobResult<()>;

    /// Record a producer failure. Idempotent; fails with `ConflictingMarker`
    /// if a completion marker exists.
    async fn write_error(&self, job_id: &JobId, message: &str) -> JobResult<()>;

    async fn read_completion(&self, job_id: &JobId) -> JobResult<Option<CompletionMarker>>;

    async fn read_error(&self, job_id: &JobId) -> JobResult<Option<ErrorMarker>>;

    /// Set the cancellation control flag for `job_id`.
    async fn request_cancel(&self, job_id: &JobId) -> JobResult<()>;

    async fn cancel_requested(&self, job_id: &JobId) -> JobResult<bool>;

    /// Persist the controller's job record.
    async fn write_job(&self, job: &Job) -> JobResult<()>;

    /// Replace the job record only while the slot still holds `job.id`.
    /// Returns false, writing nothing, once the slot has moved on to another
    /// job or been cleared.
    async fn update_job(&self, job: &Job) -> JobResult<bool>;

    /// The job record currently occupying the slot, if any.
    async fn read_job(&self) -> JobResult<Option<Job>>;

    /// Remove every artifact in the slot. Readers observe either the old
    /// complete state or an empty slot.
    async fn clear(&self) -> JobResult<()>;

    /// Time of the newest write for `job_id`.
    async fn last_activity(&self, job_id: &JobId) -> JobResult<Option<OffsetDateTime>>;
}

/// Status as seen from the store alone: markers win over the job record.
pub async fn derive_status(store: &dyn StateStore, job_id: &JobId) -> JobResult<JobStatus> {
    if store.read_error(job_id).await?.is_some() {
        return Ok(JobStatus::Error);
    }
    if let Some(marker) = store.read_completion(job_id).await? {
        return Ok(if marker.cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        });
    }
    match store.read_job().await? {
        Some(job) if &job.id == job_id => Ok(job.status),
        _ => Ok(JobStatus::Idle),
    }
}
