//! In-process state store for embedding hosts and tests.

use super::{
    CancelRequest, CompletionMarker, ErrorMarker, MarkerKind, Snapshot, StateStore,
};
use crate::error::{JobError, JobResult};
use crate::events::Event;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Default)]
struct SlotState {
    job: Option<Job>,
    snapshot: Option<Arc<Snapshot>>,
    completion: Option<CompletionMarker>,
    error: Option<ErrorMarker>,
    cancel: Option<CancelRequest>,
}

/// Holds one slot in memory. Snapshots are swapped as whole `Arc`s under a
/// short write lock, which gives readers the same all-or-nothing view as the
/// file store's rename.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<RwLock<SlotState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn write_snapshot(&self, job_id: &JobId, events: &[Event]) -> JobResult<()> {
        let snapshot = Arc::new(Snapshot {
            job_id: job_id.clone(),
            events: events.to_vec(),
            written_at: OffsetDateTime::now_utc(),
        });
        self.state.write().snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self, job_id: &JobId) -> JobResult<Option<Vec<Event>>> {
        let snapshot = self.state.read().snapshot.clone();
        Ok(snapshot
            .filter(|s| &s.job_id == job_id)
            .map(|s| s.events.clone()))
    }

    async fn write_completion(
        &self,
        job_id: &JobId,
        event_count: usize,
        cancelled: bool,
    ) -> JobResult<()> {
        let mut state = self.state.write();
        if state.error.as_ref().is_some_and(|m| &m.job_id == job_id) {
            return Err(JobError::ConflictingMarker {
                job_id: job_id.to_string(),
                existing: MarkerKind::Error.as_str().to_string(),
            });
        }
        if state.completion.as_ref().is_some_and(|m| &m.job_id == job_id) {
            return Ok(());
        }
        state.completion = Some(CompletionMarker {
            job_id: job_id.clone(),
            event_count,
            cancelled,
            written_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn write_error(&self, job_id: &JobId, message: &str) -> JobResult<()> {
        let mut state = self.state.write();
        if state.completion.as_ref().is_some_and(|m| &m.job_id == job_id) {
            return Err(JobError::ConflictingMarker {
                job_id: job_id.to_string(),
                existing: MarkerKind::Completion.as_str().to_string(),
            });
        }
        if state.error.as_ref().is_some_and(|m| &m.job_id == job_id) {
            return Ok(());
        }
        state.error = Some(ErrorMarker {
            job_id: job_id.clone(),
            message: message.to_string(),
            written_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn read_completion(&self, job_id: &JobId) -> JobResult<Option<CompletionMarker>> {
        Ok(self
            .state
            .read()
            .completion
            .clone()
            .filter(|m| &m.job_id == job_id))
    }

    async fn read_error(&self, job_id: &JobId) -> JobResult<Option<ErrorMarker>> {
        Ok(self
            .state
            .read()
            .error
            .clone()
            .filter(|m| &m.job_id == job_id))
    }

    async fn request_cancel(&self, job_id: &JobId) -> JobResult<()> {
        self.state.write().cancel = Some(CancelRequest {
            job_id: job_id.clone(),
            requested_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn cancel_requested(&self, job_id: &JobId) -> JobResult<bool> {
        Ok(self
            .state
            .read()
            .cancel
            .as_ref()
            .is_some_and(|r| &r.job_id == job_id))
    }

    async fn write_job(&self, job: &Job) -> JobResult<()> {
        self.state.write().job = Some(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> JobResult<bool> {
        let mut state = self.state.write();
        if state.job.as_ref().is_none_or(|current| current.id != job.id) {
            return Ok(false);
        }
        state.job = Some(job.clone());
        Ok(true)
    }

    async fn read_job(&self) -> JobResult<Option<Job>> {
        Ok(self.state.read().job.clone())
    }

    async fn clear(&self) -> JobResult<()> {
        *self.state.write() = SlotState::default();
        Ok(())
    }

    async fn last_activity(&self, job_id: &JobId) -> JobResult<Option<OffsetDateTime>> {
        let state = self.state.read();
        let times = [
            state
                .job
                .as_ref()
                .filter(|j| &j.id == job_id)
                .map(|j| j.finished_at.unwrap_or(j.started_at)),
            state
                .snapshot
                .as_ref()
                .filter(|s| &s.job_id == job_id)
                .map(|s| s.written_at),
            state
                .completion
                .as_ref()
                .filter(|m| &m.job_id == job_id)
                .map(|m| m.written_at),
            state
                .error
                .as_ref()
                .filter(|m| &m.job_id == job_id)
                .map(|m| m.written_at),
        ];
        Ok(times.into_iter().flatten().max())
    }
}
