//! Store doubles for exercising failure paths.

use crate::error::{JobError, JobResult};
use crate::events::Event;
use crate::job::{Job, JobId};
use crate::store::{CompletionMarker, ErrorMarker, MemoryStateStore, StateStore};
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

/// Wraps a [`MemoryStateStore`] and rejects selected writes with `StoreIo`.
pub struct FailingStore {
    pub inner: MemoryStateStore,
    fail_snapshots: bool,
    fail_markers: bool,
}

impl FailingStore {
    pub fn failing_snapshots() -> Self {
        Self {
            inner: MemoryStateStore::new(),
            fail_snapshots: true,
            fail_markers: false,
        }
    }

    pub fn failing_everything() -> Self {
        Self {
            inner: MemoryStateStore::new(),
            fail_snapshots: true,
            fail_markers: true,
        }
    }

    fn io_error() -> JobError {
        JobError::StoreIo("No space left on device".to_string())
    }
}

#[async_trait]
impl StateStore for FailingStore {
    async fn write_snapshot(&self, job_id: &JobId, events: &[Event]) -> JobResult<()> {
        if self.fail_snapshots {
            return Err(Self::io_error());
        }
        self.inner.write_snapshot(job_id, events).await
    }

    async fn read_snapshot(&self, job_id: &JobId) -> JobResult<Option<Vec<Event>>> {
        self.inner.read_snapshot(job_id).await
    }

    async fn write_completion(
        &self,
        job_id: &JobId,
        event_count: usize,
        cancelled: bool,
    ) -> JobResult<()> {
        if self.fail_markers {
            return Err(Self::io_error());
        }
        self.inner
            .write_completion(job_id, event_count, cancelled)
            .await
    }

    async fn write_error(&self, job_id: &JobId, message: &str) -> JobResult<()> {
        if self.fail_markers {
            return Err(Self::io_error());
        }
        self.inner.write_error(job_id, message).await
    }

    async fn read_completion(&self, job_id: &JobId) -> JobResult<Option<CompletionMarker>> {
        self.inner.read_completion(job_id).await
    }

    async fn read_error(&self, job_id: &JobId) -> JobResult<Option<ErrorMarker>> {
        self.inner.read_error(job_id).await
    }

    async fn request_cancel(&self, job_id: &JobId) -> JobResult<()> {
        self.inner.request_cancel(job_id).await
    }

    async fn cancel_requested(&self, job_id: &JobId) -> JobResult<bool> {
        self.inner.cancel_requested(job_id).await
    }

    async fn write_job(&self, job: &Job) -> JobResult<()> {
        self.inner.write_job(job).await
    }

    async fn update_job(&self, job: &Job) -> JobResult<bool> {
        self.inner.update_job(job).await
    }

    async fn read_job(&self) -> JobResult<Option<Job>> {
        self.inner.read_job().await
    }

    async fn clear(&self) -> JobResult<()> {
        self.inner.clear().await
    }

    async fn last_activity(&self, job_id: &JobId) -> JobResult<Option<OffsetDateTime>> {
        self.inner.last_activity(job_id).await
    }
}

/// Shares a [`MemoryStateStore`] and holds back the terminal job-record
/// update by `delay`, leaving a window between the marker and the record.
#[derive(Clone)]
pub struct SlowFinishStore {
    pub inner: MemoryStateStore,
    delay: Duration,
}

impl SlowFinishStore {
    pub fn new(inner: MemoryStateStore, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl StateStore for SlowFinishStore {
    async fn write_snapshot(&self, job_id: &JobId, events: &[Event]) -> JobResult<()> {
        self.inner.write_snapshot(job_id, events).await
    }

    async fn read_snapshot(&self, job_id: &JobId) -> JobResult<Option<Vec<Event>>> {
        self.inner.read_snapshot(job_id).await
    }

    async fn write_completion(
        &self,
        job_id: &JobId,
        event_count: usize,
        cancelled: bool,
    ) -> JobResult<()> {
        self.inner
            .write_completion(job_id, event_count, cancelled)
            .await
    }

    async fn write_error(&self, job_id: &JobId, message: &str) -> JobResult<()> {
        self.inner.write_error(job_id, message).await
    }

    async fn read_completion(&self, job_id: &JobId) -> JobResult<Option<CompletionMarker>> {
        self.inner.read_completion(job_id).await
    }

    async fn read_error(&self, job_id: &JobId) -> JobResult<Option<ErrorMarker>> {
        self.inner.read_error(job_id).await
    }

    async fn request_cancel(&self, job_id: &JobId) -> JobResult<()> {
        self.inner.request_cancel(job_id).await
    }

    async fn cancel_requested(&self, job_id: &JobId) -> JobResult<bool> {
        self.inner.cancel_requested(job_id).await
    }

    async fn write_job(&self, job: &Job) -> JobResult<()> {
        self.inner.write_job(job).await
    }

    async fn update_job(&self, job: &Job) -> JobResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.update_job(job).await
    }

    async fn read_job(&self) -> JobResult<Option<Job>> {
        self.inner.read_job().await
    }

    async fn clear(&self) -> JobResult<()> {
        self.inner.clear().await
    }

    async fn last_activity(&self, job_id: &JobId) -> JobResult<Option<OffsetDateTime>> {
        self.inner.last_activity(job_id).await
    }
}
