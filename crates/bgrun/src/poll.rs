//! Read side used by hosts on every refresh: never blocks on the worker and
//! never fails because a job is missing.

use crate::archive::{HistoryArchive, HistoryRecord};
use crate::error::JobResult;
use crate::events::Event;
use crate::job::{JobId, JobStatus, elapsed_between};
use crate::store::StateStore;
use log::{debug, warn};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientView {
    pub job_id: JobId,
    pub events: Vec<Event>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub task_description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub elapsed: Duration,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_activity: Option<OffsetDateTime>,
}

impl ClientView {
    fn idle(job_id: JobId) -> Self {
        Self {
            job_id,
            events: Vec::new(),
            status: JobStatus::Idle,
            error_message: None,
            task_description: None,
            started_at: None,
            elapsed: Duration::ZERO,
            last_activity: None,
        }
    }

    /// A running job whose last write is older than `threshold`: its worker
    /// has most likely died without recording a marker.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.status == JobStatus::Running
            && self
                .last_activity
                .is_some_and(|t| elapsed_between(t, OffsetDateTime::now_utc()) >= threshold)
    }

    /// Events with a sequence at or after `from`.
    pub fn events_from(&self, from: u64) -> &[Event] {
        let start = self.events.partition_point(|e| e.sequence < from);
        &self.events[start..]
    }
}

/// Job ids whose last view a client remembers; least recently polled ids
/// are evicted first.
pub const DEFAULT_VIEW_CAPACITY: u64 = 64;

fn view_cache(capacity: u64) -> Cache<JobId, Arc<ClientView>> {
    Cache::builder()
        .max_capacity(capacity.max(1))
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

pub struct PollingClient {
    store: Arc<dyn StateStore>,
    archive: Option<Arc<HistoryArchive>>,
    last_views: Cache<JobId, Arc<ClientView>>,
}

impl PollingClient {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            archive: None,
            last_views: view_cache(DEFAULT_VIEW_CAPACITY),
        }
    }

    /// Bound the number of remembered job views.
    pub fn with_view_capacity(mut self, capacity: u64) -> Self {
        self.last_views = view_cache(capacity);
        self
    }

    /// Archive every terminal job this client observes.
    pub fn with_archive(mut self, archive: Arc<HistoryArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Merged view of `job_id`. Unknown jobs read as idle.
    pub async fn poll(&self, job_id: &JobId) -> JobResult<ClientView> {
        let previous = self.last_views.get(job_id);
        if let Some(view) = &previous
            && view.status.is_terminal()
        {
            self.archive(view).await;
            return Ok(view.as_ref().clone());
        }

        let mut view = self.read_view(job_id).await?;
        if view.status.is_terminal() && view.started_at.is_none() {
            // The job record vanished between the marker and record reads: the
            // slot was cleared for a new job. Nothing here is safe to freeze.
            debug!("job {} was replaced while being read", job_id);
            return Ok(match previous {
                Some(previous) => previous.as_ref().clone(),
                None => ClientView::idle(job_id.clone()),
            });
        }
        if let Some(previous) = &previous
            && previous.events.len() > view.events.len()
        {
            view.events = previous.events.clone();
        }
        if view.status.is_terminal() {
            self.archive(&view).await;
        }
        self.last_views
            .insert(job_id.clone(), Arc::new(view.clone()));
        Ok(view)
    }

    /// Poll whichever job currently occupies the slot.
    pub async fn poll_current(&self) -> JobResult<Option<ClientView>> {
        match self.store.read_job().await? {
            Some(job) => self.poll(&job.id).await.map(Some),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    fn cached_views(&self) -> u64 {
        self.last_views.run_pending_tasks();
        self.last_views.entry_count()
    }

    async fn read_view(&self, job_id: &JobId) -> JobResult<ClientView> {
        // Markers first: a marker is only written after the final snapshot, so
        // a snapshot read afterwards is complete for a terminal job.
        let error = self.store.read_error(job_id).await?;
        let completion = self.store.read_completion(job_id).await?;
        let job = self
            .store
            .read_job()
            .await?
            .filter(|job| &job.id == job_id);
        let events = self.store.read_snapshot(job_id).await?.unwrap_or_default();

        let mut view = ClientView::idle(job_id.clone());
        let mut finished_at = None;
        if let Some(marker) = &error {
            view.status = JobStatus::Error;
            view.error_message = Some(marker.message.clone());
            finished_at = Some(marker.written_at);
        } else if let Some(marker) = &completion {
            view.status = if marker.cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            };
            finished_at = Some(marker.written_at);
        } else if let Some(job) = &job {
            view.status = job.status;
            finished_at = job.finished_at;
        }

        if let Some(job) = job {
            let end = finished_at.unwrap_or_else(OffsetDateTime::now_utc);
            view.elapsed = elapsed_between(job.started_at, end);
            view.started_at = Some(job.started_at);
            view.task_description = Some(job.params.task_description);
        }
        view.events = events;
        view.last_activity = self.store.last_activity(job_id).await?;
        Ok(view)
    }

    async fn archive(&self, view: &ClientView) {
        let (Some(archive), Some(started_at)) = (&self.archive, view.started_at) else {
            return;
        };
        let record = HistoryRecord::new(
            view.job_id.clone(),
            started_at,
            view.task_description.as_deref().unwrap_or_default(),
            view.elapsed,
            view.status,
            view.events.clone(),
        )
        .with_error_message(view.error_message.clone());
        if let Err(e) = archive.archive_if_new(record).await {
            warn!("failed to archive job {}: {}", view.job_id, e);
        }
    }
}

#[derive(Debug, Clone)]
pub enum WatchOutcome {
    Finished(ClientView),
    TimedOut(ClientView),
}

/// Repeatedly polls one job at a fixed cadence until it is terminal.
pub struct JobWatcher {
    client: Arc<PollingClient>,
    job_id: JobId,
    poll_interval: Duration,
    total_timeout: Option<Duration>,
}

impl JobWatcher {
    pub fn new(client: Arc<PollingClient>, job_id: JobId) -> Self {
        Self {
            client,
            job_id,
            poll_interval: Duration::from_millis(500),
            total_timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout);
        self
    }

    /// Calls `on_view` after every poll, including the final one.
    pub async fn wait<F>(&self, mut on_view: F) -> JobResult<WatchOutcome>
    where
        F: FnMut(&ClientView),
    {
        let start_time = Instant::now();
        loop {
            let view = self.client.poll(&self.job_id).await?;
            on_view(&view);

            if view.status.is_terminal() {
                return Ok(WatchOutcome::Finished(view));
            }
            if self
                .total_timeout
                .is_some_and(|limit| start_time.elapsed() > limit)
            {
                return Ok(WatchOutcome::TimedOut(view));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
