//! Job controller: the single entry point for starting and cancelling the
//! job in one slot, and the only writer of the job record.

use crate::adapter::{AdapterOptions, RunOutcome, StreamingAdapter};
use crate::error::{JobError, JobResult};
use crate::generator::{GeneratorFactory, TaskRequest};
use crate::job::{Job, JobId, JobParams, JobStatus, elapsed_between};
use crate::store::{StateStore, derive_status};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

/// Where the worker for a job runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// A task on the host's tokio runtime.
    #[default]
    Task,
    /// An OS thread running its own single-threaded runtime, shared with no
    /// other job.
    DedicatedThread,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub spawn_mode: SpawnMode,
    /// Prefix the task handed to the generator with the submission time.
    pub include_timestamp: bool,
    pub skip_sources: Vec<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            spawn_mode: SpawnMode::Task,
            include_timestamp: false,
            skip_sources: AdapterOptions::default().skip_sources,
        }
    }
}

enum WorkerHandle {
    Task(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        match self {
            WorkerHandle::Task(handle) => handle.is_finished(),
            WorkerHandle::Thread(handle) => handle.is_finished(),
        }
    }
}

struct ActiveJob {
    job_id: JobId,
    cancel: CancellationToken,
    worker: Option<WorkerHandle>,
}

pub struct JobController {
    store: Arc<dyn StateStore>,
    factory: Arc<dyn GeneratorFactory>,
    options: ControllerOptions,
    active: Mutex<Option<ActiveJob>>,
    /// Serializes submit/reset so the running check and the clear are atomic.
    submit_gate: TokioMutex<()>,
}

impl JobController {
    pub fn new(store: Arc<dyn StateStore>, factory: Arc<dyn GeneratorFactory>) -> Self {
        Self::with_options(store, factory, ControllerOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn StateStore>,
        factory: Arc<dyn GeneratorFactory>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            store,
            factory,
            options,
            active: Mutex::new(None),
            submit_gate: TokioMutex::new(()),
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    /// Start a new job in this slot and hand it to a detached worker.
    ///
    /// Fails with `AlreadyRunning` while the slot's current job is running,
    /// whether its worker lives in this process or another one, and while
    /// this controller's previous worker is still recording its final state.
    pub async fn submit(&self, params: JobParams) -> JobResult<JobId> {
        validate(&params)?;
        let _gate = self.submit_gate.lock().await;

        if let Some(job_id) = self.live_worker_job() {
            return Err(JobError::AlreadyRunning {
                job_id: job_id.to_string(),
            });
        }
        if let Some(job_id) = self.running_job().await? {
            return Err(JobError::AlreadyRunning {
                job_id: job_id.to_string(),
            });
        }

        self.store.clear().await?;
        let job = Job::start(params);
        self.store.write_job(&job).await?;

        let cancel = CancellationToken::new();
        let worker = Worker {
            store: Arc::clone(&self.store),
            factory: Arc::clone(&self.factory),
            request: TaskRequest {
                job_id: job.id.clone(),
                task: render_task(
                    &job.params.task_description,
                    job.started_at,
                    self.options.include_timestamp,
                ),
                max_turns: job.params.max_turns,
            },
            adapter_options: AdapterOptions {
                max_events: job.params.max_events,
                skip_sources: self.options.skip_sources.clone(),
            },
            cancel: cancel.clone(),
            job: job.clone(),
        };
        let handle = worker.spawn(self.options.spawn_mode)?;

        info!(
            "submitted job {} (max_turns={}, max_events={})",
            job.id, job.params.max_turns, job.params.max_events
        );
        *self.active.lock() = Some(ActiveJob {
            job_id: job.id.clone(),
            cancel,
            worker: Some(handle),
        });
        Ok(job.id)
    }

    /// Ask the worker to stop at its next safe point. A no-op unless the job
    /// is running.
    pub async fn request_cancel(&self, job_id: &JobId) -> JobResult<()> {
        let token = self
            .active
            .lock()
            .as_ref()
            .filter(|a| &a.job_id == job_id)
            .map(|a| a.cancel.clone());
        if request_cancel(self.store.as_ref(), job_id).await?
            && let Some(token) = token
        {
            token.cancel();
        }
        Ok(())
    }

    pub async fn current_status(&self, job_id: &JobId) -> JobResult<JobStatus> {
        derive_status(self.store.as_ref(), job_id).await
    }

    /// The job currently occupying the slot.
    pub async fn current_job(&self) -> JobResult<Option<Job>> {
        self.store.read_job().await
    }

    /// Wait for this process's worker to exit. Hosts normally poll instead.
    pub async fn join(&self) -> JobResult<()> {
        let worker = self.active.lock().as_mut().and_then(|a| a.worker.take());
        match worker {
            Some(WorkerHandle::Task(handle)) => handle.await?,
            Some(WorkerHandle::Thread(handle)) => {
                tokio::task::spawn_blocking(move || handle.join())
                    .await?
                    .map_err(|_| JobError::InvalidOperation("worker thread panicked".to_string()))?
            }
            None => {}
        }
        Ok(())
    }

    /// Operator recovery; see [`reset_stale`]. Refused while this
    /// controller's own worker is still alive.
    pub async fn reset_stale(&self, stale_after: Duration) -> JobResult<bool> {
        let _gate = self.submit_gate.lock().await;
        if self.worker_alive() {
            return Err(JobError::InvalidOperation(
                "the worker for this slot is still running in this process".to_string(),
            ));
        }
        let reset = reset_stale(self.store.as_ref(), stale_after).await?;
        if reset {
            *self.active.lock() = None;
        }
        Ok(reset)
    }

    fn worker_alive(&self) -> bool {
        self.live_worker_job().is_some()
    }

    fn live_worker_job(&self) -> Option<JobId> {
        self.active
            .lock()
            .as_ref()
            .filter(|a| a.worker.as_ref().is_some_and(|w| !w.is_finished()))
            .map(|a| a.job_id.clone())
    }

    async fn running_job(&self) -> JobResult<Option<JobId>> {
        running_job(self.store.as_ref()).await
    }
}

/// Raise the cancel flag for `job_id` if it is the slot's running job.
/// Returns whether the flag was set. Works from any process that can open
/// the slot; the worker picks the flag up between emissions.
pub async fn request_cancel(store: &dyn StateStore, job_id: &JobId) -> JobResult<bool> {
    if derive_status(store, job_id).await? != JobStatus::Running {
        return Ok(false);
    }
    store.request_cancel(job_id).await?;
    info!("cancellation requested for job {}", job_id);
    Ok(true)
}

/// Clear a slot whose job is stuck in `running` because its worker died
/// without recording a marker. Refuses unless nothing has been written for at
/// least `stale_after`. Returns false when no job is running.
pub async fn reset_stale(store: &dyn StateStore, stale_after: Duration) -> JobResult<bool> {
    let Some(job_id) = running_job(store).await? else {
        return Ok(false);
    };
    let last = store
        .last_activity(&job_id)
        .await?
        .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
    let quiet_for = elapsed_between(last, OffsetDateTime::now_utc());
    if quiet_for < stale_after {
        return Err(JobError::InvalidOperation(format!(
            "job {} wrote state {}s ago; not stale",
            job_id,
            quiet_for.as_secs()
        )));
    }
    warn!(
        "resetting stale job {} (no writes for {}s)",
        job_id,
        quiet_for.as_secs()
    );
    store.clear().await?;
    Ok(true)
}

async fn running_job(store: &dyn StateStore) -> JobResult<Option<JobId>> {
    let Some(job) = store.read_job().await? else {
        return Ok(None);
    };
    if derive_status(store, &job.id).await? == JobStatus::Running {
        Ok(Some(job.id))
    } else {
        Ok(None)
    }
}

fn validate(params: &JobParams) -> JobResult<()> {
    if params.task_description.trim().is_empty() {
        return Err(JobError::InvalidOperation(
            "task description must not be empty".to_string(),
        ));
    }
    if params.max_turns == 0 || params.max_events == 0 {
        return Err(JobError::InvalidOperation(
            "max_turns and max_events must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Task text handed to the generator.
pub fn render_task(task: &str, submitted_at: OffsetDateTime, include_timestamp: bool) -> String {
    if !include_timestamp {
        return task.to_string();
    }
    let now = submitted_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| submitted_at.unix_timestamp().to_string());
    format!(
        "The current time is {}. Use it as the reference time for the task below.\n\nTask: {}\n",
        now, task
    )
}

/// Everything a detached worker needs; owns no reference to the controller.
struct Worker {
    store: Arc<dyn StateStore>,
    factory: Arc<dyn GeneratorFactory>,
    request: TaskRequest,
    adapter_options: AdapterOptions,
    cancel: CancellationToken,
    job: Job,
}

impl Worker {
    fn spawn(self, mode: SpawnMode) -> JobResult<WorkerHandle> {
        match mode {
            SpawnMode::Task => Ok(WorkerHandle::Task(tokio::spawn(self.run()))),
            SpawnMode::DedicatedThread => {
                let name = format!("bgrun-{}", self.job.id);
                let handle = std::thread::Builder::new().name(name).spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("failed to build worker runtime for job {}: {}", self.job.id, e);
                            return;
                        }
                    };
                    runtime.block_on(self.run());
                })?;
                Ok(WorkerHandle::Thread(handle))
            }
        }
    }

    async fn run(self) {
        let adapter = StreamingAdapter::new(
            Arc::clone(&self.store),
            self.job.id.clone(),
            self.cancel,
            self.adapter_options,
        );
        let outcome = adapter
            .start_and_run(self.factory.as_ref(), &self.request)
            .await;
        finish(self.store.as_ref(), self.job, &outcome).await;
    }
}

/// Record the terminal transition for `job`, unless the slot already
/// belongs to a newer job.
async fn finish(store: &dyn StateStore, mut job: Job, outcome: &RunOutcome) {
    let Some(status) = outcome.status() else {
        if let RunOutcome::Abandoned { message } = outcome {
            error!(
                "job {} left in running state after store failure: {}",
                job.id, message
            );
        }
        return;
    };
    job.status = status;
    job.finished_at = Some(OffsetDateTime::now_utc());
    match store.update_job(&job).await {
        Ok(true) => info!("job {} finished: {}", job.id, status),
        Ok(false) => warn!(
            "job {} finished: {}, but the slot has moved on; job record left as is",
            job.id, status
        ),
        Err(e) => error!("failed to record {} for job {}: {}", status, job.id, e),
    }
}
