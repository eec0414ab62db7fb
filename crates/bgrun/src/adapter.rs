//! Streaming producer adapter: drives a generator and owns every snapshot and
//! marker write for one job.

use crate::error::JobError;
use crate::events::Event;
use crate::generator::{EventGenerator, GeneratorFactory, TaskRequest};
use crate::job::{JobId, JobStatus};
use crate::store::StateStore;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Stop consuming once this many events are persisted.
    pub max_events: usize,
    /// Emissions from these sources are dropped like empty ones.
    pub skip_sources: Vec<String>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            max_events: 100,
            skip_sources: vec!["user".to_string()],
        }
    }
}

/// How a run ended, as seen by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { event_count: usize },
    Cancelled { event_count: usize },
    Failed { event_count: usize, message: String },
    /// The store rejected writes and the error marker could not be recorded
    /// either. The job stays `running` and is only detectable as stale.
    Abandoned { message: String },
}

impl RunOutcome {
    /// Status the controller records; `None` leaves the job running.
    pub fn status(&self) -> Option<JobStatus> {
        match self {
            RunOutcome::Completed { .. } => Some(JobStatus::Completed),
            RunOutcome::Cancelled { .. } => Some(JobStatus::Cancelled),
            RunOutcome::Failed { .. } => Some(JobStatus::Error),
            RunOutcome::Abandoned { .. } => None,
        }
    }
}

enum Stop {
    Exhausted,
    EventLimit,
    Cancelled,
    GeneratorFailed(String),
    StoreFailed(JobError),
}

pub struct StreamingAdapter {
    store: Arc<dyn StateStore>,
    job_id: JobId,
    cancel: CancellationToken,
    options: AdapterOptions,
}

impl StreamingAdapter {
    pub fn new(
        store: Arc<dyn StateStore>,
        job_id: JobId,
        cancel: CancellationToken,
        options: AdapterOptions,
    ) -> Self {
        Self {
            store,
            job_id,
            cancel,
            options,
        }
    }

    /// Consume the generator to the end, then write exactly one marker.
    ///
    /// Never returns an error: producer failures become the error marker and
    /// store failures become `Failed` or `Abandoned`.
    #[instrument(name = "bgrun.adapter.run", skip_all, fields(job_id = %self.job_id))]
    pub async fn run(self, mut generator: Box<dyn EventGenerator>) -> RunOutcome {
        let mut buffer: Vec<Event> = Vec::new();
        let mut next_sequence: u64 = 0;

        let stop = if self.cancel_observed().await {
            Stop::Cancelled
        } else {
            loop {
                let emission = match generator.next_emission().await {
                    None => break Stop::Exhausted,
                    Some(Err(e)) => break Stop::GeneratorFailed(e.to_string()),
                    Some(Ok(emission)) => emission,
                };

                if emission.content.is_empty() || self.is_skipped(&emission.source) {
                    debug!("dropping emission from '{}'", emission.source);
                } else {
                    buffer.push(Event::from_emission(next_sequence, emission));
                    next_sequence += 1;
                    if let Err(e) = self.store.write_snapshot(&self.job_id, &buffer).await {
                        break Stop::StoreFailed(e);
                    }
                }

                if self.cancel_observed().await {
                    break Stop::Cancelled;
                }
                if buffer.len() >= self.options.max_events {
                    info!(
                        "job {} reached max_events={}",
                        self.job_id, self.options.max_events
                    );
                    break Stop::EventLimit;
                }
            }
        };

        if let Err(e) = generator.close().await {
            warn!("failed to close generator for job {}: {}", self.job_id, e);
        }

        let event_count = buffer.len();
        match stop {
            Stop::Exhausted | Stop::EventLimit => self.complete(event_count, false).await,
            Stop::Cancelled => {
                info!("job {} observed cancellation after {} events", self.job_id, event_count);
                self.complete(event_count, true).await
            }
            Stop::GeneratorFailed(message) => {
                warn!("generator for job {} failed: {}", self.job_id, message);
                self.fail(event_count, message).await
            }
            Stop::StoreFailed(e) => {
                error!("snapshot write for job {} failed: {}", self.job_id, e);
                self.fail(event_count, format!("state store write failed: {}", e))
                    .await
            }
        }
    }

    /// Build the generator for `request` and run it. A factory failure is a
    /// producer failure with zero events.
    pub async fn start_and_run(
        self,
        factory: &dyn GeneratorFactory,
        request: &TaskRequest,
    ) -> RunOutcome {
        match factory.start(request).await {
            Ok(generator) => self.run(generator).await,
            Err(e) => {
                warn!("generator for job {} failed to start: {}", self.job_id, e);
                self.fail(0, e.to_string()).await
            }
        }
    }

    fn is_skipped(&self, source: &str) -> bool {
        self.options.skip_sources.iter().any(|s| s == source)
    }

    async fn cancel_observed(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.store.cancel_requested(&self.job_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!("cannot read cancel flag for job {}: {}", self.job_id, e);
                false
            }
        }
    }

    async fn complete(&self, event_count: usize, cancelled: bool) -> RunOutcome {
        match self
            .store
            .write_completion(&self.job_id, event_count, cancelled)
            .await
        {
            Ok(()) if cancelled => RunOutcome::Cancelled { event_count },
            Ok(()) => RunOutcome::Completed { event_count },
            Err(e @ JobError::ConflictingMarker { .. }) => {
                error!("{}", e);
                RunOutcome::Failed {
                    event_count,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                error!("completion marker for job {} failed: {}", self.job_id, e);
                self.fail(event_count, format!("state store write failed: {}", e))
                    .await
            }
        }
    }

    async fn fail(&self, event_count: usize, message: String) -> RunOutcome {
        match self.store.write_error(&self.job_id, &message).await {
            Ok(()) => RunOutcome::Failed {
                event_count,
                message,
            },
            Err(e @ JobError::ConflictingMarker { .. }) => {
                error!("{}", e);
                RunOutcome::Failed {
                    event_count,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                error!(
                    "error marker for job {} could not be written ({}); job left running",
                    self.job_id, e
                );
                RunOutcome::Abandoned {
                    message: format!("{}; error marker write failed: {}", message, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeneratorError;
    use crate::events::Emission;
    use crate::generator::{StreamGenerator, channel};
    use crate::store::MemoryStateStore;
    use crate::test_utils::{FailingStore, scripted};
    use futures_util::stream;

    fn adapter(store: Arc<dyn StateStore>, max_events: usize) -> (StreamingAdapter, JobId) {
        let job_id = JobId::generate();
        let adapter = StreamingAdapter::new(
            store,
            job_id.clone(),
            CancellationToken::new(),
            AdapterOptions {
                max_events,
                ..Default::default()
            },
        );
        (adapter, job_id)
    }

    #[tokio::test]
    async fn empty_and_skipped_emissions_are_not_sequenced() {
        let store = Arc::new(MemoryStateStore::new());
        let (adapter, job_id) = adapter(store.clone(), 100);

        let outcome = adapter
            .run(scripted(vec![
                Emission::text("user", "the task echo"),
                Emission::text("PlanningAgent", "a"),
                Emission::text("PlanningAgent", ""),
                Emission::text("", "b"),
            ]))
            .await;

        assert_eq!(outcome, RunOutcome::Completed { event_count: 2 });
        let events = store.read_snapshot(&job_id).await.unwrap().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
        assert_eq!(events[1].source, "system");
        let marker = store.read_completion(&job_id).await.unwrap().unwrap();
        assert_eq!(marker.event_count, 2);
        assert!(!marker.cancelled);
    }

    #[tokio::test]
    async fn max_events_is_a_soft_completion() {
        let store = Arc::new(MemoryStateStore::new());
        let (adapter, job_id) = adapter(store.clone(), 3);

        let outcome = adapter
            .run(scripted(
                (0..5).map(|i| Emission::text("agent", format!("m{}", i))).collect(),
            ))
            .await;

        assert_eq!(outcome, RunOutcome::Completed { event_count: 3 });
        assert_eq!(store.read_snapshot(&job_id).await.unwrap().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn generator_failure_writes_error_marker() {
        let store = Arc::new(MemoryStateStore::new());
        let (adapter, job_id) = adapter(store.clone(), 100);

        let generator = StreamGenerator::new(stream::iter(vec![
            Ok(Emission::text("agent", "first")),
            Err(GeneratorError::Failed("model endpoint unreachable".to_string())),
            Ok(Emission::text("agent", "never")),
        ]));
        let outcome = adapter.run(Box::new(generator)).await;

        assert!(matches!(outcome, RunOutcome::Failed { event_count: 1, .. }));
        assert_eq!(store.read_snapshot(&job_id).await.unwrap().unwrap().len(), 1);
        let marker = store.read_error(&job_id).await.unwrap().unwrap();
        assert!(marker.message.contains("model endpoint unreachable"));
        assert!(store.read_completion(&job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pre_cancelled_run_consumes_nothing() {
        let store = Arc::new(MemoryStateStore::new());
        let job_id = JobId::generate();
        let token = CancellationToken::new();
        token.cancel();
        let adapter =
            StreamingAdapter::new(store.clone(), job_id.clone(), token, AdapterOptions::default());

        let outcome = adapter
            .run(scripted(vec![Emission::text("agent", "x")]))
            .await;

        assert_eq!(outcome, RunOutcome::Cancelled { event_count: 0 });
        assert!(store.read_completion(&job_id).await.unwrap().unwrap().cancelled);
    }

    #[tokio::test]
    async fn store_cancel_flag_stops_after_current_emission() {
        let store = Arc::new(MemoryStateStore::new());
        let (adapter, job_id) = adapter(store.clone(), 100);
        let (tx, generator) = channel(8);

        let run = tokio::spawn(adapter.run(Box::new(generator)));
        assert!(tx.send(Emission::text("agent", "one")).await);
        // Wait until the first event is durable before raising the flag.
        while store.read_snapshot(&job_id).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
        store.request_cancel(&job_id).await.unwrap();
        assert!(tx.send(Emission::text("agent", "two")).await);

        let outcome = run.await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { event_count: 2 });
        // The generator was closed, so further sends are rejected.
        assert!(!tx.send(Emission::text("agent", "three")).await);
    }

    #[tokio::test]
    async fn snapshot_failure_falls_back_to_error_marker() {
        let store = Arc::new(FailingStore::failing_snapshots());
        let (adapter, job_id) = adapter(store.clone(), 100);

        let outcome = adapter
            .run(scripted(vec![Emission::text("agent", "x")]))
            .await;

        match outcome {
            RunOutcome::Failed { message, .. } => assert!(message.contains("state store")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.inner.read_error(&job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn total_store_failure_abandons_the_job() {
        let store = Arc::new(FailingStore::failing_everything());
        let (adapter, _job_id) = adapter(store, 100);

        let outcome = adapter
            .run(scripted(vec![Emission::text("agent", "x")]))
            .await;

        assert!(matches!(outcome, RunOutcome::Abandoned { .. }));
        assert_eq!(outcome.status(), None);
    }
}
