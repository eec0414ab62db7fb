//! Run a long, multi-step generative task in the background and let any
//! number of clients follow its progress by polling a durable state slot.
//!
//! The [`controller::JobController`] starts one job per slot on a detached
//! worker. The worker's [`adapter::StreamingAdapter`] persists the full event
//! list after every emission and finishes with exactly one marker. A
//! [`poll::PollingClient`] merges those records into a [`poll::ClientView`]
//! and files terminal runs into the [`archive::HistoryArchive`].

pub mod adapter;
pub mod archive;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod generator;
pub mod job;
pub mod poll;
pub mod store;

#[cfg(test)]
pub mod test_utils;

pub use adapter::{AdapterOptions, RunOutcome, StreamingAdapter};
pub use archive::{ArchiveStats, HistoryArchive, HistoryRecord};
pub use controller::{ControllerOptions, JobController, SpawnMode};
pub use error::{GeneratorError, JobError, JobResult};
pub use events::{Emission, Event, Payload};
pub use generator::{EventGenerator, GeneratorFactory, TaskRequest};
pub use job::{Job, JobId, JobParams, JobStatus};
pub use poll::{ClientView, JobWatcher, PollingClient, WatchOutcome};
pub use store::{FsStateStore, MemoryStateStore, StateStore};
