//! File-backed state store.
//!
//! Layout of a slot directory:
//!
//! ```text
//! <slot>/current/job.json          controller's job record
//! <slot>/current/snapshot.json     full event list
//! <slot>/current/completion.json   completion marker
//! <slot>/current/error.json        error marker
//! <slot>/current/cancel.json       cancellation control flag
//! ```
//!
//! Every file is written to a uniquely named temporary file in the same
//! directory and renamed over the canonical name, so a reader opening the
//! canonical path always gets a complete document. `clear` renames the whole
//! `current/` directory away in one step before deleting it.
//!
//! Check-and-write operations (markers, the conditional job update, `clear`)
//! hold an exclusive lock on `<slot>/slot.lock`, which also excludes other
//! processes that opened the same slot.

use super::{
    CancelRequest, CompletionMarker, ErrorMarker, MarkerKind, Snapshot, StateStore,
};
use crate::error::{JobError, JobResult};
use crate::events::Event;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use uuid::Uuid;

const CURRENT_DIR: &str = "current";
const JOB_FILE: &str = "job.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const COMPLETION_FILE: &str = "completion.json";
const ERROR_FILE: &str = "error.json";
const CANCEL_FILE: &str = "cancel.json";
const LOCK_FILE: &str = "slot.lock";

#[derive(Clone)]
pub struct FsStateStore {
    slot_dir: PathBuf,
}

impl FsStateStore {
    /// Open (creating if needed) the slot rooted at `slot_dir`.
    pub fn open(slot_dir: impl Into<PathBuf>) -> JobResult<Self> {
        let slot_dir = slot_dir.into();
        fs::create_dir_all(&slot_dir)?;
        Ok(Self { slot_dir })
    }

    /// Slot `name` under `<data_dir>/slots/`.
    pub fn open_slot(data_dir: &Path, name: &str) -> JobResult<Self> {
        validate_slot_name(name)?;
        Self::open(data_dir.join("slots").join(name))
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    fn current_dir(&self) -> PathBuf {
        self.slot_dir.join(CURRENT_DIR)
    }

    async fn blocking<T, F>(&self, f: F) -> JobResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Layout) -> JobResult<T> + Send + 'static,
    {
        let layout = Layout {
            slot_dir: self.slot_dir.clone(),
            current: self.current_dir(),
        };
        tokio::task::spawn_blocking(move || f(&layout)).await?
    }
}

fn validate_slot_name(name: &str) -> JobResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidOperation(format!(
            "invalid slot name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

/// Paths handed to blocking closures.
struct Layout {
    slot_dir: PathBuf,
    current: PathBuf,
}

impl Layout {
    fn path(&self, file: &str) -> PathBuf {
        self.current.join(file)
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> JobResult<()> {
        fs::create_dir_all(&self.current)?;
        write_json_atomic(&self.path(file), value)
    }

    fn read<T: DeserializeOwned>(&self, file: &str) -> JobResult<Option<T>> {
        read_json(&self.path(file))
    }

    fn lock(&self) -> JobResult<fs::File> {
        lock_exclusive(&self.slot_dir.join(LOCK_FILE))
    }
}

/// Open `path` (creating it) and take an exclusive advisory lock on it. The
/// lock is released when the returned handle is dropped.
pub(crate) fn lock_exclusive(path: &Path) -> JobResult<fs::File> {
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.lock()?;
    Ok(file)
}

/// Write `value` as JSON to `path` via a temp file in the same directory and
/// an atomic rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> JobResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| JobError::StoreIo(format!("no parent directory for {}", path.display())))?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| JobError::StoreIo(format!("failed to replace {}: {}", path.display(), e)))?;
    Ok(())
}

/// Read a JSON document; a missing file is `None`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> JobResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn conflict(job_id: &JobId, existing: MarkerKind) -> JobError {
    JobError::ConflictingMarker {
        job_id: job_id.to_string(),
        existing: existing.as_str().to_string(),
    }
}

fn for_job<T, F>(record: Option<T>, job_id: &JobId, id_of: F) -> Option<T>
where
    F: Fn(&T) -> &JobId,
{
    record.filter(|r| id_of(r) == job_id)
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn write_snapshot(&self, job_id: &JobId, events: &[Event]) -> JobResult<()> {
        let snapshot = Snapshot {
            job_id: job_id.clone(),
            events: events.to_vec(),
            written_at: OffsetDateTime::now_utc(),
        };
        self.blocking(move |layout| layout.write(SNAPSHOT_FILE, &snapshot))
            .await
    }

    async fn read_snapshot(&self, job_id: &JobId) -> JobResult<Option<Vec<Event>>> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let snapshot: Option<Snapshot> = layout.read(SNAPSHOT_FILE)?;
            Ok(for_job(snapshot, &job_id, |s| &s.job_id).map(|s| s.events))
        })
        .await
    }

    async fn write_completion(
        &self,
        job_id: &JobId,
        event_count: usize,
        cancelled: bool,
    ) -> JobResult<()> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            let error: Option<ErrorMarker> = layout.read(ERROR_FILE)?;
            if for_job(error, &job_id, |m| &m.job_id).is_some() {
                return Err(conflict(&job_id, MarkerKind::Error));
            }
            let existing: Option<CompletionMarker> = layout.read(COMPLETION_FILE)?;
            if for_job(existing, &job_id, |m| &m.job_id).is_some() {
                debug!("completion marker for {} already written", job_id);
                return Ok(());
            }
            layout.write(
                COMPLETION_FILE,
                &CompletionMarker {
                    job_id,
                    event_count,
                    cancelled,
                    written_at: OffsetDateTime::now_utc(),
                },
            )
        })
        .await
    }

    async fn write_error(&self, job_id: &JobId, message: &str) -> JobResult<()> {
        let job_id = job_id.clone();
        let message = message.to_string();
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            let completion: Option<CompletionMarker> = layout.read(COMPLETION_FILE)?;
            if for_job(completion, &job_id, |m| &m.job_id).is_some() {
                return Err(conflict(&job_id, MarkerKind::Completion));
            }
            let existing: Option<ErrorMarker> = layout.read(ERROR_FILE)?;
            if for_job(existing, &job_id, |m| &m.job_id).is_some() {
                debug!("error marker for {} already written", job_id);
                return Ok(());
            }
            layout.write(
                ERROR_FILE,
                &ErrorMarker {
                    job_id,
                    message,
                    written_at: OffsetDateTime::now_utc(),
                },
            )
        })
        .await
    }

    async fn read_completion(&self, job_id: &JobId) -> JobResult<Option<CompletionMarker>> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let marker = layout.read(COMPLETION_FILE)?;
            Ok(for_job(marker, &job_id, |m: &CompletionMarker| &m.job_id))
        })
        .await
    }

    async fn read_error(&self, job_id: &JobId) -> JobResult<Option<ErrorMarker>> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let marker = layout.read(ERROR_FILE)?;
            Ok(for_job(marker, &job_id, |m: &ErrorMarker| &m.job_id))
        })
        .await
    }

    async fn request_cancel(&self, job_id: &JobId) -> JobResult<()> {
        let request = CancelRequest {
            job_id: job_id.clone(),
            requested_at: OffsetDateTime::now_utc(),
        };
        self.blocking(move |layout| layout.write(CANCEL_FILE, &request))
            .await
    }

    async fn cancel_requested(&self, job_id: &JobId) -> JobResult<bool> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let request = layout.read(CANCEL_FILE)?;
            Ok(for_job(request, &job_id, |r: &CancelRequest| &r.job_id).is_some())
        })
        .await
    }

    async fn write_job(&self, job: &Job) -> JobResult<()> {
        let job = job.clone();
        self.blocking(move |layout| layout.write(JOB_FILE, &job)).await
    }

    async fn update_job(&self, job: &Job) -> JobResult<bool> {
        let job = job.clone();
        self.blocking(move |layout| {
            let _lock = layout.lock()?;
            let current: Option<Job> = layout.read(JOB_FILE)?;
            if current.is_none_or(|current| current.id != job.id) {
                return Ok(false);
            }
            layout.write(JOB_FILE, &job)?;
            Ok(true)
        })
        .await
    }

    async fn read_job(&self) -> JobResult<Option<Job>> {
        self.blocking(|layout| layout.read(JOB_FILE)).await
    }

    async fn clear(&self) -> JobResult<()> {
        self.blocking(|layout| {
            let _lock = layout.lock()?;
            let trash = layout
                .slot_dir
                .join(format!(".trash-{}", Uuid::new_v4().simple()));
            match fs::rename(&layout.current, &trash) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = fs::remove_dir_all(&trash) {
                warn!("failed to remove cleared slot state {}: {}", trash.display(), e);
            }
            Ok(())
        })
        .await
    }

    async fn last_activity(&self, job_id: &JobId) -> JobResult<Option<OffsetDateTime>> {
        let job_id = job_id.clone();
        self.blocking(move |layout| {
            let job: Option<Job> = layout.read(JOB_FILE)?;
            let snapshot: Option<Snapshot> = layout.read(SNAPSHOT_FILE)?;
            let completion: Option<CompletionMarker> = layout.read(COMPLETION_FILE)?;
            let error: Option<ErrorMarker> = layout.read(ERROR_FILE)?;

            let job_times = for_job(job, &job_id, |j| &j.id)
                .map(|j| j.finished_at.unwrap_or(j.started_at));
            let times = [
                job_times,
                for_job(snapshot, &job_id, |s| &s.job_id).map(|s| s.written_at),
                for_job(completion, &job_id, |m| &m.job_id).map(|m| m.written_at),
                for_job(error, &job_id, |m| &m.job_id).map(|m| m.written_at),
            ];
            Ok(times.into_iter().flatten().max())
        })
        .await
    }
}
