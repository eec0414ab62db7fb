//! Bounded log of finished runs.
//!
//! A record is keyed by `(job_id, started_at)`, so archiving the same
//! terminal job any number of times leaves exactly one record. The oldest
//! records are evicted once the archive grows past its capacity.

use crate::error::JobResult;
use crate::events::Event;
use crate::job::{JobId, JobStatus};
use crate::store::fs::{lock_exclusive, read_json, write_json_atomic};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 50;

/// Characters of the task description kept in a record.
const DESCRIPTION_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub job_id: JobId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub task_description: String,
    pub duration_ms: u64,
    pub event_count: usize,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub events: Vec<Event>,
}

impl HistoryRecord {
    pub fn new(
        job_id: JobId,
        started_at: OffsetDateTime,
        task_description: &str,
        duration: Duration,
        status: JobStatus,
        events: Vec<Event>,
    ) -> Self {
        Self {
            job_id,
            started_at,
            task_description: truncate_description(task_description),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            event_count: events.len(),
            status,
            error_message: None,
            events,
        }
    }

    pub fn with_error_message(mut self, message: Option<String>) -> Self {
        self.error_message = message;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    fn same_run(&self, other: &HistoryRecord) -> bool {
        self.job_id == other.job_id && self.started_at == other.started_at
    }

    fn matches(&self, needle: &str) -> bool {
        self.task_description.to_lowercase().contains(needle)
            || self
                .events
                .iter()
                .any(|e| e.payload.as_text().to_lowercase().contains(needle))
    }
}

fn truncate_description(task: &str) -> String {
    let task = task.trim();
    if task.chars().count() > DESCRIPTION_LIMIT {
        let head: String = task.chars().take(DESCRIPTION_LIMIT).collect();
        format!("{}...", head)
    } else {
        task.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub total_runs: usize,
    pub total_events: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub latest_run: Option<OffsetDateTime>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ArchiveFile {
    #[serde(default)]
    records: Vec<HistoryRecord>,
}

enum Backing {
    Memory(Vec<HistoryRecord>),
    /// Re-read on every operation. Updates hold an exclusive lock on the
    /// sidecar `<file>.lock`, so several processes can share one archive.
    File(PathBuf),
}

pub struct HistoryArchive {
    backing: Mutex<Backing>,
    capacity: usize,
}

impl HistoryArchive {
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            backing: Mutex::new(Backing::Memory(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Archive persisted as a JSON document at `path`. The parent directory
    /// is created if needed; the file itself appears on first write.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> JobResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            backing: Mutex::new(Backing::File(path)),
            capacity: capacity.max(1),
        })
    }

    /// Append `record` unless a record for the same run already exists.
    /// Returns whether a record was added.
    pub async fn archive_if_new(&self, record: HistoryRecord) -> JobResult<bool> {
        let capacity = self.capacity;
        self.update(move |records| {
            if records.iter().any(|r| r.same_run(&record)) {
                return false;
            }

            info!(
                "archiving job {} ({}, {} events)",
                record.job_id, record.status, record.event_count
            );
            records.push(record);
            if records.len() > capacity {
                let evicted = records.len() - capacity;
                records.drain(..evicted);
                debug!("evicted {} archived run(s)", evicted);
            }
            true
        })
        .await
    }

    /// All records, newest first.
    pub async fn list(&self) -> JobResult<Vec<HistoryRecord>> {
        let backing = self.backing.lock().await;
        let mut records = load(&backing).await?;
        records.reverse();
        Ok(records)
    }

    pub async fn get(&self, job_id: &JobId) -> JobResult<Option<HistoryRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| &r.job_id == job_id))
    }

    /// Case-insensitive match over descriptions and event payloads, newest
    /// first. A blank query matches nothing.
    pub async fn search(&self, query: &str) -> JobResult<Vec<HistoryRecord>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.matches(&needle))
            .collect())
    }

    /// Remove every record for `job_id`. Returns whether anything was removed.
    pub async fn delete(&self, job_id: &JobId) -> JobResult<bool> {
        let job_id = job_id.clone();
        self.update(move |records| {
            let before = records.len();
            records.retain(|r| r.job_id != job_id);
            records.len() != before
        })
        .await
    }

    /// Apply `change` to the records and persist them when it reports a
    /// modification. The file variant reloads and replaces under the lock.
    async fn update<F>(&self, change: F) -> JobResult<bool>
    where
        F: FnOnce(&mut Vec<HistoryRecord>) -> bool + Send + 'static,
    {
        let mut backing = self.backing.lock().await;
        match &mut *backing {
            Backing::Memory(records) => Ok(change(records)),
            Backing::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || -> JobResult<bool> {
                    let _lock = lock_exclusive(&lock_path(&path))?;
                    let mut records = read_json::<ArchiveFile>(&path)?
                        .unwrap_or_default()
                        .records;
                    let changed = change(&mut records);
                    if changed {
                        write_json_atomic(&path, &ArchiveFile { records })?;
                    }
                    Ok(changed)
                })
                .await?
            }
        }
    }

    pub async fn stats(&self) -> JobResult<ArchiveStats> {
        let backing = self.backing.lock().await;
        let records = load(&backing).await?;
        let mut stats = ArchiveStats {
            total_runs: records.len(),
            ..Default::default()
        };
        for record in &records {
            stats.total_events += record.event_count;
            match record.status {
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Error => stats.failed += 1,
                JobStatus::Idle | JobStatus::Running => {}
            }
            if stats.latest_run.is_none_or(|t| record.started_at > t) {
                stats.latest_run = Some(record.started_at);
            }
        }
        Ok(stats)
    }
}

async fn load(backing: &Backing) -> JobResult<Vec<HistoryRecord>> {
    match backing {
        Backing::Memory(records) => Ok(records.clone()),
        Backing::File(path) => {
            let path = path.clone();
            let file: Option<ArchiveFile> =
                tokio::task::spawn_blocking(move || read_json::<ArchiveFile>(&path)).await??;
            Ok(file.unwrap_or_default().records)
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Emission;

    fn record(job: &str, task: &str, payloads: &[&str]) -> HistoryRecord {
        let events = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| Event::from_emission(i as u64, Emission::text("agent", *p)))
            .collect();
        HistoryRecord::new(
            JobId::from(job),
            OffsetDateTime::now_utc(),
            task,
            Duration::from_secs(3),
            JobStatus::Completed,
            events,
        )
    }

    #[tokio::test]
    async fn repeated_archiving_keeps_one_record() {
        let archive = HistoryArchive::in_memory(DEFAULT_CAPACITY);
        let rec = record("job-1", "task", &["a"]);

        assert!(archive.archive_if_new(rec.clone()).await.unwrap());
        assert!(!archive.archive_if_new(rec.clone()).await.unwrap());
        assert!(!archive.archive_if_new(rec).await.unwrap());
        assert_eq!(archive.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_job_with_new_start_time_is_a_new_run() {
        let archive = HistoryArchive::in_memory(DEFAULT_CAPACITY);
        let first = record("job-1", "task", &["a"]);
        let mut second = first.clone();
        second.started_at += time::Duration::seconds(1);

        assert!(archive.archive_if_new(first).await.unwrap());
        assert!(archive.archive_if_new(second).await.unwrap());
        assert_eq!(archive.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn oldest_records_are_evicted() {
        let archive = HistoryArchive::in_memory(2);
        for job in ["a", "b", "c"] {
            archive.archive_if_new(record(job, job, &[])).await.unwrap();
        }
        let ids: Vec<String> = archive
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.job_id.to_string())
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn long_descriptions_are_truncated() {
        let long = "x".repeat(80);
        let rec = record("job", &long, &[]);
        assert_eq!(rec.task_description, format!("{}...", "x".repeat(50)));
        assert_eq!(record("job", "short task", &[]).task_description, "short task");
        // Character based, not byte based.
        let accented = "é".repeat(60);
        assert_eq!(record("job", &accented, &[]).task_description.chars().count(), 53);
    }

    #[tokio::test]
    async fn search_delete_and_stats() {
        let archive = HistoryArchive::in_memory(DEFAULT_CAPACITY);
        archive
            .archive_if_new(record("one", "Quarterly sales", &["revenue up"]))
            .await
            .unwrap();
        archive
            .archive_if_new(
                record("two", "Weather report", &["rain"])
                    .with_error_message(Some("boom".to_string())),
            )
            .await
            .unwrap();

        let hits = archive.search("REVENUE").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].job_id, JobId::from("one"));
        assert_eq!(archive.search("weather").await.unwrap().len(), 1);
        assert!(archive.search("  ").await.unwrap().is_empty());

        let stats = archive.stats().await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.completed, 2);
        assert!(stats.latest_run.is_some());

        assert!(archive.delete(&JobId::from("one")).await.unwrap());
        assert!(!archive.delete(&JobId::from("one")).await.unwrap());
        assert!(archive.get(&JobId::from("one")).await.unwrap().is_none());
        assert_eq!(
            archive
                .get(&JobId::from("two"))
                .await
                .unwrap()
                .unwrap()
                .error_message
                .as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn file_archive_is_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("runs.json");

        let writer = HistoryArchive::open(&path, DEFAULT_CAPACITY).unwrap();
        let reader = HistoryArchive::open(&path, DEFAULT_CAPACITY).unwrap();
        assert!(reader.list().await.unwrap().is_empty());

        writer
            .archive_if_new(record("job-1", "task", &["a", "b"]))
            .await
            .unwrap();
        let records = reader.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_count, 2);
        assert!(
            !reader
                .archive_if_new(records[0].clone())
                .await
                .unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_handles_never_drop_each_others_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut tasks = Vec::new();
        for handle in ["left", "right"] {
            let archive = HistoryArchive::open(&path, 100).unwrap();
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    let job = format!("{handle}-{i}");
                    archive
                        .archive_if_new(record(&job, "task", &["a"]))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let archive = HistoryArchive::open(&path, 100).unwrap();
        assert_eq!(archive.list().await.unwrap().len(), 40);
        assert_eq!(archive.stats().await.unwrap().total_runs, 40);
    }
}
