//! Error types for job, store and generator operations

use thiserror::Error;

/// Errors surfaced by the job controller, the state store and the adapter.
#[derive(Debug, Error)]
pub enum JobError {
    /// A job is already running in the target slot.
    #[error("a job is already running in this slot: {job_id}")]
    AlreadyRunning { job_id: String },

    /// Both a completion and an error marker were written for one job.
    #[error("conflicting marker for job {job_id}: {existing} marker already present")]
    ConflictingMarker { job_id: String, existing: String },

    /// The producer failed; recorded as the error marker message.
    #[error("generator failure: {0}")]
    GeneratorFailure(String),

    /// Reading or writing durable storage failed.
    #[error("store I/O failure: {0}")]
    StoreIo(String),

    /// Encoding or decoding a persisted record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Convenience type alias for Result with JobError
pub type JobResult<T> = Result<T, JobError>;

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::StoreIo(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::StoreIo(format!("blocking store task failed: {}", err))
    }
}

/// Failure raised by an event generator while producing emissions.
#[derive(Debug, Clone, Error)]
pub enum GeneratorError {
    #[error("failed to start generator: {0}")]
    Start(String),

    #[error("{0}")]
    Failed(String),

    #[error("generator exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("generator I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GeneratorError {
    fn from(err: std::io::Error) -> Self {
        GeneratorError::Io(err.to_string())
    }
}

impl From<GeneratorError> for JobError {
    fn from(err: GeneratorError) -> Self {
        JobError::GeneratorFailure(err.to_string())
    }
}
