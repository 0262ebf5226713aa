use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler loop is not running")]
    SchedulerStopped,

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Callback panicked: {0}")]
    Panicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobError>;
