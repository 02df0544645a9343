use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job record {job_id} is unreadable: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("ingest job {job_id} is already in progress")]
    JobActive { job_id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
