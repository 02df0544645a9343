use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown job status: {0}")]
    InvalidStatus(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("{0}")]
    Other(String),
}
