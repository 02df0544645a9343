use thiserror::Error;

use loadstar_core::CoreError;
use loadstar_storage::StorageError;
use loadstar_tracker::StoreError;

use crate::loader::LoaderError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Ingest job {job_id} is already in progress. Only one concurrent ingest is allowed.")]
    JobActive { job_id: String },

    #[error("job not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
