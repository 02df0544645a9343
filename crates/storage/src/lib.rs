pub mod backend;
pub mod cache;
pub mod discovery;
pub mod error;
pub mod source;

pub use backend::ObjectStoreSource;
pub use cache::MetadataCache;
pub use discovery::discover;
pub use error::StorageError;
pub use source::{DownloadedFile, ObjectMetadata, ObjectSource};
