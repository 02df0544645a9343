pub mod collection;
pub mod config;
pub mod error;
pub mod job;

pub use collection::{CollectionConfig, IngestionType, NamingConvention};
pub use config::Config;
pub use error::*;
pub use job::*;
