pub mod error;
pub mod loader;
pub mod maintenance;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod synthetic;

pub use error::IngestError;
pub use loader::{LoadKind, LoadOutcome, Loader, LoaderError};
pub use maintenance::{run_maintenance, sweep_once, SweepReport};
pub use pipeline::{Ingestor, PipelineSettings, CANCELLED_ERROR, DUPLICATE_REASON};
pub use registry::CancellationRegistry;
pub use service::{IngestService, JobPage};
pub use synthetic::{SyntheticPlan, SYNTHETIC_BUCKET};
