//! Durable job tracking: one JSON record per job, committed atomically.

pub mod dedup;
pub mod error;
mod lock;
pub mod query;
pub mod store;
pub mod sweep;

pub use error::StoreError;
pub use query::{JobQuery, SortKey, SortOrder, StatusFilter};
pub use store::{JobRead, JobStore};
