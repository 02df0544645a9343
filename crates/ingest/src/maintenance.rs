//! Periodic background sweeps: stale-job resume and retention cleanup.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::service::IngestService;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Jobs moved from `processing` back to `pending`.
    pub resumed: Vec<String>,
    /// Expired terminal jobs deleted.
    pub removed: Vec<String>,
}

/// Run both sweeps once.
pub fn sweep_once(service: &IngestService) -> SweepReport {
    let report = SweepReport {
        resumed: service.resume_interrupted(),
        removed: service.clean_old_jobs(),
    };
    if !report.resumed.is_empty() || !report.removed.is_empty() {
        info!(
            resumed = report.resumed.len(),
            removed = report.removed.len(),
            "maintenance sweep finished"
        );
    }
    report
}

/// Run the sweeps forever, once per configured interval.
pub async fn run_maintenance(service: Arc<IngestService>) {
    let interval = service.config().sweep_interval();
    info!("maintenance loop started (interval: {}s)", interval.as_secs());

    loop {
        tokio::time::sleep(interval).await;
        sweep_once(&service);
    }
}
