//! Per-job ingestion: discovery, then each object in order through
//! metadata, dedup, download and the external loader.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use loadstar_core::{collection, ItemOutcome, JobParameters, JobRecord, JobStatus};
use loadstar_storage::{discover, MetadataCache, ObjectSource};
use loadstar_tracker::{dedup, JobStore};

use crate::error::Result;
use crate::loader::{LoadKind, LoadOutcome, Loader};
use crate::registry::CancellationRegistry;

pub const DUPLICATE_REASON: &str = "Duplicate file - already ingested with same size and checksum";
pub const CANCELLED_ERROR: &str = "Job was cancelled during processing";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Scratch directory for downloads.
    pub tmp_dir: PathBuf,
    pub max_file_size_bytes: u64,
    /// Size of the loader pool; also the synthetic workload's concurrency cap.
    pub max_concurrent: usize,
}

/// How a job run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobEnd {
    Completed,
    Cancelled,
}

/// Removes the downloaded file on every exit path.
struct ScratchFile(PathBuf);

impl ScratchFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "failed to remove scratch file");
            }
        }
    }
}

/// Everything a job run needs. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Ingestor {
    pub(crate) store: Arc<JobStore>,
    pub(crate) source: Arc<dyn ObjectSource>,
    pub(crate) metadata: Arc<MetadataCache>,
    pub(crate) registry: Arc<CancellationRegistry>,
    pub(crate) loader: Arc<Loader>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) settings: Arc<PipelineSettings>,
}

impl Ingestor {
    /// Run an ingestion job to a terminal state. Jobs that already finished
    /// are left alone.
    pub async fn run(&self, job_id: &str) {
        let Some(record) = self.store.get(job_id) else {
            warn!(job_id = %job_id, "ingestion job not found");
            return;
        };
        if record.status.is_terminal() {
            info!(job_id = %job_id, status = %record.status, "job already finished; not running");
            return;
        }

        let token = self.registry.token(job_id);
        info!(
            job_id = %job_id,
            bucket = %record.parameters.bucket,
            path = %record.parameters.path,
            recursive = record.parameters.recursive,
            year = ?record.parameters.year,
            "ingestion job started"
        );

        let end = self.process(job_id, &record.parameters, &token).await;
        self.finish(job_id, end);
    }

    /// Fold the run result into the record and drop the job's registry entry.
    pub(crate) fn finish(&self, job_id: &str, end: Result<JobEnd>) {
        let now = Utc::now();
        let committed = match end {
            Ok(JobEnd::Completed) => self.store.try_update_if(job_id, now, |r| r.complete(now)),
            Ok(JobEnd::Cancelled) => self.store.try_update_if(job_id, now, |r| {
                let changed = r.cancel(now);
                if changed && r.error.is_none() {
                    r.error = Some(CANCELLED_ERROR.to_string());
                }
                changed
            }),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "ingestion job failed");
                let message = e.to_string();
                self.store.try_update_if(job_id, now, |r| r.fail(message, now))
            }
        };

        match committed {
            Ok(Some(record)) => log_final(&record),
            Ok(None) => {
                if let Some(record) = self.store.get(job_id) {
                    log_final(&record);
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to record job outcome"),
        }
        self.registry.release(job_id);
    }

    async fn process(&self, job_id: &str, params: &JobParameters, token: &CancellationToken) -> Result<JobEnd> {
        let naming = collection::naming_for(params.collection_id.as_deref())?;
        tokio::fs::create_dir_all(&self.settings.tmp_dir).await?;

        if self.mark_processing(job_id, |r| r.status = JobStatus::Processing)?.is_none() {
            return Ok(JobEnd::Cancelled);
        }

        let keys = discover(
            self.source.as_ref(),
            &params.bucket,
            &params.path,
            params.recursive,
            params.year,
            naming,
        )
        .await?;
        let total = keys.len() as u64;

        let Some(record) = self.mark_processing(job_id, |r| r.begin(total))? else {
            return Ok(JobEnd::Cancelled);
        };
        info!(job_id = %job_id, total_files = total, "files discovered");

        for key in keys {
            if self.is_cancelled(job_id, token) {
                return Ok(JobEnd::Cancelled);
            }
            if record.is_item_settled(&key) {
                debug!(job_id = %job_id, key = %key, "item settled in an earlier run");
                continue;
            }
            let outcome = self.process_item(job_id, &params.bucket, &key, token).await;
            self.settle(job_id, &key, outcome);
        }

        if self.is_cancelled(job_id, token) {
            Ok(JobEnd::Cancelled)
        } else {
            Ok(JobEnd::Completed)
        }
    }

    /// Apply `transform` only while the job is still active.
    pub(crate) fn mark_processing<F>(&self, job_id: &str, transform: F) -> Result<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord),
    {
        Ok(self.store.try_update_if(job_id, Utc::now(), |r| {
            if r.status.is_active() {
                transform(r);
                true
            } else {
                false
            }
        })?)
    }

    /// Cancel token fired, or the record was cancelled (possibly by another
    /// process) or removed.
    pub(crate) fn is_cancelled(&self, job_id: &str, token: &CancellationToken) -> bool {
        token.is_cancelled()
            || self
                .store
                .get(job_id)
                .map_or(true, |r| r.status == JobStatus::Cancelled)
    }

    async fn process_item(&self, job_id: &str, bucket: &str, key: &str, token: &CancellationToken) -> ItemOutcome {
        let metadata = match self.metadata.get(self.source.as_ref(), bucket, key).await {
            Ok(metadata) => metadata,
            Err(e) => return ItemOutcome::Failed { error: format!("metadata lookup failed: {e}") },
        };

        if dedup::was_already_ingested(&self.store, job_id, bucket, key, metadata.size_bytes, &metadata.checksum) {
            self.store
                .update(job_id, |r| r.describe_item(key, metadata.size_bytes, &metadata.checksum));
            return ItemOutcome::Skipped { reason: DUPLICATE_REASON.to_string() };
        }

        let now = Utc::now();
        self.store.update(job_id, |r| {
            r.describe_item(key, metadata.size_bytes, &metadata.checksum);
            r.begin_item(key, now);
        });

        let limit = self.settings.max_file_size_bytes;
        if metadata.size_bytes > limit {
            return ItemOutcome::Failed {
                error: format!("File too large: {} bytes exceeds the {} byte limit", metadata.size_bytes, limit),
            };
        }

        let scratch = ScratchFile(self.scratch_path(job_id, key));
        let downloaded = match self.source.download(bucket, key, scratch.path(), limit).await {
            Ok(downloaded) => downloaded,
            Err(e) => return ItemOutcome::Failed { error: format!("download failed: {e}") },
        };

        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return ItemOutcome::Failed { error: "loader pool closed".to_string() },
            },
            _ = token.cancelled() => return ItemOutcome::Cancelled,
        };
        if token.is_cancelled() {
            return ItemOutcome::Cancelled;
        }

        let started = Instant::now();
        match self.loader.run(LoadKind::Items, scratch.path(), &self.registry, job_id).await {
            Ok(LoadOutcome::Success { .. }) => ItemOutcome::Success {
                item_count: downloaded.lines,
                ingest_secs: started.elapsed().as_secs_f64(),
            },
            Ok(LoadOutcome::Failed { code, stderr }) => {
                let stderr = stderr.trim();
                let error = if stderr.is_empty() {
                    format!("loader exited with status {}", code.map_or("unknown".to_string(), |c| c.to_string()))
                } else {
                    stderr.to_string()
                };
                ItemOutcome::Failed { error }
            }
            Ok(LoadOutcome::Terminated) => ItemOutcome::Cancelled,
            Err(e) => ItemOutcome::Failed { error: e.to_string() },
        }
    }

    fn scratch_path(&self, job_id: &str, key: &str) -> PathBuf {
        let basename = key.rsplit('/').next().unwrap_or(key);
        self.settings.tmp_dir.join(format!("{job_id}_{basename}"))
    }

    pub(crate) fn settle(&self, job_id: &str, key: &str, outcome: ItemOutcome) {
        match &outcome {
            ItemOutcome::Success { item_count, ingest_secs } => {
                info!(job_id = %job_id, key = %key, item_count, ingest_secs, "item ingested")
            }
            ItemOutcome::Skipped { reason } => info!(job_id = %job_id, key = %key, reason = %reason, "item skipped"),
            ItemOutcome::Failed { error } => warn!(job_id = %job_id, key = %key, error = %error, "item failed"),
            ItemOutcome::Cancelled => info!(job_id = %job_id, key = %key, "item cancelled"),
        }
        let now = Utc::now();
        self.store.update(job_id, |r| {
            r.settle_item(key, outcome, now);
        });
    }
}

fn log_final(record: &JobRecord) {
    let s = &record.summary;
    info!(
        job_id = %record.job_id,
        status = %record.status,
        total_files = s.total_files,
        processed = s.processed,
        succeeded = s.succeeded,
        failed = s.failed,
        skipped = s.skipped,
        "ingestion job finished"
    );
}
