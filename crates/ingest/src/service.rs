//! The trigger-facing facade. Owns every process-wide registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use loadstar_core::config::{IngestConfig, LoaderConfig};
use loadstar_core::{collection, Config, JobKind, JobListing, JobParameters, JobRecord, JobStatus};
use loadstar_storage::{MetadataCache, ObjectSource, ObjectStoreSource};
use loadstar_tracker::{JobQuery, JobRead, JobStore, StoreError};

use crate::error::{IngestError, Result};
use crate::loader::Loader;
use crate::pipeline::{Ingestor, PipelineSettings};
use crate::registry::CancellationRegistry;
use crate::synthetic::{SyntheticPlan, SYNTHETIC_BUCKET};

/// One page of the job listing plus the size of the filtered set.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub jobs: Vec<JobListing>,
}

pub struct IngestService {
    ingestor: Ingestor,
    config: IngestConfig,
}

impl IngestService {
    /// Build the service from environment configuration: S3 (or a local
    /// root when `OBJECT_STORE_ROOT` is set) and the configured loader.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = JobStore::open(config.storage.jobs_dir(), config.ingest.jobs_page_size as usize)?;
        let source = ObjectStoreSource::new(config.aws.clone(), config.ingest.download_chunk_bytes());
        Ok(Self::new(
            store,
            Arc::new(source),
            config.loader.clone(),
            config.storage.tmp_dir.clone(),
            config.ingest.clone(),
        ))
    }

    pub fn new(
        store: JobStore,
        source: Arc<dyn ObjectSource>,
        loader: LoaderConfig,
        tmp_dir: PathBuf,
        config: IngestConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent_files.max(1) as usize;
        let ingestor = Ingestor {
            store: Arc::new(store),
            source,
            metadata: Arc::new(MetadataCache::new(config.metadata_cache_ttl())),
            registry: Arc::new(CancellationRegistry::new(config.cancel_grace())),
            loader: Arc::new(Loader::new(loader)),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            settings: Arc::new(PipelineSettings {
                tmp_dir,
                max_file_size_bytes: config.max_file_size_bytes(),
                max_concurrent,
            }),
        };
        Self { ingestor, config }
    }

    pub fn store(&self) -> &JobStore {
        &self.ingestor.store
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.ingestor.registry
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    /// Create a pending job, unless another job is pending or processing.
    pub fn create_job(&self, parameters: JobParameters) -> Result<String> {
        if parameters.kind == JobKind::Ingest {
            collection::naming_for(parameters.collection_id.as_deref())?;
        }
        self.store().create_if_idle(parameters).map_err(|e| match e {
            StoreError::JobActive { job_id } => IngestError::JobActive { job_id },
            other => other.into(),
        })
    }

    /// Create a job and run the pipeline for it in the background.
    pub fn start_ingest(&self, parameters: JobParameters) -> Result<(String, JoinHandle<()>)> {
        let job_id = self.create_job(parameters)?;
        let ingestor = self.ingestor.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move { ingestor.run(&id).await });
        Ok((job_id, handle))
    }

    /// Create a synthetic job and run it in the background. Per-task delays
    /// come from the configured synthetic bounds.
    pub fn start_synthetic(&self, name: &str, tasks: u32, concurrency: u32) -> Result<(String, JoinHandle<()>)> {
        let plan = SyntheticPlan {
            tasks,
            concurrency,
            min_delay: Duration::from_secs(self.config.synthetic_min_secs),
            max_delay: Duration::from_secs(self.config.synthetic_max_secs),
        };
        self.start_synthetic_plan(name, plan)
    }

    pub fn start_synthetic_plan(&self, name: &str, plan: SyntheticPlan) -> Result<(String, JoinHandle<()>)> {
        let job_id = self.create_job(JobParameters::synthetic(SYNTHETIC_BUCKET, name))?;
        let ingestor = self.ingestor.clone();
        let id = job_id.clone();
        let handle = tokio::spawn(async move { ingestor.run_synthetic(&id, plan).await });
        Ok((job_id, handle))
    }

    pub fn has_active_job(&self) -> Option<JobRecord> {
        self.store().has_active()
    }

    pub fn get_job(&self, job_id: &str, detailed: bool) -> Result<JobRead> {
        self.store()
            .read(job_id, detailed)
            .ok_or_else(|| IngestError::NotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, query: &JobQuery) -> JobPage {
        let (total, jobs) = self.store().list_with_total(query);
        JobPage {
            total,
            page: query.page,
            page_size: self.store().page_size(),
            jobs,
        }
    }

    /// Mark the job cancelled, then stop its in-flight loader processes.
    /// False if the job is unknown or already completed or failed.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        if !self.store().cancel(job_id) {
            return false;
        }
        let signalled = self.registry().cancel_all(job_id).await;
        info!(job_id = %job_id, processes = signalled, "cancel request handled");
        true
    }

    // ── Sweeps ───────────────────────────────────────────────────────

    pub fn resume_interrupted(&self) -> Vec<String> {
        self.store().resume_interrupted(Utc::now(), self.config.stale_after())
    }

    pub fn clean_old_jobs(&self) -> Vec<String> {
        self.store().clean_old_jobs(Utc::now(), self.config.retention())
    }

    /// Run every pending job through the pipeline, oldest first and one at a
    /// time. Synthetic jobs keep no plan on disk and are failed instead.
    /// Returns the ids that were run.
    pub async fn resume_pending(&self) -> Vec<String> {
        let mut pending: Vec<JobRecord> = self
            .store()
            .records()
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));

        let mut resumed = Vec::new();
        for job in pending {
            if job.parameters.kind == JobKind::Synthetic {
                warn!(job_id = %job.job_id, "synthetic job cannot be resumed; failing it");
                let now = Utc::now();
                if let Err(e) = self.store().try_update_if(&job.job_id, now, |r| {
                    r.status == JobStatus::Pending && r.fail("Synthetic jobs cannot be resumed", now)
                }) {
                    error!(job_id = %job.job_id, error = %e, "failed to fail synthetic job");
                }
                continue;
            }
            info!(job_id = %job.job_id, "resuming pending job");
            self.ingestor.run(&job.job_id).await;
            resumed.push(job.job_id);
        }
        resumed
    }
}
