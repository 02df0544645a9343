//! Job and item records persisted by the job store.
//!
//! Every mutation the pipeline performs is expressed as a method on
//! [`JobRecord`] so that a store transform is a plain fold over the snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Status enums ─────────────────────────────────────────────────────

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or processing. At most one such job exists at a time.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(CoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Per-item state. Moves forward only: pending, processing, then one settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    #[serde(alias = "completed")]
    Success,
    Skipped,
    Failed,
    Cancelled,
}

impl ItemStatus {
    fn rank(self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Processing => 1,
            _ => 2,
        }
    }

    pub fn is_settled(self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        next.rank() > self.rank()
    }
}

// ── Parameters & summary ─────────────────────────────────────────────

/// What a job runs: the ingestion pipeline or the synthetic workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Ingest,
    Synthetic,
}

/// Inputs of the request that created a job. Never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameters {
    pub bucket: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub kind: JobKind,
}

impl JobParameters {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
            recursive: false,
            year: None,
            collection_id: None,
            kind: JobKind::Ingest,
        }
    }

    /// Parameters of a synthetic job; `label` fills the bucket column.
    pub fn synthetic(label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Synthetic,
            ..Self::new(label, name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub total_files: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Percentage in 0..=100.
    pub progress: f64,
}

impl JobSummary {
    fn recompute_progress(&mut self) {
        self.progress = if self.total_files == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total_files as f64 * 100.0).min(100.0)
        };
    }
}

// ── Items ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Units reported by the loader (records in the file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_secs: Option<f64>,
}

impl ItemRecord {
    pub fn pending() -> Self {
        Self {
            status: ItemStatus::Pending,
            size_bytes: None,
            checksum: None,
            started_at: None,
            completed_at: None,
            error: None,
            item_count: None,
            reason: None,
            ingest_secs: None,
        }
    }

    /// True when this entry records a successful load of exactly this object version.
    pub fn is_success_for(&self, size_bytes: u64, checksum: &str) -> bool {
        self.status == ItemStatus::Success
            && self.size_bytes == Some(size_bytes)
            && self.checksum.as_deref() == Some(checksum)
    }
}

/// How an item settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Success { item_count: u64, ingest_secs: f64 },
    Skipped { reason: String },
    Failed { error: String },
    /// Terminated by a cancel request. Not counted as processed.
    Cancelled,
}

impl ItemOutcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            ItemOutcome::Success { .. } => ItemStatus::Success,
            ItemOutcome::Skipped { .. } => ItemStatus::Skipped,
            ItemOutcome::Failed { .. } => ItemStatus::Failed,
            ItemOutcome::Cancelled => ItemStatus::Cancelled,
        }
    }
}

// ── Job record ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub parameters: JobParameters,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: JobSummary,
    /// Keyed by object key, in discovery order.
    #[serde(default)]
    pub details: IndexMap<String, ItemRecord>,
}

impl JobRecord {
    /// Fresh pending record with a random identifier.
    pub fn new(parameters: JobParameters, now: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), parameters, now)
    }

    pub fn with_id(job_id: impl Into<String>, parameters: JobParameters, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.into(),
            parameters,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
            message: None,
            error: None,
            summary: JobSummary::default(),
            details: IndexMap::new(),
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.job_id.clone(),
            status: self.status,
            progress: self.summary.progress,
            created_at: self.created_at,
            updated_at: self.updated_at,
            message: self.message.clone(),
            error: self.error.clone(),
            summary: self.summary.clone(),
        }
    }

    pub fn listing(&self) -> JobListing {
        JobListing {
            job_id: self.job_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            status: self.status,
            bucket: self.parameters.bucket.clone(),
            path: self.parameters.path.clone(),
        }
    }

    /// Enter `processing` with a known amount of work. Counters carried over
    /// from an earlier interrupted run are kept.
    pub fn begin(&mut self, total_files: u64) {
        self.status = JobStatus::Processing;
        self.summary.total_files = total_files;
        self.summary.recompute_progress();
    }

    pub fn is_item_settled(&self, key: &str) -> bool {
        self.details.get(key).is_some_and(|item| item.status.is_settled())
    }

    /// Record object metadata for an item, creating it as pending if new.
    pub fn describe_item(&mut self, key: &str, size_bytes: u64, checksum: &str) {
        let item = self
            .details
            .entry(key.to_string())
            .or_insert_with(ItemRecord::pending);
        item.size_bytes = Some(size_bytes);
        item.checksum = Some(checksum.to_string());
    }

    /// Move an item to `processing`. Returns false if the item already left pending.
    pub fn begin_item(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let item = self
            .details
            .entry(key.to_string())
            .or_insert_with(ItemRecord::pending);
        if !item.status.can_transition_to(ItemStatus::Processing) {
            return false;
        }
        item.status = ItemStatus::Processing;
        item.started_at = Some(now);
        true
    }

    /// Settle an item and fold the outcome into the summary in one step.
    /// Returns false, leaving the record untouched, if the item was already settled.
    pub fn settle_item(&mut self, key: &str, outcome: ItemOutcome, now: DateTime<Utc>) -> bool {
        let item = self
            .details
            .entry(key.to_string())
            .or_insert_with(ItemRecord::pending);
        let next = outcome.status();
        if !item.status.can_transition_to(next) {
            return false;
        }
        item.status = next;
        item.completed_at = Some(now);

        let summary = &mut self.summary;
        match outcome {
            ItemOutcome::Success { item_count, ingest_secs } => {
                item.item_count = Some(item_count);
                item.ingest_secs = Some(ingest_secs);
                summary.processed += 1;
                summary.succeeded += 1;
            }
            ItemOutcome::Skipped { reason } => {
                item.reason = Some(reason);
                summary.processed += 1;
                summary.skipped += 1;
            }
            ItemOutcome::Failed { error } => {
                item.error = Some(error);
                summary.processed += 1;
                summary.failed += 1;
            }
            ItemOutcome::Cancelled => {}
        }
        summary.recompute_progress();
        true
    }

    /// Terminal success. Ignored if the job already reached another terminal state.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Completed;
        self.summary.progress = 100.0;
        self.completed_at = Some(now);
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        true
    }

    /// Returns false if the job already completed or failed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Failed => false,
            JobStatus::Cancelled => true,
            JobStatus::Pending | JobStatus::Processing => {
                self.status = JobStatus::Cancelled;
                self.cancelled_at = Some(now);
                true
            }
        }
    }

    /// Put an interrupted job back in the queue.
    pub fn requeue(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Pending;
        self.message = Some(message.into());
    }
}

// ── Projections ──────────────────────────────────────────────────────

/// Record without per-item details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: JobSummary,
}

/// One row of a job listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub bucket: String,
    pub path: String,
}

// ── Tests ────────────────────────────────────────────────────────────
