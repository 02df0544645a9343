//! File-per-job store with two-tier locking.
//!
//! Each job lives in `{jobs_dir}/{job_id}.json`. A commit writes a hidden
//! temp file and renames it over the record, so readers see either the old
//! or the new snapshot. Writers to one job are serialized by that job's
//! re-entrant lock; a process-wide re-entrant lock guards the lock table and
//! every operation that enumerates all jobs. The global lock is never held
//! while waiting for a job lock.
//!
//! Several processes may share one jobs directory. Inside the in-process
//! locks each writer also holds an advisory file lock: `.{job_id}.lock` for
//! a job's read-modify-write cycle and `.create-lock` for single-flight
//! creation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::ReentrantMutex;
use serde::Serialize;
use tracing::{error, info, warn};

use loadstar_core::{JobListing, JobParameters, JobRecord, JobView};

use crate::error::{Result, StoreError};
use crate::lock::FileLock;
use crate::query::{JobQuery, StatusFilter};

const CREATE_LOCK_FILE: &str = ".create-lock";

/// Nesting depth of this process's holders of one job, and the file lock
/// kept while the depth is non-zero.
#[derive(Default)]
struct Held {
    depth: usize,
    file: Option<FileLock>,
}

type JobLock = Arc<ReentrantMutex<RefCell<Held>>>;

struct Release<'a>(&'a RefCell<Held>);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut held = self.0.borrow_mut();
        held.depth -= 1;
        if held.depth == 0 {
            held.file = None;
        }
    }
}

/// Result of [`JobStore::read`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobRead {
    Summary(JobView),
    Detailed(JobRecord),
}

pub struct JobStore {
    jobs_dir: PathBuf,
    page_size: usize,
    locks: ReentrantMutex<RefCell<HashMap<String, JobLock>>>,
}

impl JobStore {
    /// Open (and create if needed) a store rooted at `jobs_dir`.
    pub fn open(jobs_dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir)?;
        info!(path = %jobs_dir.display(), "job store opened");
        Ok(Self {
            jobs_dir,
            page_size: page_size.max(1),
            locks: ReentrantMutex::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    // ── Create ───────────────────────────────────────────────────────

    pub fn create(&self, parameters: JobParameters) -> Result<String> {
        self.create_at(parameters, Utc::now())
    }

    /// Persist a fresh pending record stamped with `now`.
    pub fn create_at(&self, parameters: JobParameters, now: DateTime<Utc>) -> Result<String> {
        let record = JobRecord::new(parameters, now);
        self.write_record(&record)?;
        info!(
            job_id = %record.job_id,
            bucket = %record.parameters.bucket,
            path = %record.parameters.path,
            "job created"
        );
        Ok(record.job_id)
    }

    /// Create a job unless another one is pending or processing.
    ///
    /// The check and the write happen under the global lock and the
    /// directory's create lock, so two callers cannot both succeed even from
    /// different processes.
    pub fn create_if_idle(&self, parameters: JobParameters) -> Result<String> {
        let _global = self.locks.lock();
        let _create = FileLock::acquire(&self.jobs_dir.join(CREATE_LOCK_FILE))?;
        if let Some(active) = self.has_active() {
            warn!(active_job = %active.job_id, "rejecting job: another job is active");
            return Err(StoreError::JobActive { job_id: active.job_id });
        }
        self.create(parameters)
    }

    // ── Update ───────────────────────────────────────────────────────

    /// Apply `transform` and commit. Returns false (logged) if the job is
    /// missing or the commit failed; the previous snapshot then stays in place.
    pub fn update<F>(&self, job_id: &str, transform: F) -> bool
    where
        F: FnOnce(&mut JobRecord),
    {
        match self.try_update(job_id, transform) {
            Ok(_) => true,
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %job_id, "update skipped: job not found");
                false
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to update job");
                false
            }
        }
    }

    pub fn try_update<F>(&self, job_id: &str, transform: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        self.try_update_at(job_id, Utc::now(), transform)
    }

    pub fn try_update_at<F>(&self, job_id: &str, now: DateTime<Utc>, transform: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        self.try_update_if(job_id, now, |record| {
            transform(record);
            true
        })?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    /// Read-modify-write under the job's lock. The snapshot is committed only
    /// when `transform` returns true; `Ok(None)` means nothing was written.
    ///
    /// `job_id`, `parameters` and `created_at` are restored after the
    /// transform runs, and `updated_at` is stamped with `now`.
    pub fn try_update_if<F>(&self, job_id: &str, now: DateTime<Utc>, transform: F) -> Result<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord) -> bool,
    {
        self.with_job_lock(job_id, || {
            let current = self.read_record(job_id)?;
            let mut next = current.clone();
            if !transform(&mut next) {
                return Ok(None);
            }
            next.job_id = current.job_id;
            next.parameters = current.parameters;
            next.created_at = current.created_at;
            next.updated_at = now;

            self.write_record(&next)?;
            Ok(Some(next))
        })
    }

    /// Move a pending or processing job to `cancelled`.
    ///
    /// Returns false if the job does not exist or already completed or failed.
    pub fn cancel(&self, job_id: &str) -> bool {
        let now = Utc::now();
        match self.try_update_if(job_id, now, |record| record.cancel(now)) {
            Ok(Some(_)) => {
                info!(job_id = %job_id, "job cancelled");
                true
            }
            Ok(None) => {
                info!(job_id = %job_id, "cancel ignored: job already finished");
                false
            }
            Err(StoreError::NotFound(_)) => false,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to cancel job");
                false
            }
        }
    }

    /// Remove a record and its lock file. Returns false if it did not exist.
    ///
    /// Ids are never reused, so a writer still waiting on the unlinked lock
    /// file finds no record once it gets in.
    pub fn delete(&self, job_id: &str) -> Result<bool> {
        let removed = self.with_job_lock(job_id, || {
            let removed = match fs::remove_file(self.record_path(job_id)) {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            fs::remove_file(self.lock_path(job_id)).ok();
            Ok(removed)
        })?;
        let table = self.locks.lock();
        table.borrow_mut().remove(job_id);
        Ok(removed)
    }

    // ── Read ─────────────────────────────────────────────────────────

    /// Full record, or `None` if it is missing or unreadable.
    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        match self.read_record(job_id) {
            Ok(record) => Some(record),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "treating unreadable job record as absent");
                None
            }
        }
    }

    pub fn read(&self, job_id: &str, detailed: bool) -> Option<JobRead> {
        self.get(job_id).map(|record| {
            if detailed {
                JobRead::Detailed(record)
            } else {
                JobRead::Summary(record.view())
            }
        })
    }

    /// Every readable record, in directory order.
    pub fn records(&self) -> Vec<JobRecord> {
        let _global = self.locks.lock();
        self.scan()
    }

    pub fn list(&self, query: &JobQuery) -> Vec<JobListing> {
        self.list_with_total(query).1
    }

    /// One page of the listing plus the size of the filtered set, both taken
    /// from the same scan.
    pub fn list_with_total(&self, query: &JobQuery) -> (usize, Vec<JobListing>) {
        let _global = self.locks.lock();
        let mut records: Vec<JobRecord> = self
            .scan()
            .into_iter()
            .filter(|r| query.status.matches(r.status))
            .collect();
        records.sort_by(|a, b| query.compare(a, b));

        let page = records
            .iter()
            .skip(query.page.saturating_mul(self.page_size))
            .take(self.page_size)
            .map(JobRecord::listing)
            .collect();
        (records.len(), page)
    }

    pub fn count(&self, status: StatusFilter) -> usize {
        let _global = self.locks.lock();
        self.scan().iter().filter(|r| status.matches(r.status)).count()
    }

    /// First record found that is pending or processing.
    pub fn has_active(&self) -> Option<JobRecord> {
        let _global = self.locks.lock();
        self.scan().into_iter().find(|r| r.status.is_active())
    }

    // ── Internals ────────────────────────────────────────────────────

    fn job_lock(&self, job_id: &str) -> Result<JobLock> {
        if !is_valid_job_id(job_id) {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        let table = self.locks.lock();
        let mut map = table.borrow_mut();
        let lock = map
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(RefCell::new(Held::default()))))
            .clone();
        Ok(lock)
    }

    /// Run `f` holding the job's in-process lock and, at the outermost
    /// level, its file lock.
    fn with_job_lock<T>(&self, job_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.job_lock(job_id)?;
        let guard = lock.lock();
        {
            let mut held = guard.borrow_mut();
            if held.depth == 0 {
                held.file = Some(FileLock::acquire(&self.lock_path(job_id))?);
            }
            held.depth += 1;
        }
        let _release = Release(&*guard);
        f()
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!(".{job_id}.lock"))
    }

    fn read_record(&self, job_id: &str) -> Result<JobRecord> {
        if !is_valid_job_id(job_id) {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        read_path(&self.record_path(job_id), job_id)
    }

    /// Write to `.{id}.{pid}.tmp`, fsync, then rename over the record.
    fn write_record(&self, record: &JobRecord) -> Result<()> {
        let final_path = self.record_path(&record.job_id);
        let tmp_path = self
            .jobs_dir
            .join(format!(".{}.{}.tmp", record.job_id, std::process::id()));

        let json = serde_json::to_vec_pretty(record)?;
        let written = fs::File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp_path, &final_path)) {
            fs::remove_file(&tmp_path).ok();
            return Err(e.into());
        }
        Ok(())
    }

    fn scan(&self) -> Vec<JobRecord> {
        let entries = match fs::read_dir(&self.jobs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.jobs_dir.display(), error = %e, "failed to read jobs directory");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(job_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| !n.starts_with('.'))
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            match read_path(&path, job_id) {
                Ok(record) => records.push(record),
                // Deleted between listing and reading.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
            }
        }
        records
    }
}

fn read_path(path: &Path, job_id: &str) -> Result<JobRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoreError::NotFound(job_id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        job_id: job_id.to_string(),
        reason: e.to_string(),
    })
}

/// Ids become file names, so only a conservative alphabet is accepted.
fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && !job_id.starts_with('.')
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !job_id.contains("..")
}
