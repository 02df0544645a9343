//! Reconciliation sweeps over the whole store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use loadstar_core::{JobRecord, JobStatus};

use crate::store::JobStore;

pub const RESUMED_MESSAGE: &str = "Job resumed after interruption";

/// True when `record` was last touched more than `max_age` before `now`.
fn older_than(record: &JobRecord, now: DateTime<Utc>, max_age: Duration) -> bool {
    matches!((now - record.updated_at).to_std(), Ok(age) if age > max_age)
}

impl JobStore {
    /// Requeue jobs stuck in `processing` longer than `stale_after`.
    /// Returns the ids moved back to `pending`.
    pub fn resume_interrupted(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .records()
            .into_iter()
            .filter(|r| r.status == JobStatus::Processing && older_than(r, now, stale_after))
            .map(|r| r.job_id)
            .collect();

        let mut resumed = Vec::new();
        for job_id in candidates {
            // Re-checked under the job lock; the job may have moved on meanwhile.
            let result = self.try_update_if(&job_id, now, |record| {
                if record.status == JobStatus::Processing && older_than(record, now, stale_after) {
                    record.requeue(RESUMED_MESSAGE);
                    true
                } else {
                    false
                }
            });
            match result {
                Ok(Some(_)) => {
                    info!(job_id = %job_id, "requeued interrupted job");
                    resumed.push(job_id);
                }
                Ok(None) => {}
                Err(e) => error!(job_id = %job_id, error = %e, "failed to requeue interrupted job"),
            }
        }
        resumed
    }

    /// Delete finished jobs whose last update is older than `max_age`.
    /// Pending and processing jobs are never removed.
    pub fn clean_old_jobs(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .records()
            .into_iter()
            .filter(|r| r.status.is_terminal() && older_than(r, now, max_age))
            .map(|r| r.job_id)
            .collect();

        let mut removed = Vec::new();
        for job_id in candidates {
            // A terminal job cannot become active again, so no re-check is needed.
            match self.delete(&job_id) {
                Ok(true) => {
                    info!(job_id = %job_id, "removed expired job record");
                    removed.push(job_id);
                }
                Ok(false) => {}
                Err(e) => error!(job_id = %job_id, error = %e, "failed to remove expired job record"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;
    use loadstar_core::JobParameters;
    use tempfile::TempDir;

    use super::*;

    fn temp_store() -> (TempDir, JobStore) {
        let dir = TempDir::new().expect("create tempdir");
        let store = JobStore::open(dir.path(), 10).unwrap();
        (dir, store)
    }

    #[test]
    fn stale_processing_job_is_requeued() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let stale = store.create(JobParameters::new("b", "stale/")).unwrap();
        let fresh = store.create(JobParameters::new("b", "fresh/")).unwrap();

        store
            .try_update_at(&stale, now - TimeDelta::minutes(31), |r| r.begin(4))
            .unwrap();
        store
            .try_update_at(&fresh, now - TimeDelta::minutes(5), |r| r.begin(4))
            .unwrap();

        let resumed = store.resume_interrupted(now, Duration::from_secs(1800));
        assert_eq!(resumed, vec![stale.clone()]);

        let record = store.get(&stale).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.message.as_deref(), Some(RESUMED_MESSAGE));
        assert_eq!(record.updated_at, now);
        assert_eq!(store.get(&fresh).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn pending_jobs_are_not_touched_by_resume() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let id = store
            .create_at(JobParameters::new("b", "p/"), now - TimeDelta::hours(5))
            .unwrap();
        assert!(store.resume_interrupted(now, Duration::from_secs(1800)).is_empty());
        assert_eq!(store.get(&id).unwrap().updated_at, now - TimeDelta::hours(5));
    }

    #[test]
    fn retention_removes_only_old_terminal_jobs() {
        let (_dir, store) = temp_store();
        let now = Utc::now();
        let long_ago = now - TimeDelta::days(45);

        let old_done = store.create(JobParameters::new("b", "a/")).unwrap();
        store
            .try_update_at(&old_done, long_ago, |r| {
                r.complete(long_ago);
            })
            .unwrap();

        let old_active = store.create(JobParameters::new("b", "b/")).unwrap();
        store.try_update_at(&old_active, long_ago, |r| r.begin(1)).unwrap();

        let recent_failed = store.create(JobParameters::new("b", "c/")).unwrap();
        store
            .try_update_at(&recent_failed, now - TimeDelta::days(2), |r| {
                r.fail("x", now);
            })
            .unwrap();

        let removed = store.clean_old_jobs(now, Duration::from_secs(30 * 86_400));
        assert_eq!(removed, vec![old_done.clone()]);
        assert!(store.get(&old_done).is_none());
        assert!(store.get(&old_active).is_some());
        assert!(store.get(&recent_failed).is_some());
    }
}
