//! Synthetic workload: drives the job lifecycle with timed sleeps instead of
//! the object store and loader.

use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use loadstar_core::ItemOutcome;

use crate::error::Result;
use crate::pipeline::{Ingestor, JobEnd};

/// Bucket label recorded on synthetic jobs; `JobKind::Synthetic` marks them
/// and the job name goes in `path`.
pub const SYNTHETIC_BUCKET: &str = "synthetic";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticPlan {
    pub tasks: u32,
    pub concurrency: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl SyntheticPlan {
    /// Random per-task delays, uniform over `[min_delay, max_delay]`.
    fn delays(&self) -> Vec<Duration> {
        let lo = self.min_delay.min(self.max_delay).as_millis() as u64;
        let hi = self.min_delay.max(self.max_delay).as_millis() as u64;
        let mut rng = rand::thread_rng();
        (0..self.tasks)
            .map(|_| Duration::from_millis(rng.gen_range(lo..=hi)))
            .collect()
    }
}

pub fn task_key(index: u32) -> String {
    format!("synthetic_task_{index}")
}

impl Ingestor {
    pub async fn run_synthetic(&self, job_id: &str, plan: SyntheticPlan) {
        let token = self.registry.token(job_id);
        let end = self.process_synthetic(job_id, plan, &token).await;
        self.finish(job_id, end);
    }

    async fn process_synthetic(&self, job_id: &str, plan: SyntheticPlan, token: &CancellationToken) -> Result<JobEnd> {
        let cap = self.settings.max_concurrent.max(1);
        let mut concurrency = (plan.concurrency as usize).max(1);
        if concurrency > cap {
            warn!(job_id = %job_id, requested = concurrency, cap, "synthetic concurrency capped");
            concurrency = cap;
        }

        let total = u64::from(plan.tasks);
        if self.mark_processing(job_id, |r| r.begin(total))?.is_none() {
            return Ok(JobEnd::Cancelled);
        }
        info!(job_id = %job_id, tasks = plan.tasks, concurrency, "synthetic workload started");

        let delays = plan.delays();
        let indices: Vec<u32> = (0..plan.tasks).collect();
        for batch in indices.chunks(concurrency) {
            if self.is_cancelled(job_id, token) {
                return Ok(JobEnd::Cancelled);
            }
            join_all(
                batch
                    .iter()
                    .map(|&i| self.synthetic_task(job_id, i, delays[i as usize], token)),
            )
            .await;
        }

        if self.is_cancelled(job_id, token) {
            Ok(JobEnd::Cancelled)
        } else {
            Ok(JobEnd::Completed)
        }
    }

    async fn synthetic_task(&self, job_id: &str, index: u32, delay: Duration, token: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return,
        }
        let outcome = ItemOutcome::Success { item_count: 1, ingest_secs: delay.as_secs_f64() };
        self.settle(job_id, &task_key(index), outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_bounds() {
        let plan = SyntheticPlan {
            tasks: 50,
            concurrency: 2,
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
        };
        let delays = plan.delays();
        assert_eq!(delays.len(), 50);
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_secs(10) && *d <= Duration::from_secs(30)));
    }

    #[test]
    fn swapped_bounds_are_tolerated() {
        let plan = SyntheticPlan {
            tasks: 3,
            concurrency: 1,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
        };
        assert!(plan.delays().iter().all(|d| *d <= Duration::from_secs(5)));
    }

    #[test]
    fn task_keys_are_indexed() {
        assert_eq!(task_key(0), "synthetic_task_0");
        assert_eq!(task_key(12), "synthetic_task_12");
    }
}
