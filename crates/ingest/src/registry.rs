//! Per-job cancellation state and the loader processes running for each job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Control surface of one running loader process.
///
/// The task that owns the child watches `force` and reports exit through
/// `exited`; the registry drives the termination protocol.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    terminate: CancellationToken,
    force: CancellationToken,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once termination was requested, gracefully or not.
    pub fn termination_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves when the process must be killed outright.
    pub async fn force_requested(&self) {
        self.force.cancelled().await
    }

    fn kill_now(&self) {
        self.terminate.cancel();
        self.force.cancel();
    }
}

#[derive(Default)]
struct JobProcesses {
    token: CancellationToken,
    handles: HashMap<u64, ProcessHandle>,
}

/// Keeps the handle registered until dropped, then marks the process exited.
pub struct Registration<'a> {
    registry: &'a CancellationRegistry,
    job_id: String,
    handle: ProcessHandle,
}

impl Registration<'_> {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.handle.exited.cancel();
        self.registry.unregister(&self.job_id, self.handle.id);
    }
}

pub struct CancellationRegistry {
    jobs: Mutex<HashMap<String, JobProcesses>>,
    grace: Duration,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            grace,
            next_id: AtomicU64::new(1),
        }
    }

    /// Cancellation token of a job. Created on first use.
    pub fn token(&self, job_id: &str) -> CancellationToken {
        self.jobs.lock().entry(job_id.to_string()).or_default().token.clone()
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .is_some_and(|job| job.token.is_cancelled())
    }

    /// Track a freshly spawned process. A process registered for a job that
    /// is already cancelled is told to die immediately.
    pub fn register(&self, job_id: &str, pid: Option<u32>) -> Registration<'_> {
        let handle = ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid,
            terminate: CancellationToken::new(),
            force: CancellationToken::new(),
            exited: CancellationToken::new(),
        };

        let mut jobs = self.jobs.lock();
        let job = jobs.entry(job_id.to_string()).or_default();
        if job.token.is_cancelled() {
            warn!(job_id = %job_id, pid = ?pid, "process started after cancellation; killing");
            handle.kill_now();
        } else {
            job.handles.insert(handle.id, handle.clone());
        }
        drop(jobs);

        Registration {
            registry: self,
            job_id: job_id.to_string(),
            handle,
        }
    }

    pub fn unregister(&self, job_id: &str, handle_id: u64) {
        if let Some(job) = self.jobs.lock().get_mut(job_id) {
            job.handles.remove(&handle_id);
        }
    }

    pub fn active_count(&self, job_id: &str) -> usize {
        self.jobs.lock().get(job_id).map_or(0, |job| job.handles.len())
    }

    /// Cancel the job's token and terminate every registered process:
    /// graceful request first, forced kill once the grace period runs out.
    /// Returns how many processes were signalled.
    ///
    /// A job with no live run in this process has no entry and none is
    /// created; its run would find the record cancelled before starting.
    pub async fn cancel_all(&self, job_id: &str) -> usize {
        let handles: Vec<ProcessHandle> = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(job_id) else {
                debug!(job_id = %job_id, "no live run to cancel");
                return 0;
            };
            job.token.cancel();
            job.handles.drain().map(|(_, handle)| handle).collect()
        };

        info!(job_id = %job_id, processes = handles.len(), "cancelling job processes");
        futures::future::join_all(handles.iter().map(|handle| self.terminate(job_id, handle))).await;
        handles.len()
    }

    /// Forget a finished job.
    pub fn release(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
    }

    async fn terminate(&self, job_id: &str, handle: &ProcessHandle) {
        handle.terminate.cancel();

        match handle.pid {
            #[cfg(unix)]
            Some(pid) => {
                let sent = tokio::process::Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .output()
                    .await;
                match sent {
                    Ok(_) => info!(job_id = %job_id, pid, "sent SIGTERM"),
                    Err(e) => warn!(job_id = %job_id, pid, error = %e, "failed to send SIGTERM"),
                }
            }
            _ => handle.force.cancel(),
        }

        if tokio::time::timeout(self.grace, handle.exited.cancelled()).await.is_ok() {
            return;
        }

        warn!(job_id = %job_id, pid = ?handle.pid, "grace period elapsed; force killing");
        handle.force.cancel();
        if tokio::time::timeout(self.grace, handle.exited.cancelled()).await.is_err() {
            warn!(job_id = %job_id, pid = ?handle.pid, "process did not report exit after force kill");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_drains_handles_and_cancels_token() {
        let registry = CancellationRegistry::new(Duration::from_millis(50));
        let token = registry.token("job");

        let registration = registry.register("job", None);
        assert_eq!(registry.active_count("job"), 1);

        let handle = registration.handle().clone();
        let owner = async move {
            handle.force_requested().await;
            drop(registration);
        };

        // Without a pid the registry goes straight to the forced path.
        let (signalled, ()) = tokio::join!(registry.cancel_all("job"), owner);

        assert_eq!(signalled, 1);
        assert!(token.is_cancelled());
        assert!(registry.is_cancelled("job"));
        assert_eq!(registry.active_count("job"), 0);
    }

    #[tokio::test]
    async fn registration_after_cancel_is_killed_immediately() {
        let registry = CancellationRegistry::new(Duration::from_millis(50));
        let token = registry.token("job");
        registry.cancel_all("job").await;
        assert!(token.is_cancelled());

        let registration = registry.register("job", Some(1));
        assert!(registration.handle().termination_requested());
        registration.handle().force_requested().await;
        assert_eq!(registry.active_count("job"), 0);
    }

    #[tokio::test]
    async fn dropping_registration_unregisters() {
        let registry = CancellationRegistry::new(Duration::from_millis(50));
        {
            let _a = registry.register("job", None);
            let _b = registry.register("job", None);
            assert_eq!(registry.active_count("job"), 2);
        }
        assert_eq!(registry.active_count("job"), 0);
        assert!(!registry.is_cancelled("job"));

        registry.release("job");
        assert_eq!(registry.active_count("job"), 0);
    }

    #[tokio::test]
    async fn cancelling_a_job_without_a_run_leaves_no_entry() {
        let registry = CancellationRegistry::new(Duration::from_millis(10));
        assert_eq!(registry.cancel_all("idle").await, 0);
        assert_eq!(registry.cancel_all("idle").await, 0);
        assert!(registry.jobs.lock().is_empty());

        let _token = registry.token("running");
        registry.cancel_all("running").await;
        registry.release("running");
        registry.cancel_all("running").await;
        assert!(registry.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn jobs_are_independent() {
        let registry = CancellationRegistry::new(Duration::from_millis(10));
        let _other = registry.register("other", None);
        registry.cancel_all("job").await;
        assert!(!registry.is_cancelled("other"));
        assert_eq!(registry.active_count("other"), 1);
    }
}
