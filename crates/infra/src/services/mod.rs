//! Orchestration services.
//!
//! [`Orchestrator`] owns the job registry and the worker pool and turns a
//! closure into a tracked background job. Per-system services such as
//! [`PackageService`] resolve a cached client on the request path and hand
//! the long-running part to the orchestrator.

mod packages;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetops_core::{CapabilityError, JobId};

use crate::config::OrchestratorConfig;
use crate::jobs::{
    JobContext, JobError, JobFailure, JobLogEntry, JobRecord, JobRegistry, JobStats, PoolStats,
    Submission, WorkerPool,
};

pub use packages::PackageService;

const REJECTED_MESSAGE: &str = "worker pool is shut down";

/// Errors returned synchronously to the caller. Anything that goes wrong
/// after a job id was handed out is recorded on the job instead.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("client unavailable: {0}")]
    Client(#[from] CapabilityError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("cannot fingerprint connection settings: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Job registry + worker pool.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<JobRegistry>,
    pool: WorkerPool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> std::io::Result<Self> {
        let pool = WorkerPool::new(config.workers)?;
        info!(workers = pool.workers(), "orchestrator started");
        Ok(Self {
            config,
            registry: JobRegistry::arc(),
            pool,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Register a job and run `work` for it in the background.
    ///
    /// Returns as soon as the job is registered. The closure's `Ok` value
    /// becomes the job result and its `Err` the job error; a panic fails the
    /// job too.
    pub fn spawn<F>(
        &self,
        id: Option<JobId>,
        metadata: BTreeMap<String, String>,
        work: F,
    ) -> Result<JobId, ServiceError>
    where
        F: FnOnce(&JobContext) -> Result<serde_json::Value, JobFailure> + Send + 'static,
    {
        let id = id.unwrap_or_else(JobId::generate);
        self.registry.create(id.clone(), metadata)?;

        let ctx = JobContext::new(
            id.clone(),
            self.registry.clone(),
            self.config.retry,
            self.config.poll,
        );
        let submission = self.pool.submit(move || {
            ctx.progress(0, "job started");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&ctx)))
                .unwrap_or_else(|_| Err(JobFailure::message("job panicked")));
            ctx.finish(outcome);
        });

        match submission {
            Submission::Queued => debug!(job_id = %id, "job queued"),
            Submission::Overflow => debug!(job_id = %id, "job running on overflow thread"),
            Submission::Rejected => {
                warn!(job_id = %id, "job rejected: {REJECTED_MESSAGE}");
                self.registry.fail(&id, REJECTED_MESSAGE)?;
                return Ok(id);
            }
        }
        info!(job_id = %id, "job accepted");
        Ok(id)
    }

    /// Register a `pending` job without work attached.
    pub fn create_job(
        &self,
        id: Option<JobId>,
        metadata: BTreeMap<String, String>,
    ) -> Result<JobRecord, JobError> {
        self.registry.create(id.unwrap_or_else(JobId::generate), metadata)
    }

    pub fn job(&self, id: &JobId) -> Option<JobRecord> {
        self.registry.get(id)
    }

    /// Every job, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.registry.all().into_values().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn job_logs(&self, id: &JobId) -> Option<Vec<JobLogEntry>> {
        self.registry.get(id).map(|job| job.logs)
    }

    pub fn delete_job(&self, id: &JobId) -> Option<JobRecord> {
        self.registry.delete(id)
    }

    pub fn job_stats(&self) -> JobStats {
        self.registry.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop accepting work and wait for running jobs to finish.
    pub fn shutdown(&self) {
        self.pool.close();
        info!(jobs = ?self.registry.stats(), "orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::jobs::{JobStatus, RetryPolicy};

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default()
                .with_workers(2)
                .with_retry(RetryPolicy::fixed(2, Duration::ZERO)),
        )
        .unwrap()
    }

    fn wait_terminal(orch: &Orchestrator, id: &JobId) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = orch.job(id).unwrap();
            if job.status.is_terminal() || Instant::now() > deadline {
                return job;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn spawned_job_completes_with_result() {
        let orch = orchestrator();
        let id = orch
            .spawn(None, BTreeMap::new(), |ctx| {
                ctx.progress(50, "half way");
                Ok(json!({"ok": true}))
            })
            .unwrap();

        let job = wait_terminal(&orch, &id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.log_messages().any(|l| l == "job completed"));
    }

    #[test]
    fn failing_job_records_the_error() {
        let orch = orchestrator();
        let id = orch
            .spawn(Some(JobId::from("job-1")), BTreeMap::new(), |_| {
                Err(JobFailure::message("chart not found"))
            })
            .unwrap();
        assert_eq!(id.as_str(), "job-1");

        let job = wait_terminal(&orch, &id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("chart not found"));
    }

    #[test]
    fn panicking_job_is_failed_not_stuck() {
        let orch = orchestrator();
        let id = orch
            .spawn(None, BTreeMap::new(), |_| panic!("boom"))
            .unwrap();
        let job = wait_terminal(&orch, &id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("job panicked"));
    }

    #[test]
    fn duplicate_id_is_rejected_synchronously() {
        let orch = orchestrator();
        orch.create_job(Some(JobId::from("dup")), BTreeMap::new()).unwrap();
        let err = orch
            .spawn(Some(JobId::from("dup")), BTreeMap::new(), |_| Ok(json!(null)))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Job(JobError::AlreadyExists(_))));
    }

    #[test]
    fn spawn_after_shutdown_fails_the_job() {
        let orch = orchestrator();
        orch.shutdown();
        let id = orch
            .spawn(None, BTreeMap::new(), |_| Ok(json!("never")))
            .unwrap();
        let job = orch.job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(REJECTED_MESSAGE));
        assert_eq!(orch.pool_stats().rejected, 1);
    }

    #[test]
    fn shutdown_waits_for_running_jobs() {
        let orch = orchestrator();
        let ids: Vec<JobId> = (0..6)
            .map(|_| {
                orch.spawn(None, BTreeMap::new(), |_| {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(json!(null))
                })
                .unwrap()
            })
            .collect();

        orch.shutdown();
        for id in &ids {
            assert_eq!(orch.job(id).unwrap().status, JobStatus::Completed);
        }
        assert_eq!(orch.job_stats().completed, 6);
    }

    #[test]
    fn job_queries() {
        let orch = orchestrator();
        let first = orch.create_job(Some(JobId::from("a")), BTreeMap::new()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = orch.create_job(Some(JobId::from("b")), BTreeMap::new()).unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        let ids: Vec<JobId> = orch.jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(orch.job_logs(&first.id), Some(Vec::new()));
        assert!(orch.delete_job(&first.id).is_some());
        assert!(orch.job(&first.id).is_none());
        assert!(orch.job_logs(&first.id).is_none());
        assert_eq!(orch.job_stats().pending, 1);
    }
}
