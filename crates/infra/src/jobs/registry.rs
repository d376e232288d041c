//! In-memory job registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleetops_core::JobId;

use super::types::{JobRecord, JobStatus};

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} already {status}")]
    Finished { id: JobId, status: JobStatus },
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Concurrency-safe map of job id to job record.
///
/// One registry-wide lock, held for the map access only. Callers never get a
/// reference into the map: reads return copies, so a slow reader cannot block
/// writers and nobody observes a half-written record.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // A panic while holding the lock leaves the map itself intact (every
    // mutation is a single field assignment or push), so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new `pending` job.
    pub fn create(
        &self,
        id: JobId,
        metadata: BTreeMap<String, String>,
    ) -> Result<JobRecord, JobError> {
        let mut jobs = self.write();
        if jobs.contains_key(&id) {
            return Err(JobError::AlreadyExists(id));
        }
        let record = JobRecord::new(id.clone(), metadata);
        jobs.insert(id, record.clone());
        Ok(record)
    }

    /// Copy of one job.
    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.read().get(id).cloned()
    }

    /// Copy of every job.
    pub fn all(&self) -> HashMap<JobId, JobRecord> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Apply `f` to a non-terminal job under the write lock.
    fn mutate<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, JobError>,
    ) -> Result<T, JobError> {
        let mut jobs = self.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.clone()))?;
        if job.status.is_terminal() {
            return Err(JobError::Finished {
                id: id.clone(),
                status: job.status,
            });
        }
        f(job)
    }

    fn transition(job: &mut JobRecord, to: JobStatus) -> Result<(), JobError> {
        if job.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to,
            })
        }
    }

    /// Move the job to `processing` with the given progress and message.
    ///
    /// Progress never decreases: a lower value keeps the current one.
    pub fn update_status(
        &self,
        id: &JobId,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), JobError> {
        let message = message.into();
        self.mutate(id, |job| {
            Self::transition(job, JobStatus::Processing)?;
            job.mark_processing(progress, message);
            Ok(())
        })
    }

    /// Append a timestamped line to the job's log.
    pub fn add_log(&self, id: &JobId, message: impl Into<String>) -> Result<(), JobError> {
        let message = message.into();
        self.mutate(id, |job| {
            job.push_log(message);
            Ok(())
        })
    }

    /// Mark the job `completed` with its result payload.
    pub fn complete(&self, id: &JobId, result: serde_json::Value) -> Result<(), JobError> {
        self.mutate(id, |job| {
            Self::transition(job, JobStatus::Completed)?;
            job.mark_completed(result);
            Ok(())
        })
    }

    /// Mark the job `failed` with an error message.
    pub fn fail(&self, id: &JobId, error: impl Into<String>) -> Result<(), JobError> {
        let error = error.into();
        self.mutate(id, |job| {
            Self::transition(job, JobStatus::Failed)?;
            job.mark_failed(error);
            Ok(())
        })
    }

    /// Remove a job. Nothing calls this automatically; retention is up to the
    /// caller.
    pub fn delete(&self, id: &JobId) -> Option<JobRecord> {
        self.write().remove(id)
    }

    /// Jobs in a given status, oldest first.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        let mut result: Vec<_> = self
            .read()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result
    }

    /// Jobs whose metadata has `key == value`, oldest first.
    pub fn find_by_metadata(&self, key: &str, value: &str) -> Vec<JobRecord> {
        let mut result: Vec<_> = self
            .read()
            .values()
            .filter(|j| j.metadata.get(key).is_some_and(|v| v == value))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result
    }

    pub fn stats(&self) -> JobStats {
        let jobs = self.read();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}
