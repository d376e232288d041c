//! Handle given to a background task for reporting on its own job.

use std::sync::Arc;

use tracing::{debug, info, warn};

use fleetops_core::{CapabilityError, JobId};

use super::poller::{CompletionPoller, Condition, PollError, PollOutcome};
use super::registry::JobRegistry;
use super::retry::{RetryError, RetryExecutor};
use super::types::{PollPolicy, RetryPolicy};

/// Why a job failed. Its `Display` becomes `JobRecord::error`.
#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Retry(#[from] RetryError<CapabilityError>),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("{0}")]
    Message(String),
}

impl JobFailure {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// The operation was accepted but never became visible downstream.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Poll(PollError::Timeout { .. }))
    }
}

/// Exclusive writer for one job record.
///
/// Registry errors (the job was deleted or already finished) are logged and
/// swallowed: a background task has nobody to report them to.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
        poll: PollPolicy,
    ) -> Self {
        Self {
            job_id,
            registry,
            retry,
            poll,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// Enter `processing` with a progress value and status line.
    pub fn progress(&self, progress: u8, message: impl Into<String>) {
        if let Err(e) = self.registry.update_status(&self.job_id, progress, message) {
            debug!(job_id = %self.job_id, error = %e, "status update dropped");
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        if let Err(e) = self.registry.add_log(&self.job_id, message) {
            debug!(job_id = %self.job_id, error = %e, "log line dropped");
        }
    }

    /// Run `operation` under the job's retry policy.
    pub fn retry<T, E, F>(&self, operation_name: &str, operation: F) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.retry_with(self.retry, operation_name, operation)
    }

    pub fn retry_with<T, E, F>(
        &self,
        policy: RetryPolicy,
        operation_name: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Result<T, E>,
    {
        RetryExecutor::new(self.registry.clone()).retry(&self.job_id, operation_name, policy, operation)
    }

    /// Poll `condition` under the job's poll policy.
    pub fn wait_until(&self, condition: &mut Condition<'_>) -> Result<PollOutcome, PollError> {
        self.wait_until_with(condition, self.poll)
    }

    pub fn wait_until_with(
        &self,
        condition: &mut Condition<'_>,
        policy: PollPolicy,
    ) -> Result<PollOutcome, PollError> {
        CompletionPoller::new(self.registry.clone(), self.job_id.clone()).wait_until(condition, policy)
    }

    /// Write the task's outcome to the job boundary.
    pub(crate) fn finish(self, outcome: Result<serde_json::Value, JobFailure>) {
        let written = match outcome {
            Ok(result) => {
                info!(job_id = %self.job_id, "job completed");
                self.registry.complete(&self.job_id, result)
            }
            Err(failure) => {
                warn!(job_id = %self.job_id, error = %failure, timeout = failure.is_timeout(), "job failed");
                self.registry.fail(&self.job_id, failure.to_string())
            }
        };
        if let Err(e) = written {
            warn!(job_id = %self.job_id, error = %e, "job outcome not recorded");
        }
    }
}
