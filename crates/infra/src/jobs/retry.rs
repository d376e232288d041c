//! Retry executor: bounded attempts, fixed delay, per-attempt job logging.

use std::fmt::Display;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use fleetops_core::JobId;

use super::registry::JobRegistry;
use super::types::RetryPolicy;

/// Every attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

/// Runs an operation up to `policy.max_attempts` times on behalf of a job.
///
/// Progress and log lines go to the job's record; the job itself is never
/// marked failed here. Whether exhaustion is fatal is the caller's call.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    registry: Arc<JobRegistry>,
}

impl RetryExecutor {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    /// Retry `operation` with a fixed delay between attempts.
    ///
    /// Blocks the calling thread while sleeping; run it on a worker.
    pub fn retry<T, E, F>(
        &self,
        job_id: &JobId,
        operation_name: &str,
        policy: RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Result<T, E>,
    {
        let max = policy.attempts();
        let mut attempt = 1;

        loop {
            let line = format!("{operation_name} (attempt {attempt}/{max})");
            self.record_status(job_id, policy.progress_before(attempt), &line);
            self.record_log(job_id, line);
            debug!(job_id = %job_id, operation = operation_name, attempt, max, "attempt started");

            match operation() {
                Ok(value) => {
                    self.record_log(
                        job_id,
                        format!("{operation_name} succeeded after {attempt} attempt(s)"),
                    );
                    return Ok(value);
                }
                Err(err) => {
                    self.record_log(job_id, format!("{operation_name} failed: {err}"));
                    warn!(
                        job_id = %job_id,
                        operation = operation_name,
                        attempt,
                        max,
                        error = %err,
                        "attempt failed"
                    );

                    if attempt >= max {
                        return Err(RetryError {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                }
            }

            if !policy.delay.is_zero() {
                thread::sleep(policy.delay);
            }
            attempt += 1;
        }
    }

    fn record_status(&self, job_id: &JobId, progress: u8, message: &str) {
        if let Err(e) = self.registry.update_status(job_id, progress, message) {
            debug!(job_id = %job_id, error = %e, "status update dropped");
        }
    }

    fn record_log(&self, job_id: &JobId, line: impl Display) {
        if let Err(e) = self.registry.add_log(job_id, line.to_string()) {
            debug!(job_id = %job_id, error = %e, "log line dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use fleetops_core::CapabilityError;

    use super::*;
    use crate::jobs::types::JobStatus;

    fn setup() -> (Arc<JobRegistry>, RetryExecutor, JobId) {
        let registry = JobRegistry::arc();
        let id = JobId::generate();
        registry.create(id.clone(), BTreeMap::new()).unwrap();
        (registry.clone(), RetryExecutor::new(registry), id)
    }

    fn attempt_lines(registry: &JobRegistry, id: &JobId) -> usize {
        registry
            .get(id)
            .unwrap()
            .log_messages()
            .filter(|l| l.contains("(attempt "))
            .count()
    }

    fn failure_lines(registry: &JobRegistry, id: &JobId) -> usize {
        registry
            .get(id)
            .unwrap()
            .log_messages()
            .filter(|l| l.contains(" failed: "))
            .count()
    }

    #[test]
    fn succeeds_on_attempt_m() {
        for m in 1..=4u32 {
            let (registry, executor, id) = setup();
            let calls = AtomicU32::new(0);

            let result = executor.retry(&id, "install redis", RetryPolicy::fixed(4, Duration::ZERO), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < m {
                    Err(CapabilityError::unavailable("not yet"))
                } else {
                    Ok(n)
                }
            });

            assert_eq!(result.unwrap(), m);
            assert_eq!(calls.load(Ordering::SeqCst), m);
            assert_eq!(attempt_lines(&registry, &id), m as usize);
            assert_eq!(failure_lines(&registry, &id), (m - 1) as usize);

            let job = registry.get(&id).unwrap();
            assert_eq!(job.status, JobStatus::Processing);
            assert!(job
                .log_messages()
                .any(|l| l == format!("install redis succeeded after {m} attempt(s)")));
        }
    }

    #[test]
    fn exhausts_after_exactly_k_attempts() {
        let (registry, executor, id) = setup();
        let calls = AtomicU32::new(0);

        let err = executor
            .retry(&id, "upgrade redis", RetryPolicy::fixed(3, Duration::ZERO), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CapabilityError::rejected("bad values"))
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.source, CapabilityError::rejected("bad values"));
        assert_eq!(
            err.to_string(),
            "upgrade redis failed after 3 attempt(s): rejected: bad values"
        );
        assert_eq!(attempt_lines(&registry, &id), 3);
        assert_eq!(failure_lines(&registry, &id), 3);

        // Exhaustion is not the executor's call to make.
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn attempt_lines_and_progress() {
        let (registry, executor, id) = setup();
        let _ = executor.retry(&id, "op", RetryPolicy::fixed(2, Duration::ZERO), || {
            Err::<(), _>(CapabilityError::other("x"))
        });

        let job = registry.get(&id).unwrap();
        let lines: Vec<_> = job.log_messages().collect();
        assert_eq!(
            lines,
            vec!["op (attempt 1/2)", "op failed: x", "op (attempt 2/2)", "op failed: x"]
        );
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn sleeps_between_attempts_but_not_after_the_last() {
        let (_registry, executor, id) = setup();
        let delay = Duration::from_millis(40);
        let started = Instant::now();

        let _ = executor.retry(&id, "op", RetryPolicy::fixed(3, delay), || {
            Err::<(), _>(CapabilityError::other("x"))
        });

        let elapsed = started.elapsed();
        assert!(elapsed >= delay * 2, "elapsed {elapsed:?}");
        assert!(elapsed < delay * 3 + Duration::from_millis(500));
    }

    #[test]
    fn zero_max_attempts_still_runs_once() {
        let (_registry, executor, id) = setup();
        let calls = AtomicU32::new(0);
        let _ = executor.retry(&id, "op", RetryPolicy::fixed(0, Duration::ZERO), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CapabilityError::other("x"))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
