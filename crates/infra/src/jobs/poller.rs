//! Deadline-bounded completion polling.
//!
//! A backend accepting a mutation does not mean the change is visible yet.
//! The poller re-evaluates a [`Condition`] on a fixed tick until it holds or
//! an absolute deadline passes.
//!
//! A condition is a set of named probes combined with OR semantics: any one
//! satisfied probe confirms completion. This tolerates backends whose status
//! API and raw resource listing disagree for a while. A probe error is
//! transient by definition: it is logged and the loop goes on.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fleetops_core::{CapabilityError, CapabilityResult, JobId};

use super::registry::JobRegistry;
use super::types::PollPolicy;

const MIN_TICK: Duration = Duration::from_millis(1);

type ProbeFn<'a> = Box<dyn FnMut() -> CapabilityResult<bool> + 'a>;

struct Probe<'a> {
    name: String,
    check: ProbeFn<'a>,
}

/// Named OR-combination of probes.
pub struct Condition<'a> {
    description: String,
    probes: Vec<Probe<'a>>,
}

impl std::fmt::Debug for Condition<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("description", &self.description)
            .field(
                "probes",
                &self.probes.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Result of one probe during one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub probe: String,
    pub result: Result<bool, CapabilityError>,
}

impl ProbeOutcome {
    fn describe(&self) -> String {
        match &self.result {
            Ok(true) => format!("{}: satisfied", self.probe),
            Ok(false) => format!("{}: not yet", self.probe),
            Err(e) => format!("{}: error: {e}", self.probe),
        }
    }
}

impl<'a> Condition<'a> {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            probes: Vec::new(),
        }
    }

    /// Condition with a single probe named after the condition.
    pub fn single<F>(description: impl Into<String>, check: F) -> Self
    where
        F: FnMut() -> CapabilityResult<bool> + 'a,
    {
        let description = description.into();
        Self::new(description.clone()).probe(description, check)
    }

    /// Add an OR-ed probe.
    pub fn probe<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: FnMut() -> CapabilityResult<bool> + 'a,
    {
        self.probes.push(Probe {
            name: name.into(),
            check: Box::new(check),
        });
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run every probe once. All probes run even after one is satisfied so
    /// the job log shows the whole picture.
    pub fn evaluate(&mut self) -> (bool, Vec<ProbeOutcome>) {
        let outcomes: Vec<ProbeOutcome> = self
            .probes
            .iter_mut()
            .map(|p| ProbeOutcome {
                probe: p.name.clone(),
                result: (p.check)(),
            })
            .collect();
        let satisfied = outcomes.iter().any(|o| matches!(o.result, Ok(true)));
        (satisfied, outcomes)
    }
}

/// Successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub checks: u32,
    pub elapsed: Duration,
}

/// Deadline passed before the condition held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {elapsed:?} waiting for {condition} ({checks} checks)")]
    Timeout {
        condition: String,
        elapsed: Duration,
        checks: u32,
    },
}

/// Polls on behalf of one job, writing every check into its log.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    registry: Arc<JobRegistry>,
    job_id: JobId,
}

impl CompletionPoller {
    pub fn new(registry: Arc<JobRegistry>, job_id: JobId) -> Self {
        Self { registry, job_id }
    }

    /// Evaluate `condition` every `policy.tick` until it holds or
    /// `policy.timeout` elapses.
    ///
    /// The first evaluation happens one tick after the call. Blocks the
    /// calling thread.
    pub fn wait_until(
        &self,
        condition: &mut Condition<'_>,
        policy: PollPolicy,
    ) -> Result<PollOutcome, PollError> {
        let tick = policy.tick.max(MIN_TICK);
        let started = Instant::now();
        let deadline = started.checked_add(policy.timeout);
        let mut checks = 0u32;

        self.log(format!(
            "waiting up to {:?} for {} (every {:?})",
            policy.timeout,
            condition.description(),
            tick
        ));

        loop {
            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::MAX);

            if remaining < tick {
                thread::sleep(remaining);
                let elapsed = started.elapsed();
                let err = PollError::Timeout {
                    condition: condition.description().to_string(),
                    elapsed,
                    checks,
                };
                warn!(job_id = %self.job_id, checks, ?elapsed, "completion wait timed out");
                self.log(err.to_string());
                return Err(err);
            }

            thread::sleep(tick);
            checks += 1;

            let (satisfied, outcomes) = condition.evaluate();
            for outcome in &outcomes {
                if let Err(e) = &outcome.result {
                    debug!(job_id = %self.job_id, probe = %outcome.probe, error = %e, "probe failed");
                }
                self.log(format!("check {checks}: {}", outcome.describe()));
            }

            if satisfied {
                let elapsed = started.elapsed();
                info!(job_id = %self.job_id, checks, ?elapsed, condition = condition.description(), "condition satisfied");
                self.log(format!(
                    "{} confirmed after {checks} check(s) in {elapsed:?}",
                    condition.description()
                ));
                return Ok(PollOutcome { checks, elapsed });
            }
        }
    }

    fn log(&self, line: String) {
        if let Err(e) = self.registry.add_log(&self.job_id, line) {
            debug!(job_id = %self.job_id, error = %e, "log line dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;

    use super::*;

    fn setup() -> (Arc<JobRegistry>, CompletionPoller, JobId) {
        let registry = JobRegistry::arc();
        let id = JobId::generate();
        registry.create(id.clone(), BTreeMap::new()).unwrap();
        registry.update_status(&id, 0, "polling").unwrap();
        (registry.clone(), CompletionPoller::new(registry, id.clone()), id)
    }

    #[test]
    fn succeeds_when_condition_holds_on_third_tick() {
        let (_registry, poller, _id) = setup();
        let calls = Cell::new(0);
        let mut condition = Condition::single("release installed", || {
            calls.set(calls.get() + 1);
            Ok(calls.get() >= 3)
        });

        let outcome = poller
            .wait_until(
                &mut condition,
                PollPolicy::new(Duration::from_secs(2), Duration::from_millis(20)),
            )
            .unwrap();

        assert_eq!(outcome.checks, 3);
        assert_eq!(calls.get(), 3);
        assert!(outcome.elapsed >= Duration::from_millis(60));
    }

    #[test]
    fn times_out_before_condition_becomes_true() {
        let (registry, poller, id) = setup();
        let started = Instant::now();
        let mut condition = Condition::single("release installed", || {
            Ok(started.elapsed() >= Duration::from_millis(500))
        });

        let err = poller
            .wait_until(
                &mut condition,
                PollPolicy::new(Duration::from_millis(100), Duration::from_millis(20)),
            )
            .unwrap_err();

        let PollError::Timeout {
            condition: name,
            elapsed,
            checks,
        } = &err;
        assert_eq!(name, "release installed");
        assert!(*elapsed >= Duration::from_millis(100));
        assert!(*elapsed < Duration::from_millis(500));
        assert!(*checks >= 1);
        assert!(err.to_string().contains(&format!("{elapsed:?}")));

        let job = registry.get(&id).unwrap();
        assert!(job.log_messages().any(|l| l.starts_with("timed out after")));
    }

    #[test]
    fn transient_errors_do_not_abort_the_wait() {
        let (registry, poller, id) = setup();
        let calls = Cell::new(0);
        let mut condition = Condition::single("bucket visible", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(CapabilityError::unavailable("connection reset"))
            } else {
                Ok(true)
            }
        });

        let outcome = poller
            .wait_until(
                &mut condition,
                PollPolicy::new(Duration::from_secs(2), Duration::from_millis(5)),
            )
            .unwrap();
        assert_eq!(outcome.checks, 3);

        let job = registry.get(&id).unwrap();
        let errors = job
            .log_messages()
            .filter(|l| l.contains("error: backend unavailable: connection reset"))
            .count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn any_probe_confirms_completion() {
        let (registry, poller, id) = setup();
        let mut condition = Condition::new("release removed")
            .probe("status query", || Err(CapabilityError::timeout("status api")))
            .probe("resource scan", || Ok(true));

        let outcome = poller
            .wait_until(
                &mut condition,
                PollPolicy::new(Duration::from_secs(1), Duration::from_millis(5)),
            )
            .unwrap();
        assert_eq!(outcome.checks, 1);

        let lines: Vec<String> = registry
            .get(&id)
            .unwrap()
            .log_messages()
            .filter(|l| l.starts_with("check 1:"))
            .map(str::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "check 1: status query: error: timed out: status api".to_string(),
                "check 1: resource scan: satisfied".to_string(),
            ]
        );
    }

    #[test]
    fn condition_without_probes_never_holds() {
        let (_registry, poller, _id) = setup();
        let mut condition = Condition::new("nothing");
        let result = poller.wait_until(
            &mut condition,
            PollPolicy::new(Duration::from_millis(30), Duration::from_millis(5)),
        );
        assert!(matches!(result, Err(PollError::Timeout { .. })));
    }

    #[test]
    fn timeout_shorter_than_a_tick_never_evaluates() {
        let (_registry, poller, _id) = setup();
        let calls = Cell::new(0);
        let mut condition = Condition::single("c", || {
            calls.set(calls.get() + 1);
            Ok(true)
        });
        let result = poller.wait_until(
            &mut condition,
            PollPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
        );
        assert!(matches!(result, Err(PollError::Timeout { checks: 0, .. })));
        assert_eq!(calls.get(), 0);
    }
}
