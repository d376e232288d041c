//! Job record, status state machine and retry/poll policies.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetops_core::JobId;

/// Job execution status.
///
/// `Pending → Processing → {Completed | Failed}`. `Processing` is re-entered
/// on every progress update; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, background work not started yet
    Pending,
    /// Background work running (any attempt)
    Processing,
    /// Finished successfully, `result` populated
    Completed,
    /// Finished with an error, `error` populated
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            // Abandoned before the background task started.
            (JobStatus::Pending, JobStatus::Failed) => true,
            (JobStatus::Processing, JobStatus::Processing)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Tracked state of an asynchronous operation.
///
/// Serialized verbatim by the status/log/list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// 0-100, never decreases
    pub progress: u8,
    /// Latest human-readable status line
    pub message: String,
    /// Append-only history
    pub logs: Vec<JobLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Caller-supplied, immutable after creation
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, metadata: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            progress: 0,
            message: "job accepted".to_string(),
            logs: Vec::new(),
            result: None,
            error: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn push_log(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.logs.push(JobLogEntry {
            timestamp: now,
            message: message.into(),
        });
        self.updated_at = now;
    }

    /// Enter (or stay in) `Processing` with a new progress value and message.
    pub(crate) fn mark_processing(&mut self, progress: u8, message: String) {
        self.status = JobStatus::Processing;
        self.progress = self.progress.max(progress.min(100));
        self.message = message;
        self.touch();
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.message = "completed".to_string();
        self.result = Some(result);
        self.push_log("job completed");
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.message = format!("failed: {error}");
        self.push_log(format!("job failed: {error}"));
        self.error = Some(error);
    }

    /// Log messages only, without timestamps.
    pub fn log_messages(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(|l| l.message.as_str())
    }
}

/// Retry policy: bounded attempts, fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (0 is treated as 1)
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Effective number of attempts.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Progress percentage reported before `attempt` (1-indexed).
    pub fn progress_before(&self, attempt: u32) -> u8 {
        let max = self.attempts();
        let done = attempt.saturating_sub(1).min(max);
        (done * 100 / max) as u8
    }
}

/// Completion polling policy: absolute timeout, fixed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    #[serde(with = "duration_millis")]
    pub tick: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            tick: Duration::from_secs(5),
        }
    }
}

impl PollPolicy {
    pub fn new(timeout: Duration, tick: Duration) -> Self {
        Self { timeout, tick }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
