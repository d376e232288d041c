//! Orchestrator configuration, defaulted and overridable from the environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::jobs::{PollPolicy, RetryPolicy};

pub const WORKERS_ENV: &str = "FLEETOPS_WORKERS";
pub const RETRY_ATTEMPTS_ENV: &str = "FLEETOPS_RETRY_ATTEMPTS";
pub const RETRY_DELAY_MS_ENV: &str = "FLEETOPS_RETRY_DELAY_MS";
pub const POLL_TIMEOUT_SECS_ENV: &str = "FLEETOPS_POLL_TIMEOUT_SECS";
pub const POLL_TICK_MS_ENV: &str = "FLEETOPS_POLL_TICK_MS";
pub const CACHE_CAPACITY_ENV: &str = "FLEETOPS_CACHE_CAPACITY";
pub const CACHE_TTL_SECS_ENV: &str = "FLEETOPS_CACHE_TTL_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw,
            reason: e.to_string(),
        })
}

/// Worker pool size plus the default retry and poll policies for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            poll: PollPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Overlay values found by `lookup` on the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(workers) = parse(&lookup, WORKERS_ENV)? {
            config.workers = workers;
        }
        if let Some(attempts) = parse(&lookup, RETRY_ATTEMPTS_ENV)? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse(&lookup, RETRY_DELAY_MS_ENV)? {
            config.retry.delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, POLL_TIMEOUT_SECS_ENV)? {
            config.poll.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, POLL_TICK_MS_ENV)? {
            config.poll.tick = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `FLEETOPS_CACHE_TTL_SECS=0` disables expiry.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(capacity) = parse(&lookup, CACHE_CAPACITY_ENV)? {
            config.capacity = capacity;
        }
        match parse::<u64>(&lookup, CACHE_TTL_SECS_ENV)? {
            Some(0) => config.ttl = None,
            Some(secs) => config.ttl = Some(Duration::from_secs(secs)),
            None => {}
        }
        Ok(config)
    }
}
