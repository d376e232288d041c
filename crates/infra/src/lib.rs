//! Runtime layer: job orchestration, client cache, services, configuration.

pub mod backends;
pub mod cache;
pub mod config;
pub mod jobs;
pub mod services;
