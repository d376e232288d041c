//! Backend client cache.
//!
//! Building a client (loading credentials, opening connections, discovering
//! API groups) is slow, so clients are cached per connection fingerprint and
//! shared as `Arc`s across jobs.
//!
//! ## Components
//!
//! - [`CacheKey`]: target system + SHA-256 of the serialized connection config
//! - [`ClientCache`]: LRU + TTL store with single-flight construction

mod client_cache;
mod key;

pub use client_cache::{CacheConfig, CacheEntryStats, CacheStats, ClientCache, DetailedCacheStats};
pub use key::CacheKey;
