//! LRU cache of constructed backend clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleetops_core::TargetSystem;

use super::key::CacheKey;

/// Cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live clients (at least 1)
    pub capacity: usize,
    /// Age after which an entry is rebuilt; `None` keeps entries until evicted
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }
}

/// Cache counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    /// hits / (hits + misses), 0 when nothing was requested yet
    pub hit_rate: f64,
}

/// Per-entry view for cache debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntryStats {
    pub key: String,
    pub target: TargetSystem,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub hits: u64,
}

/// Counters plus every live entry, most recently used first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedCacheStats {
    pub stats: CacheStats,
    pub entries: Vec<CacheEntryStats>,
}

struct Entry<C: ?Sized> {
    client: Arc<C>,
    created_at: Instant,
    last_access_at: Instant,
    // Monotonic access sequence; orders LRU without clock ties.
    access_seq: u64,
    hits: u64,
}

struct State<C: ?Sized> {
    entries: HashMap<CacheKey, Entry<C>>,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
    // Bumped by every invalidation; a build that sees it change does not
    // cache its client.
    epoch: u64,
}

impl<C: ?Sized> State<C> {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn evict_lru(&mut self) -> Option<CacheKey> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.access_seq)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&oldest);
        self.evictions += 1;
        Some(oldest)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keyed cache of expensive-to-build clients.
///
/// - Lookups refresh recency; inserting at capacity evicts the least recently
///   used entry
/// - Entries older than the TTL are rebuilt on next use
/// - Construction is single-flight per key: concurrent callers for the same
///   missing key wait for one factory call, callers for other keys do not
/// - No lock is held while a factory runs except that key's own gate
pub struct ClientCache<C: ?Sized> {
    config: CacheConfig,
    state: Mutex<State<C>>,
    building: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl<C: ?Sized> std::fmt::Debug for ClientCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

impl<C: ?Sized> Default for ClientCache<C> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<C: ?Sized> ClientCache<C> {
    pub fn new(config: CacheConfig) -> Self {
        let config = CacheConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                invalidations: 0,
                epoch: 0,
            }),
            building: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live (unexpired) entry exists, without touching recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = lock(&self.state);
        state
            .entries
            .get(key)
            .is_some_and(|e| !self.is_expired(e, Instant::now()))
    }

    fn is_expired(&self, entry: &Entry<C>, now: Instant) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| now.saturating_duration_since(entry.created_at) >= ttl)
    }

    /// Return the cached client for `key`, building it with `factory` when
    /// missing or expired.
    ///
    /// Factory errors are returned to the caller and nothing is cached.
    pub fn get_or_create<F, E>(&self, key: &CacheKey, factory: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Result<Arc<C>, E>,
    {
        if let Some(client) = self.lookup(key) {
            return Ok(client);
        }

        let gate = BuildGate::enter(self, key);
        let _building = gate.wait();
        match self.lookup(key) {
            // Built by whoever held the gate before us.
            Some(client) => Ok(client),
            None => self.build(key, factory),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<C>> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let now = Instant::now();

        let expired = self.is_expired(state.entries.get(key)?, now);
        if expired {
            state.entries.remove(key);
            state.expirations += 1;
            debug!(key = %key, "cached client expired");
            return None;
        }

        let seq = state.next_seq();
        let entry = state.entries.get_mut(key)?;
        entry.access_seq = seq;
        entry.last_access_at = now;
        entry.hits += 1;
        state.hits += 1;
        Some(entry.client.clone())
    }

    fn build<F, E>(&self, key: &CacheKey, factory: F) -> Result<Arc<C>, E>
    where
        F: FnOnce() -> Result<Arc<C>, E>,
    {
        let epoch = {
            let mut state = lock(&self.state);
            state.misses += 1;
            state.epoch
        };
        let started = Instant::now();
        let client = factory()?;
        debug!(key = %key, elapsed = ?started.elapsed(), "client constructed");

        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.epoch != epoch {
            debug!(key = %key, "cache invalidated during construction, client not cached");
            return Ok(client);
        }
        while state.entries.len() >= self.config.capacity && !state.entries.contains_key(key) {
            match state.evict_lru() {
                Some(evicted) => debug!(key = %evicted, "evicted least recently used client"),
                None => break,
            }
        }

        let now = Instant::now();
        let seq = state.next_seq();
        state.entries.insert(
            key.clone(),
            Entry {
                client: client.clone(),
                created_at: now,
                last_access_at: now,
                access_seq: seq,
                hits: 0,
            },
        );
        Ok(client)
    }

    /// Drop one entry. Returns whether it existed.
    ///
    /// A construction in flight when this runs hands its client to its
    /// callers without caching it.
    pub fn clean_by_key(&self, key: &CacheKey) -> bool {
        let mut state = lock(&self.state);
        state.epoch += 1;
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.invalidations += 1;
            info!(key = %key, "cached client invalidated");
        }
        removed
    }

    /// Drop every entry whose `<target>:<digest>` form contains `pattern`.
    pub fn clean_by_pattern(&self, pattern: &str) -> usize {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.epoch += 1;
        let before = state.entries.len();
        state.entries.retain(|k, _| !k.matches(pattern));
        let removed = before - state.entries.len();
        state.invalidations += removed as u64;
        info!(pattern, removed, "cached clients invalidated by pattern");
        removed
    }

    /// Sweep expired entries. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let before = state.entries.len();
        state.entries.retain(|_, e| !self.is_expired(e, now));
        let removed = before - state.entries.len();
        state.expirations += removed as u64;
        if removed > 0 {
            info!(removed, "expired cached clients swept");
        }
        removed
    }

    /// Drop everything.
    pub fn clear(&self) -> usize {
        let mut state = lock(&self.state);
        state.epoch += 1;
        let removed = state.entries.len();
        state.entries.clear();
        state.invalidations += removed as u64;
        info!(removed, "client cache cleared");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        self.stats_locked(&state)
    }

    fn stats_locked(&self, state: &State<C>) -> CacheStats {
        let requests = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            capacity: self.config.capacity,
            ttl_secs: self.config.ttl.map(|t| t.as_secs()),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            invalidations: state.invalidations,
            hit_rate: if requests == 0 {
                0.0
            } else {
                state.hits as f64 / requests as f64
            },
        }
    }

    pub fn detailed_stats(&self) -> DetailedCacheStats {
        let state = lock(&self.state);
        let now = Instant::now();

        let mut ordered: Vec<(&CacheKey, &Entry<C>)> = state.entries.iter().collect();
        ordered.sort_by(|a, b| b.1.access_seq.cmp(&a.1.access_seq));

        let entries = ordered
            .into_iter()
            .map(|(key, entry)| CacheEntryStats {
                key: key.to_string(),
                target: key.target(),
                age_ms: now.saturating_duration_since(entry.created_at).as_millis() as u64,
                idle_ms: now.saturating_duration_since(entry.last_access_at).as_millis() as u64,
                hits: entry.hits,
            })
            .collect();

        DetailedCacheStats {
            stats: self.stats_locked(&state),
            entries,
        }
    }
}

/// A key's single-flight gate, released on drop so a panicking factory
/// does not leave it behind.
struct BuildGate<'a, C: ?Sized> {
    cache: &'a ClientCache<C>,
    key: &'a CacheKey,
    gate: Option<Arc<Mutex<()>>>,
}

impl<'a, C: ?Sized> BuildGate<'a, C> {
    fn enter(cache: &'a ClientCache<C>, key: &'a CacheKey) -> Self {
        let gate = lock(&cache.building).entry(key.clone()).or_default().clone();
        Self {
            cache,
            key,
            gate: Some(gate),
        }
    }

    fn wait(&self) -> Option<MutexGuard<'_, ()>> {
        self.gate.as_deref().map(lock)
    }
}

impl<C: ?Sized> Drop for BuildGate<'_, C> {
    // Gate clones are only taken and dropped under the `building` lock, so
    // the count seen here is exact.
    fn drop(&mut self) {
        let Some(gate) = self.gate.take() else {
            return;
        };
        let mut building = lock(&self.cache.building);
        let idle = Arc::strong_count(&gate) <= 2
            && building.get(self.key).is_some_and(|g| Arc::ptr_eq(g, &gate));
        drop(gate);
        if idle {
            building.remove(self.key);
        }
    }
}
