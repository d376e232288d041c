use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use fleetops_core::{
    CapabilityError, CapabilityResult, HealthCheck, PackageDeployer, PackageRequest,
    ReleaseStatus, ResourceInspector, ResourceKind, ResourceRef,
};

/// Backend call that can be made to fail on demand.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackendCall {
    HealthCheck,
    ReleaseStatus,
    Install,
    Upgrade,
    Uninstall,
    ListResources,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReleaseKey {
    namespace: String,
    name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Snapshot {
    present: bool,
    version: Option<String>,
}

#[derive(Debug, Clone)]
struct Release {
    source: String,
    previous: Snapshot,
    current: Snapshot,
    changed_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    releases: HashMap<ReleaseKey, Release>,
    failures: HashMap<BackendCall, u32>,
    calls: HashMap<BackendCall, u32>,
    unhealthy: Option<String>,
}

/// In-memory package backend.
///
/// Intended for tests/dev. Accepted changes become visible after a
/// configurable lag, separately for the release status API and for the
/// resource listing, so callers have to poll for them like against a real
/// cluster.
#[derive(Debug)]
pub struct InMemoryPackageBackend {
    status_lag: Duration,
    resource_lag: Duration,
    state: Mutex<State>,
}

impl Default for InMemoryPackageBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPackageBackend {
    /// Backend where every change is visible immediately.
    pub fn new() -> Self {
        Self {
            status_lag: Duration::ZERO,
            resource_lag: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_status_lag(mut self, lag: Duration) -> Self {
        self.status_lag = lag;
        self
    }

    pub fn with_resource_lag(mut self, lag: Duration) -> Self {
        self.resource_lag = lag;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls of `call` fail with a transient error.
    pub fn fail_next(&self, call: BackendCall, times: u32) {
        self.state().failures.insert(call, times);
    }

    pub fn set_unhealthy(&self, reason: Option<&str>) {
        self.state().unhealthy = reason.map(str::to_string);
    }

    /// How many times `call` was made, failed calls included.
    pub fn calls(&self, call: BackendCall) -> u32 {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Seed a settled release, as if installed long ago.
    pub fn seed_release(&self, name: &str, namespace: &str, version: Option<&str>) {
        let snapshot = Snapshot {
            present: true,
            version: version.map(str::to_string),
        };
        self.state().releases.insert(
            key(name, namespace),
            Release {
                source: "seed".to_string(),
                previous: snapshot.clone(),
                current: snapshot,
                changed_at: Instant::now(),
            },
        );
    }

    fn enter(&self, call: BackendCall) -> CapabilityResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(call).or_default() += 1;
        if let Some(left) = state.failures.get_mut(&call).filter(|left| **left > 0) {
            *left -= 1;
            return Err(CapabilityError::unavailable(format!("{call:?} injected failure")));
        }
        Ok(state)
    }

    fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        filter: &str,
    ) -> CapabilityResult<Vec<ResourceRef>> {
        let state = self.enter(BackendCall::ListResources)?;
        let now = Instant::now();
        let mut found: Vec<ResourceRef> = state
            .releases
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .filter(|(_, r)| observed(r, self.resource_lag, now).present)
            .map(|(k, _)| ResourceRef::new(kind, namespace, resource_name(kind, &k.name)))
            .filter(|r| r.name.contains(filter))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

fn key(name: &str, namespace: &str) -> ReleaseKey {
    ReleaseKey {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn observed(release: &Release, lag: Duration, now: Instant) -> &Snapshot {
    if now.saturating_duration_since(release.changed_at) >= lag {
        &release.current
    } else {
        &release.previous
    }
}

fn resource_name(kind: ResourceKind, release: &str) -> String {
    match kind {
        ResourceKind::Pod => format!("{release}-0"),
        ResourceKind::ConfigMap => format!("{release}-config"),
        ResourceKind::Secret => format!("sh.release.v1.{release}"),
    }
}

impl HealthCheck for InMemoryPackageBackend {
    fn health_check(&self) -> CapabilityResult<()> {
        let state = self.enter(BackendCall::HealthCheck)?;
        match &state.unhealthy {
            Some(reason) => Err(CapabilityError::unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl PackageDeployer for InMemoryPackageBackend {
    fn release_status(&self, name: &str, namespace: &str) -> CapabilityResult<ReleaseStatus> {
        let state = self.enter(BackendCall::ReleaseStatus)?;
        let Some(release) = state.releases.get(&key(name, namespace)) else {
            return Ok(ReleaseStatus::absent());
        };
        let seen = observed(release, self.status_lag, Instant::now());
        if !seen.present {
            return Ok(ReleaseStatus::absent());
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("chart".to_string(), release.source.clone());
        if let Some(version) = &seen.version {
            metadata.insert("version".to_string(), version.clone());
        }
        Ok(ReleaseStatus::installed(metadata))
    }

    fn install(&self, request: &PackageRequest) -> CapabilityResult<()> {
        let mut state = self.enter(BackendCall::Install)?;
        let k = key(&request.name, &request.namespace);
        if state.releases.get(&k).is_some_and(|r| r.current.present) {
            return Err(CapabilityError::rejected(format!(
                "release {} already exists in {}",
                request.name, request.namespace
            )));
        }
        state.releases.insert(
            k,
            Release {
                source: request.source.clone(),
                previous: Snapshot::default(),
                current: Snapshot {
                    present: true,
                    version: request.version.clone(),
                },
                changed_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn upgrade(&self, request: &PackageRequest) -> CapabilityResult<()> {
        let mut state = self.enter(BackendCall::Upgrade)?;
        let release = state
            .releases
            .get_mut(&key(&request.name, &request.namespace))
            .filter(|r| r.current.present)
            .ok_or_else(|| {
                CapabilityError::not_found(format!(
                    "release {} in {}",
                    request.name, request.namespace
                ))
            })?;
        release.previous = release.current.clone();
        release.current = Snapshot {
            present: true,
            version: request.version.clone(),
        };
        release.source = request.source.clone();
        release.changed_at = Instant::now();
        Ok(())
    }

    fn uninstall(&self, name: &str, namespace: &str, dry_run: bool) -> CapabilityResult<()> {
        let mut state = self.enter(BackendCall::Uninstall)?;
        let release = state
            .releases
            .get_mut(&key(name, namespace))
            .filter(|r| r.current.present)
            .ok_or_else(|| CapabilityError::not_found(format!("release {name} in {namespace}")))?;
        if dry_run {
            return Ok(());
        }
        release.previous = release.current.clone();
        release.current = Snapshot::default();
        release.changed_at = Instant::now();
        Ok(())
    }
}

impl ResourceInspector for InMemoryPackageBackend {
    fn pods(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>> {
        self.list(ResourceKind::Pod, namespace, name)
    }

    fn config_maps(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>> {
        self.list(ResourceKind::ConfigMap, namespace, name)
    }

    fn secrets(&self, namespace: &str, name: &str) -> CapabilityResult<Vec<ResourceRef>> {
        self.list(ResourceKind::Secret, namespace, name)
    }
}
