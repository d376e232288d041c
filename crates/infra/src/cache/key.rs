//! Cache keys: target system + fingerprint of the connection settings.

use serde::Serialize;
use sha2::{Digest, Sha256};

use fleetops_core::{ConnectionConfig, TargetSystem};

/// Composite cache key.
///
/// Displayed as `<target>:<sha256 hex>`; pattern invalidation matches
/// substrings of that form, so `"packages:"` selects every package client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    target: TargetSystem,
    digest: String,
}

impl CacheKey {
    /// Fingerprint any serializable configuration for `target`.
    pub fn fingerprint<T: Serialize + ?Sized>(
        target: TargetSystem,
        config: &T,
    ) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(config)?;
        Ok(Self::from_bytes(target, &bytes))
    }

    /// Key for a connection configuration (the target comes from the config).
    pub fn for_connection(config: &ConnectionConfig) -> Result<Self, serde_json::Error> {
        Self::fingerprint(config.target, config)
    }

    fn from_bytes(target: TargetSystem, bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(target.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
        Self {
            target,
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn target(&self) -> TargetSystem {
        self.target
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn matches(&self, pattern: &str) -> bool {
        self.to_string().contains(pattern)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.target, self.digest)
    }
}
