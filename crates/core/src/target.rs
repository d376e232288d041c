//! Target systems fronted by the service and their connection settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// External system a client talks to.
///
/// Part of every cache key, so clients for different systems never collide
/// even when their connection settings serialize identically.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSystem {
    /// Container-orchestration API.
    Cluster,
    /// Package-deployment tool.
    Packages,
    /// Object-storage service.
    ObjectStorage,
    /// Backup/restore controller.
    Backup,
}

impl TargetSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Packages => "packages",
            Self::ObjectStorage => "object_storage",
            Self::Backup => "backup",
        }
    }
}

impl core::fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings needed to construct a client for one target system.
///
/// Two requests carrying equal configurations share one cached client.
/// `settings` is a `BTreeMap` so serialization order (and therefore the
/// fingerprint) does not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub target: TargetSystem,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(target: TargetSystem, endpoint: impl Into<String>) -> Self {
        Self {
            target,
            endpoint: endpoint.into(),
            context: None,
            namespace: None,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}
