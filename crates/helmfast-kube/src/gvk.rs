//! GVK identification, discovery-backed resolution and enumeration
//!
//! Watched kinds are first-class values here: a [`Gvk`] is the key for the
//! register's ownership index, the watcher's informer map and the applier's
//! prune universe. Resolution from a [`Gvk`] to an [`ApiResource`] (plural
//! name, scope) goes through server discovery and is cached per resolver
//! instance.

use kube::core::{ApiResource, GroupVersionKind, TypeMeta};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::error::{KubeError, Result};

/// Group/Version/Kind triple identifying an API resource schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Parse from an `apiVersion` string and kind.
    ///
    /// `"apps/v1"` -> group `apps`, version `v1`; `"v1"` -> core group.
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self {
            group,
            version,
            kind: kind.into(),
        }
    }

    /// The `apiVersion` form of this GVK
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn to_kube(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl From<&TypeMeta> for Gvk {
    fn from(tm: &TypeMeta) -> Self {
        Self::from_api_version(&tm.api_version, tm.kind.clone())
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Cached GVK -> (ApiResource, namespaced) resolution via server discovery
pub struct ApiResolver {
    client: Client,
    cache: RwLock<HashMap<Gvk, (ApiResource, bool)>>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Resolve a GVK to its ApiResource and whether it is namespaced.
    ///
    /// Cache misses run a full discovery pass and prime the cache for every
    /// served resource, so the first lock of a large set costs one pass.
    pub async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        if let Some(found) = self.cache.read().await.get(gvk).cloned() {
            return Ok(found);
        }

        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut cache = self.cache.write().await;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let key = Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone());
                cache.insert(key, (ar, namespaced));
            }
        }
        cache
            .get(gvk)
            .cloned()
            .ok_or_else(|| KubeError::UnknownGvk(gvk.to_string()))
    }
}

/// Enumerates every GVK the server knows about.
///
/// Only used as the prune fallback when an entry's own GVK list is unknown;
/// in that case all kinds must be considered to find orphans.
pub struct GvkLister {
    client: Client,
}

impl GvkLister {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn list(&self) -> Result<Vec<Gvk>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut gvks = Vec::new();
        for group in discovery.groups() {
            for (ar, _) in group.recommended_resources() {
                gvks.push(Gvk::new(ar.group, ar.version, ar.kind));
            }
        }
        gvks.sort();
        gvks.dedup();
        Ok(gvks)
    }
}
