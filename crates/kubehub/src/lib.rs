//! Keel kubehub: the cluster side of the pipeline, over kube-rs.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use keel_apply::Applier;
use keel_core::{split_api_version, InventoryEntry, Resource};
use keel_reconcile::{DeleteError, Deleter, LiveLookup, LiveObject};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PropagationPolicy},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tracing::{debug, info};

mod health;
mod secret_store;

pub use health::readiness;
pub use secret_store::{secret_name, SecretInventoryStore};

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "keel";

pub fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = split_api_version(api_version);
    GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

/// A cluster reached through one client, with a lazily run discovery cache.
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: RwLock::new(None) }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn run_discovery(&self) -> Result<Arc<Discovery>> {
        let started = std::time::Instant::now();
        let d = Arc::new(Discovery::new(self.client.clone()).run().await.context("running API discovery")?);
        histogram!("discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        *self.discovery.write().await = Some(d.clone());
        Ok(d)
    }

    /// Resolve a GVK, rediscovering once on a miss so kinds whose CRD was
    /// applied earlier in the same run are found. `None` if not served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
        let cached = self.discovery.read().await.clone();
        let d = match cached {
            Some(d) => d,
            None => self.run_discovery().await?,
        };
        if let Some((ar, caps)) = d.resolve_gvk(gvk) {
            return Ok(Some((ar, matches!(caps.scope, Scope::Namespaced))));
        }
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "kind not in discovery cache; refreshing");
        let d = self.run_discovery().await?;
        Ok(d.resolve_gvk(gvk).map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced))))
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Option<Api<DynamicObject>>> {
        let Some((ar, namespaced)) = self.resolve(gvk).await? else {
            return Ok(None);
        };
        let api = if namespaced {
            if namespace.is_empty() {
                return Err(anyhow!("namespace required for namespaced kind {}", gvk.kind));
            }
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(Some(api))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        self.api(gvk, namespace)
            .await?
            .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

fn entry_gvk(entry: &InventoryEntry) -> GroupVersionKind {
    GroupVersionKind { group: entry.group.clone(), version: entry.version.clone(), kind: entry.kind.clone() }
}

#[async_trait]
impl Applier for KubeCluster {
    async fn apply(&self, resource: &Resource, dry_run: bool) -> Result<()> {
        let t0 = std::time::Instant::now();
        let gvk = gvk_of(&resource.api_version, &resource.kind);
        let api = self.api_for(&gvk, &resource.namespace).await?;
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        match api.patch(&resource.name, &pp, &Patch::Apply(&resource.data)).await {
            Ok(obj) => {
                histogram!("ssa_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                debug!(resource = %resource, rv = ?obj.metadata.resource_version, dry_run, "applied");
                Ok(())
            }
            Err(e) => {
                counter!("ssa_err", 1u64);
                if dry_run {
                    Err(anyhow!("dry-run failed: {}", e))
                } else {
                    Err(anyhow!("server-side apply failed: {}", e))
                }
            }
        }
    }

    async fn fetch(&self, resource: &Resource) -> Result<Option<serde_json::Value>> {
        let gvk = gvk_of(&resource.api_version, &resource.kind);
        let Some(api) = self.api(&gvk, &resource.namespace).await? else {
            return Ok(None);
        };
        match api.get_opt(&resource.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj).context("serializing DynamicObject")?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LiveLookup for KubeCluster {
    async fn get(&self, entry: &InventoryEntry) -> Result<Option<LiveObject>> {
        let Some(api) = self.api(&entry_gvk(entry), &entry.namespace).await? else {
            return Ok(None);
        };
        let Some(obj) = api.get_opt(&entry.name).await? else {
            return Ok(None);
        };
        let raw = serde_json::to_value(&obj).context("serializing DynamicObject")?;
        Ok(Some(LiveObject {
            labels: obj.metadata.labels.clone().unwrap_or_default(),
            deleting: obj.metadata.deletion_timestamp.is_some(),
            ready: readiness(&entry.kind, &raw),
        }))
    }
}

#[async_trait]
impl Deleter for KubeCluster {
    async fn delete(&self, entry: &InventoryEntry) -> Result<(), DeleteError> {
        // A kind the server no longer serves has no objects left.
        let Some(api) = self.api(&entry_gvk(entry), &entry.namespace).await? else {
            return Err(DeleteError::NotFound);
        };
        let dp = DeleteParams { propagation_policy: Some(PropagationPolicy::Background), ..Default::default() };
        match api.delete(&entry.name, &dp).await {
            Ok(_) => {
                info!(entry = %entry, "delete requested");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(DeleteError::NotFound),
            Err(e) => Err(DeleteError::Other(anyhow!("deleting {}: {}", entry, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_from_api_version() {
        let core = gvk_of("v1", "ConfigMap");
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
        let apps = gvk_of("apps/v1", "Deployment");
        assert_eq!((apps.group.as_str(), apps.version.as_str(), apps.kind.as_str()), ("apps", "v1", "Deployment"));
    }
}
