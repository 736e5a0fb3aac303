//! Inventory kept in the cluster, one Secret per release in the release's
//! namespace. The Secret's `resourceVersion` is the version token.

use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use keel_core::labels::{MANAGED_BY, MANAGED_BY_VALUE, RELEASE_NAME};
use keel_persist::{check_identity, decode, encode, Inventory, InventoryStore, StoreError, Stored};
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use metrics::{counter, histogram};
use tracing::debug;

const DATA_KEY: &str = "inventory";
const SECRET_TYPE: &str = "keel.dev/inventory";

/// `keel.inventory.<release>`
pub fn secret_name(release: &str) -> String {
    format!("keel.inventory.{}", release)
}

fn split_key(key: &str) -> Result<(&str, &str), StoreError> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| StoreError::Backend(anyhow!("invalid release key {:?} (expect namespace/name)", key)))
}

fn conflict(key: &str, expected: Option<&str>, found: Option<String>) -> StoreError {
    counter!("inventory_conflict_total", 1u64);
    StoreError::Conflict { key: key.to_string(), expected: expected.map(str::to_string), found }
}

fn to_secret(inv: &Inventory, resource_version: Option<&str>) -> Result<Secret, StoreError> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(RELEASE_NAME.to_string(), inv.release.name.clone());
    let mut data = BTreeMap::new();
    data.insert(DATA_KEY.to_string(), ByteString(encode(inv)?));
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(&inv.release.name)),
            namespace: Some(inv.release.namespace.clone()),
            labels: Some(labels),
            resource_version: resource_version.map(str::to_string),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

fn from_secret(key: &str, secret: Secret) -> Result<Stored, StoreError> {
    let version = secret.metadata.resource_version.clone().unwrap_or_default();
    let blob = secret
        .data
        .and_then(|mut d| d.remove(DATA_KEY))
        .ok_or_else(|| StoreError::Backend(anyhow!("inventory secret for {} has no {:?} key", key, DATA_KEY)))?;
    Ok(Stored { inventory: decode(key, &blob.0)?, version })
}

pub struct SecretInventoryStore {
    client: Client,
}

impl SecretInventoryStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl InventoryStore for SecretInventoryStore {
    async fn load(&self, key: &str) -> Result<Option<Stored>, StoreError> {
        let (ns, name) = split_key(key)?;
        let started = std::time::Instant::now();
        let found = self.api(ns).get_opt(&secret_name(name)).await.map_err(|e| StoreError::Backend(e.into()))?;
        histogram!("inventory_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        found.map(|s| from_secret(key, s)).transpose()
    }

    async fn write(&self, inv: &Inventory, expected: Option<&str>) -> Result<String, StoreError> {
        let key = inv.key();
        let started = std::time::Instant::now();
        let api = self.api(&inv.release.namespace);
        let name = secret_name(&inv.release.name);
        let pp = PostParams::default();
        let written = match expected {
            None => match api.create(&pp, &to_secret(inv, None)?).await {
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    let found = api.get_opt(&name).await.ok().flatten().and_then(|s| s.metadata.resource_version);
                    return Err(conflict(&key, None, found));
                }
                other => other,
            },
            Some(rv) => {
                let current = api.get_opt(&name).await.map_err(|e| StoreError::Backend(e.into()))?;
                let Some(current) = current else {
                    return Err(conflict(&key, expected, None));
                };
                if current.metadata.resource_version.as_deref() != Some(rv) {
                    return Err(conflict(&key, expected, current.metadata.resource_version));
                }
                check_identity(&from_secret(&key, current)?.inventory, inv)?;
                match api.replace(&name, &pp, &to_secret(inv, Some(rv))?).await {
                    Err(kube::Error::Api(ae)) if ae.code == 409 => return Err(conflict(&key, expected, None)),
                    other => other,
                }
            }
        };
        let secret = written.map_err(|e| StoreError::Backend(anyhow!("writing inventory secret {}: {}", name, e)))?;
        histogram!("inventory_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        let version = secret.metadata.resource_version.unwrap_or_default();
        debug!(key = %key, version = %version, entries = inv.entries.len(), "inventory secret written");
        Ok(version)
    }

    async fn remove(&self, key: &str, expected: Option<&str>) -> Result<(), StoreError> {
        let (ns, name) = split_key(key)?;
        let dp = DeleteParams {
            preconditions: expected.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..Default::default()
        };
        match self.api(ns).delete(&secret_name(name), &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(conflict(key, expected, None)),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }
}
