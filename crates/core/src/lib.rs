//! Keel core types: components, transformers, resources and inventory identities.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

pub mod error;
pub mod labels;
pub mod weights;

pub use error::{
    DecodeError, RenderError, TransformError, UnmatchedComponent, UnmatchedComponentError,
    ValidationError,
};

/// Ordered label map; ordering keeps every rendered artefact deterministic.
pub type Labels = BTreeMap<String, String>;

/// A named unit of desired state, already evaluated and concrete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Declared resource capabilities (e.g. `Container`, `Volumes`).
    #[serde(default, alias = "resources")]
    pub declared_resources: BTreeSet<String>,
    /// Declared traits (e.g. `Expose`, `Scaling`).
    #[serde(default, alias = "traits")]
    pub declared_traits: BTreeSet<String>,
    /// Opaque payload handed read-only to transforms.
    #[serde(default = "empty_spec")]
    pub spec: Json,
}

fn empty_spec() -> Json {
    Json::Object(serde_json::Map::new())
}

impl Component {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            declared_resources: BTreeSet::new(),
            declared_traits: BTreeSet::new(),
            spec: empty_spec(),
        }
    }

    pub fn with_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.labels.insert(k.into(), v.into());
        self
    }

    pub fn with_resource(mut self, r: impl Into<String>) -> Self {
        self.declared_resources.insert(r.into());
        self
    }

    pub fn with_trait(mut self, t: impl Into<String>) -> Self {
        self.declared_traits.insert(t.into());
        self
    }

    pub fn with_spec(mut self, spec: Json) -> Self {
        self.spec = spec;
        self
    }
}

/// A set of label/resource/trait requirements a transformer declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirements {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub traits: BTreeSet<String>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.resources.is_empty() && self.traits.is_empty()
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if !self.labels.is_empty() {
            let l: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            parts.push(format!("labels[{}]", l.join(",")));
        }
        if !self.resources.is_empty() {
            let r: Vec<&str> = self.resources.iter().map(String::as_str).collect();
            parts.push(format!("resources[{}]", r.join(",")));
        }
        if !self.traits.is_empty() {
            let t: Vec<&str> = self.traits.iter().map(String::as_str).collect();
            parts.push(format!("traits[{}]", t.join(",")));
        }
        f.write_str(&parts.join(" "))
    }
}

/// Pure transform: component spec + per-match context to one or more manifests.
pub type TransformFn = fn(&Json, &TransformerContext) -> anyhow::Result<Json>;

/// Capability descriptor plus transform function.
#[derive(Clone)]
pub struct Transformer {
    /// Fully qualified name, e.g. `kubernetes#deployment`.
    pub fqn: String,
    pub description: String,
    pub required: Requirements,
    pub optional: Requirements,
    pub transform: TransformFn,
}

impl Transformer {
    pub fn new(fqn: impl Into<String>, transform: TransformFn) -> Self {
        Self {
            fqn: fqn.into(),
            description: String::new(),
            required: Requirements::default(),
            optional: Requirements::default(),
            transform,
        }
    }

    pub fn describe(mut self, d: impl Into<String>) -> Self {
        self.description = d.into();
        self
    }

    pub fn require_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.required.labels.insert(k.into(), v.into());
        self
    }

    pub fn require_resource(mut self, r: impl Into<String>) -> Self {
        self.required.resources.insert(r.into());
        self
    }

    pub fn require_trait(mut self, t: impl Into<String>) -> Self {
        self.required.traits.insert(t.into());
        self
    }

    pub fn optional_resource(mut self, r: impl Into<String>) -> Self {
        self.optional.resources.insert(r.into());
        self
    }

    pub fn optional_trait(mut self, t: impl Into<String>) -> Self {
        self.optional.traits.insert(t.into());
        self
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("fqn", &self.fqn)
            .field("required", &self.required)
            .field("optional", &self.optional)
            .finish_non_exhaustive()
    }
}

/// Per-match invocation data. Built fresh for every match and owned by one task.
#[derive(Debug, Clone)]
pub struct TransformerContext {
    pub release: String,
    pub namespace: String,
    pub version: String,
    pub provider: String,
    pub component: String,
    pub timestamp: DateTime<Utc>,
    pub strict: bool,
    /// Component labels merged with ownership labels.
    pub labels: Labels,
}

impl TransformerContext {
    /// Resource name for a component, optionally suffixed.
    pub fn object_name(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(s) if !s.is_empty() => format!("{}-{}", self.component, s),
            _ => self.component.clone(),
        }
    }

    /// `metadata` block with name, namespace and merged labels.
    pub fn metadata(&self, name: &str) -> Json {
        serde_json::json!({
            "name": name,
            "namespace": self.namespace,
            "labels": self.labels,
        })
    }
}

/// A rendered manifest attributed to its component and transformer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub data: Json,
    pub source_component: String,
    pub source_transformer: String,
}

impl Resource {
    /// Decode a single manifest object. Falls back to `default_ns` for namespaced
    /// kinds that omit `metadata.namespace`.
    pub fn from_object(
        data: Json,
        default_ns: &str,
        component: &str,
        transformer: &str,
    ) -> Result<Self, DecodeError> {
        let api_version = data
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or(DecodeError::Missing("apiVersion"))?
            .to_string();
        let kind = data
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or(DecodeError::Missing("kind"))?
            .to_string();
        let meta = data.get("metadata").ok_or(DecodeError::Missing("metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::Missing("metadata.name"))?
            .to_string();
        let namespace = if weights::is_cluster_scoped(&kind) {
            String::new()
        } else {
            meta.get("namespace")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(default_ns)
                .to_string()
        };
        let mut res = Self {
            api_version,
            kind,
            namespace,
            name,
            data,
            source_component: component.to_string(),
            source_transformer: transformer.to_string(),
        };
        res.sync_namespace();
        Ok(res)
    }

    /// Group portion of `apiVersion` (empty for the core group).
    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    pub fn version(&self) -> &str {
        split_api_version(&self.api_version).1
    }

    pub fn weight(&self) -> i32 {
        weights::creation_weight(self.group(), &self.kind)
    }

    pub fn entry(&self) -> InventoryEntry {
        InventoryEntry {
            group: self.group().to_string(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            component: self.source_component.clone(),
            version: self.version().to_string(),
        }
    }

    /// Set ownership labels in `metadata.labels`. They replace whatever the
    /// transform wrote under the same keys; other labels are untouched.
    pub fn stamp_labels(&mut self, ownership: &Labels) {
        let Some(meta) = self.data.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
            return;
        };
        let slot = meta
            .entry("labels")
            .or_insert_with(|| Json::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = Json::Object(serde_json::Map::new());
        }
        if let Some(obj) = slot.as_object_mut() {
            for (k, v) in ownership {
                obj.insert(k.clone(), Json::String(v.clone()));
            }
        }
    }

    fn sync_namespace(&mut self) {
        let ns = self.namespace.clone();
        if let Some(meta) = self.data.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            if ns.is_empty() {
                meta.remove("namespace");
            } else {
                meta.insert("namespace".into(), Json::String(ns));
            }
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.entry(), f)
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Kubernetes identity of an object, ignoring which component declared it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Identity of one applied resource, persisted in the inventory.
///
/// Equality, ordering and hashing cover group, kind, namespace, name and
/// component. `version` is carried for API lookups only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub component: String,
    #[serde(default)]
    pub version: String,
}

impl InventoryEntry {
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Same Kubernetes object, regardless of component.
    pub fn same_object(&self, other: &InventoryEntry) -> bool {
        self.group == other.group
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn weight(&self) -> i32 {
        weights::creation_weight(&self.group, &self.kind)
    }

    pub fn is_namespace(&self) -> bool {
        self.group.is_empty() && self.kind == "Namespace"
    }

    fn identity(&self) -> (&str, &str, &str, &str, &str) {
        (&self.group, &self.kind, &self.namespace, &self.name, &self.component)
    }
}

impl PartialEq for InventoryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for InventoryEntry {}

impl Hash for InventoryEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for InventoryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InventoryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl fmt::Display for InventoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}.{}", self.kind, self.group)
        };
        if self.namespace.is_empty() {
            write!(f, "{}/{} ({})", gk, self.name, self.component)
        } else {
            write!(f, "{}/{}/{} ({})", gk, self.namespace, self.name, self.component)
        }
    }
}

/// Sort entries in apply order: creation weight ascending, then identity.
pub fn sort_for_apply(entries: &mut [InventoryEntry]) {
    entries.sort_by(|a, b| a.weight().cmp(&b.weight()).then_with(|| a.cmp(b)));
}

/// Sort resources in apply order: creation weight ascending, then identity.
pub fn sort_resources(resources: &mut [Resource]) {
    resources.sort_by(|a, b| {
        a.weight()
            .cmp(&b.weight())
            .then_with(|| a.entry().cmp(&b.entry()))
            .then_with(|| a.source_transformer.cmp(&b.source_transformer))
    });
}

const KEEL_UUID_NAMESPACE: Uuid = Uuid::from_u128(0x6b65_656c_2d72_656c_6561_7365_2d69_6400);

/// Write-once identity of a release and the module it deploys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseIdentity {
    pub name: String,
    pub namespace: String,
    pub uuid: Uuid,
    pub module_name: String,
    pub module_uuid: Uuid,
}

impl ReleaseIdentity {
    /// Derive stable identifiers from names alone so every client agrees.
    pub fn derive(name: &str, namespace: &str, module_name: &str) -> Self {
        let uuid = Uuid::new_v5(&KEEL_UUID_NAMESPACE, format!("{}/{}", namespace, name).as_bytes());
        let module_uuid = Uuid::new_v5(&KEEL_UUID_NAMESPACE, format!("module:{}", module_name).as_bytes());
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uuid,
            module_name: module_name.to_string(),
            module_uuid,
        }
    }

    /// Storage key for this release's inventory record.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

pub mod prelude {
    pub use super::{
        Component, InventoryEntry, Labels, ObjectKey, ReleaseIdentity, Requirements, Resource,
        Transformer, TransformerContext, TransformFn,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, name: &str, component: &str) -> InventoryEntry {
        InventoryEntry {
            group: "apps".into(),
            kind: kind.into(),
            namespace: "default".into(),
            name: name.into(),
            component: component.into(),
            version: "v1".into(),
        }
    }

    #[test]
    fn entry_equality_includes_component_but_not_version() {
        let a = entry("Deployment", "app", "web");
        let mut b = a.clone();
        b.version = "v2".into();
        assert_eq!(a, b);
        let c = entry("Deployment", "app", "frontend");
        assert_ne!(a, c);
        assert!(a.same_object(&c));
    }

    #[test]
    fn decode_single_object_defaults_namespace() {
        let obj = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web" },
            "spec": {}
        });
        let r = Resource::from_object(obj, "prod", "web", "kubernetes#deployment").unwrap();
        assert_eq!(r.group(), "apps");
        assert_eq!(r.version(), "v1");
        assert_eq!(r.namespace, "prod");
        assert_eq!(r.data["metadata"]["namespace"], "prod");
    }

    #[test]
    fn decode_cluster_scoped_drops_namespace() {
        let obj = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "team-a", "namespace": "ignored" }
        });
        let r = Resource::from_object(obj, "prod", "ns", "t").unwrap();
        assert_eq!(r.namespace, "");
        assert!(r.data["metadata"].get("namespace").is_none());
        assert!(r.entry().is_namespace());
    }

    #[test]
    fn decode_reports_missing_fields() {
        let obj = serde_json::json!({ "kind": "ConfigMap", "metadata": { "name": "x" } });
        let err = Resource::from_object(obj, "ns", "c", "t").unwrap_err();
        assert!(err.to_string().contains("apiVersion"), "err={}", err);
        let obj = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
        let err = Resource::from_object(obj, "ns", "c", "t").unwrap_err();
        assert!(err.to_string().contains("metadata.name"), "err={}", err);
    }

    #[test]
    fn ownership_labels_override_transform_labels() {
        let obj = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "labels": { "team": "a", "app.kubernetes.io/managed-by": "helm", "keel.dev/release-uuid": "forged" }
            }
        });
        let mut r = Resource::from_object(obj, "ns", "c", "t").unwrap();
        let release = ReleaseIdentity::derive("shop", "prod", "example.com/shop");
        let owned = labels::ownership_labels(&release, "c");
        r.stamp_labels(&owned);
        let got = &r.data["metadata"]["labels"];
        assert_eq!(got["team"], "a");
        assert_eq!(got["app.kubernetes.io/managed-by"], "keel");
        assert_eq!(got["keel.dev/release-uuid"], release.uuid.to_string());
        let live: Labels = serde_json::from_value(got.clone()).unwrap();
        assert_eq!(labels::ownership(&live, &release), labels::Ownership::Release);
    }

    #[test]
    fn stamp_labels_replaces_malformed_label_block() {
        let obj = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x", "labels": null } });
        let mut r = Resource::from_object(obj, "ns", "c", "t").unwrap();
        let mut l = Labels::new();
        l.insert("app.kubernetes.io/managed-by".into(), "keel".into());
        r.stamp_labels(&l);
        assert_eq!(r.data["metadata"]["labels"]["app.kubernetes.io/managed-by"], "keel");
    }

    #[test]
    fn release_identity_is_stable() {
        let a = ReleaseIdentity::derive("shop", "prod", "example.com/shop");
        let b = ReleaseIdentity::derive("shop", "prod", "example.com/shop");
        assert_eq!(a, b);
        let c = ReleaseIdentity::derive("shop", "staging", "example.com/shop");
        assert_ne!(a.uuid, c.uuid);
        assert_eq!(a.module_uuid, c.module_uuid);
        assert_eq!(a.key(), "prod/shop");
    }

    #[test]
    fn requirements_display_lists_sets() {
        let t = Transformer::new("k#d", |_, _| Ok(Json::Null))
            .require_label("workload-type", "stateless")
            .require_resource("Container");
        assert_eq!(t.required.to_string(), "labels[workload-type=stateless] resources[Container]");
        assert_eq!(Requirements::default().to_string(), "(none)");
    }
}
