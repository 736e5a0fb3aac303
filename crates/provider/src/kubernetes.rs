//! Built-in `kubernetes` provider.
//!
//! Component spec conventions read by these transformers:
//!
//! ```yaml
//! container: { image: nginx:1.27, ports: [{ name: http, containerPort: 80 }], env: { K: V } }
//! replicas: 2
//! expose: { type: ClusterIP, ports: [{ name: http, port: 80, targetPort: 80 }] }
//! configMaps: { settings: { data: { k: v } } }
//! secrets: { creds: { data: { k: v } } }
//! volumes: { data: { size: 1Gi, mountPath: /data, accessModes: [ReadWriteOnce] } }
//! scaling: { min: 1, max: 5, cpuUtilization: 80 }
//! httpRoute: { host: shop.example.com, path: /, port: 80 }
//! schedule: "*/5 * * * *"
//! ```

use anyhow::{anyhow, bail, Result};
use keel_core::{Transformer, TransformerContext};
use serde_json::{json, Map, Value as Json};

use crate::{Provider, RegistryError};

pub const PROVIDER: &str = "kubernetes";
pub const WORKLOAD_TYPE: &str = "workload-type";

/// The built-in provider with every transformer registered.
pub fn provider() -> Result<Provider, RegistryError> {
    let mut p = Provider::new(PROVIDER, "v1");
    for t in transformers() {
        p.register(t)?;
    }
    Ok(p)
}

fn fqn(name: &str) -> String {
    format!("{}#{}", PROVIDER, name)
}

pub fn transformers() -> Vec<Transformer> {
    vec![
        Transformer::new(fqn("deployment"), deployment)
            .describe("stateless workload as apps/v1 Deployment")
            .require_label(WORKLOAD_TYPE, "stateless")
            .require_resource("Container")
            .optional_resource("Volumes")
            .optional_trait("Scaling"),
        Transformer::new(fqn("statefulset"), statefulset)
            .describe("stateful workload as apps/v1 StatefulSet")
            .require_label(WORKLOAD_TYPE, "stateful")
            .require_resource("Container")
            .optional_resource("Volumes"),
        Transformer::new(fqn("daemonset"), daemonset)
            .describe("per-node workload as apps/v1 DaemonSet")
            .require_label(WORKLOAD_TYPE, "daemon")
            .require_resource("Container"),
        Transformer::new(fqn("job"), job)
            .describe("run-to-completion workload as batch/v1 Job")
            .require_label(WORKLOAD_TYPE, "task")
            .require_resource("Container"),
        Transformer::new(fqn("cronjob"), cronjob)
            .describe("scheduled workload as batch/v1 CronJob")
            .require_label(WORKLOAD_TYPE, "scheduled-task")
            .require_resource("Container"),
        Transformer::new(fqn("service"), service)
            .describe("network exposure as v1 Service")
            .require_resource("Container")
            .require_trait("Expose"),
        Transformer::new(fqn("configmap"), configmaps)
            .describe("config maps as v1 ConfigMap, one per entry")
            .require_resource("ConfigMaps"),
        Transformer::new(fqn("secret"), secrets)
            .describe("secrets as v1 Secret, one per entry")
            .require_resource("Secrets"),
        Transformer::new(fqn("pvc"), volumes)
            .describe("volumes as v1 PersistentVolumeClaim, one per entry")
            .require_resource("Volumes"),
        Transformer::new(fqn("serviceaccount"), service_account)
            .describe("workload identity as v1 ServiceAccount")
            .require_trait("WorkloadIdentity"),
        Transformer::new(fqn("hpa"), hpa)
            .describe("autoscaling as autoscaling/v2 HorizontalPodAutoscaler")
            .require_label(WORKLOAD_TYPE, "stateless")
            .require_trait("Scaling"),
        Transformer::new(fqn("ingress"), ingress)
            .describe("http routing as networking.k8s.io/v1 Ingress")
            .require_trait("Expose")
            .require_trait("HttpRoute"),
    ]
}

fn selector_labels(ctx: &TransformerContext) -> Json {
    json!({
        "app.kubernetes.io/name": ctx.component,
        "app.kubernetes.io/instance": ctx.release,
    })
}

fn object<'a>(spec: &'a Json, key: &str) -> Option<&'a Map<String, Json>> {
    spec.get(key).and_then(|v| v.as_object())
}

fn container(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let c = object(spec, "container").ok_or_else(|| anyhow!("spec.container is required"))?;
    let image = c
        .get("image")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("spec.container.image is required"))?;
    if ctx.strict && !image_is_pinned(image) {
        bail!("image {:?} must be pinned to a tag or digest in strict mode", image);
    }
    let mut out = Map::new();
    out.insert("name".into(), json!(ctx.component));
    out.insert("image".into(), json!(image));
    for key in ["command", "args", "ports", "resources", "readinessProbe", "livenessProbe"] {
        if let Some(v) = c.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(env) = c.get("env").and_then(|v| v.as_object()) {
        let vars: Vec<Json> = env
            .iter()
            .map(|(k, v)| match v {
                Json::String(s) => json!({ "name": k, "value": s }),
                other => json!({ "name": k, "value": other.to_string() }),
            })
            .collect();
        out.insert("env".into(), Json::Array(vars));
    }
    let mounts: Vec<Json> = object(spec, "volumes")
        .map(|vols| {
            vols.iter()
                .filter_map(|(name, v)| {
                    v.get("mountPath").and_then(|p| p.as_str()).map(|p| json!({ "name": name, "mountPath": p }))
                })
                .collect()
        })
        .unwrap_or_default();
    if !mounts.is_empty() {
        out.insert("volumeMounts".into(), Json::Array(mounts));
    }
    Ok(Json::Object(out))
}

fn image_is_pinned(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    match last.split_once(':') {
        Some((_, tag)) => !tag.is_empty() && tag != "latest",
        None => false,
    }
}

fn pod_template(spec: &Json, ctx: &TransformerContext, claim_volumes: bool) -> Result<Json> {
    let mut pod = Map::new();
    pod.insert("containers".into(), json!([container(spec, ctx)?]));
    if let Some(sa) = object(spec, "serviceAccount") {
        let name = sa.get("name").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| ctx.object_name(None));
        pod.insert("serviceAccountName".into(), json!(name));
    }
    if let Some(policy) = spec.get("restartPolicy") {
        pod.insert("restartPolicy".into(), policy.clone());
    }
    if claim_volumes {
        if let Some(vols) = object(spec, "volumes") {
            let v: Vec<Json> = vols
                .keys()
                .map(|name| json!({ "name": name, "persistentVolumeClaim": { "claimName": ctx.object_name(Some(name)) } }))
                .collect();
            if !v.is_empty() {
                pod.insert("volumes".into(), Json::Array(v));
            }
        }
    }
    Ok(json!({
        "metadata": { "labels": selector_labels(ctx) },
        "spec": pod,
    }))
}

fn replicas(spec: &Json) -> Result<i64> {
    match spec.get("replicas") {
        None => Ok(1),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(n),
            _ => bail!("spec.replicas must be a non-negative integer, got {}", v),
        },
    }
}

fn deployment(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": ctx.metadata(&name),
        "spec": {
            "replicas": replicas(spec)?,
            "selector": { "matchLabels": selector_labels(ctx) },
            "template": pod_template(spec, ctx, true)?,
        }
    }))
}

fn statefulset(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": ctx.metadata(&name),
        "spec": {
            "serviceName": name,
            "replicas": replicas(spec)?,
            "selector": { "matchLabels": selector_labels(ctx) },
            "template": pod_template(spec, ctx, true)?,
        }
    }))
}

fn daemonset(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": ctx.metadata(&name),
        "spec": {
            "selector": { "matchLabels": selector_labels(ctx) },
            "template": pod_template(spec, ctx, false)?,
        }
    }))
}

fn job_spec(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let mut tpl = pod_template(spec, ctx, true)?;
    if tpl["spec"].get("restartPolicy").is_none() {
        tpl["spec"]["restartPolicy"] = json!("Never");
    }
    let mut out = json!({ "template": tpl });
    if let Some(b) = spec.get("backoffLimit") {
        out["backoffLimit"] = b.clone();
    }
    Ok(out)
}

fn job(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": ctx.metadata(&name),
        "spec": job_spec(spec, ctx)?,
    }))
}

fn cronjob(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let schedule = spec
        .get("schedule")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("spec.schedule is required for scheduled tasks"))?;
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": ctx.metadata(&name),
        "spec": {
            "schedule": schedule,
            "jobTemplate": { "spec": job_spec(spec, ctx)? },
        }
    }))
}

fn service(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let expose = object(spec, "expose").ok_or_else(|| anyhow!("spec.expose is required by the Expose trait"))?;
    let ports = expose
        .get("ports")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| anyhow!("spec.expose.ports must list at least one port"))?;
    let svc_type = expose.get("type").and_then(|v| v.as_str()).unwrap_or("ClusterIP");
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": ctx.metadata(&name),
        "spec": {
            "type": svc_type,
            "selector": selector_labels(ctx),
            "ports": ports,
        }
    }))
}

/// Map-shaped output: one object per entry of `spec.<key>`.
fn per_entry<F>(spec: &Json, key: &str, ctx: &TransformerContext, build: F) -> Result<Json>
where
    F: Fn(&str, &Json) -> Result<Json>,
{
    let entries = object(spec, key).ok_or_else(|| anyhow!("spec.{} is required", key))?;
    let mut out = Map::new();
    for (entry, v) in entries {
        let name = ctx.object_name(Some(entry));
        out.insert(entry.clone(), build(&name, v)?);
    }
    Ok(Json::Object(out))
}

fn configmaps(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    per_entry(spec, "configMaps", ctx, |name, v| {
        Ok(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": ctx.metadata(name),
            "data": v.get("data").cloned().unwrap_or_else(|| json!({})),
        }))
    })
}

fn secrets(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    per_entry(spec, "secrets", ctx, |name, v| {
        Ok(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": ctx.metadata(name),
            "type": v.get("type").and_then(|t| t.as_str()).unwrap_or("Opaque"),
            "stringData": v.get("data").cloned().unwrap_or_else(|| json!({})),
        }))
    })
}

fn volumes(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    per_entry(spec, "volumes", ctx, |name, v| {
        let size = v
            .get("size")
            .and_then(|s| s.as_str())
            .ok_or_else(|| anyhow!("volume {} needs a size", name))?;
        let modes = v.get("accessModes").cloned().unwrap_or_else(|| json!(["ReadWriteOnce"]));
        let mut pvc = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": ctx.metadata(name),
            "spec": {
                "accessModes": modes,
                "resources": { "requests": { "storage": size } },
            }
        });
        if let Some(sc) = v.get("storageClass").and_then(|s| s.as_str()) {
            pvc["spec"]["storageClassName"] = json!(sc);
        }
        Ok(pvc)
    })
}

fn service_account(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let name = object(spec, "serviceAccount")
        .and_then(|sa| sa.get("name"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| ctx.object_name(None));
    Ok(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": ctx.metadata(&name),
    }))
}

fn hpa(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let s = object(spec, "scaling").ok_or_else(|| anyhow!("spec.scaling is required by the Scaling trait"))?;
    let min = s.get("min").and_then(|v| v.as_i64()).unwrap_or(1);
    let max = s
        .get("max")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("spec.scaling.max is required"))?;
    if max < min {
        bail!("spec.scaling.max ({}) is below min ({})", max, min);
    }
    let cpu = s.get("cpuUtilization").and_then(|v| v.as_i64()).unwrap_or(80);
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": ctx.metadata(&name),
        "spec": {
            "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": name },
            "minReplicas": min,
            "maxReplicas": max,
            "metrics": [{
                "type": "Resource",
                "resource": { "name": "cpu", "target": { "type": "Utilization", "averageUtilization": cpu } }
            }]
        }
    }))
}

fn ingress(spec: &Json, ctx: &TransformerContext) -> Result<Json> {
    let r = object(spec, "httpRoute").ok_or_else(|| anyhow!("spec.httpRoute is required by the HttpRoute trait"))?;
    let host = r.get("host").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("spec.httpRoute.host is required"))?;
    let path = r.get("path").and_then(|v| v.as_str()).unwrap_or("/");
    let port = r
        .get("port")
        .cloned()
        .or_else(|| spec.pointer("/expose/ports/0/port").cloned())
        .ok_or_else(|| anyhow!("spec.httpRoute.port is required when expose has no ports"))?;
    let name = ctx.object_name(None);
    Ok(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": ctx.metadata(&name),
        "spec": {
            "rules": [{
                "host": host,
                "http": { "paths": [{
                    "path": path,
                    "pathType": "Prefix",
                    "backend": { "service": { "name": name, "port": { "number": port } } }
                }]}
            }]
        }
    }))
}
