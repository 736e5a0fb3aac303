//! Bounded, cancellable execution of a match plan.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use keel_core::labels::ownership_labels;
use keel_core::{sort_resources, DecodeError, Labels, ReleaseIdentity, Resource, TransformError, Transformer, TransformerContext};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eval::{EvalError, Evaluation};
use crate::matcher::MatchPlan;

/// Options threaded through a render. No process-wide state is consulted.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub release: ReleaseIdentity,
    /// Module version handed to transforms.
    pub version: String,
    pub strict: bool,
    /// Upper bound on concurrently running transforms.
    pub max_concurrency: usize,
    /// Fixed render timestamp; `None` stamps the time execution starts.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RenderOptions {
    pub fn new(release: ReleaseIdentity) -> Self {
        Self {
            release,
            version: String::new(),
            strict: false,
            max_concurrency: default_concurrency(),
            timestamp: None,
        }
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Everything execution produced. `resources` is deduplicated and sorted.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub resources: Vec<Resource>,
    pub errors: Vec<TransformError>,
    pub cancelled: bool,
}

/// Inputs for one match, all owned so the task touches nothing shared.
struct Job {
    component: String,
    transformer: Transformer,
    source: Arc<[u8]>,
    ctx: TransformerContext,
    ownership: Labels,
}

struct JobResult {
    component: String,
    transformer: String,
    outcome: Result<Vec<Resource>, String>,
}

/// Run every match of `plan` on a bounded pool.
///
/// Failing matches are recorded and the rest keep running. Once `cancel` fires
/// no further match is started; matches already running finish and their
/// output is kept.
pub async fn execute(plan: &MatchPlan, provider: &str, opts: &RenderOptions, cancel: &CancellationToken) -> ExecOutcome {
    let started = Instant::now();
    let limit = opts.max_concurrency.max(1);
    let sem = Arc::new(Semaphore::new(limit));
    let timestamp = opts.timestamp.unwrap_or_else(Utc::now);

    // Serialize each component spec once; workers rebuild from these bytes.
    let mut sources: HashMap<&str, Arc<[u8]>> = HashMap::new();
    let mut out = ExecOutcome::default();
    for m in &plan.matches {
        if sources.contains_key(m.component.name.as_str()) {
            continue;
        }
        match serde_json::to_vec(&m.component.spec) {
            Ok(bytes) => {
                sources.insert(m.component.name.as_str(), Arc::from(bytes));
            }
            Err(e) => out.errors.push(TransformError {
                component: m.component.name.clone(),
                transformer: m.transformer.fqn.clone(),
                cause: format!("serializing spec: {}", e),
            }),
        }
    }

    let mut set: JoinSet<JobResult> = JoinSet::new();
    let mut started_jobs = 0usize;
    for m in &plan.matches {
        let Some(source) = sources.get(m.component.name.as_str()) else { continue };
        if cancel.is_cancelled() {
            out.cancelled = true;
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => { out.cancelled = true; break; }
            p = Arc::clone(&sem).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let mut labels = m.component.labels.clone();
        let ownership = ownership_labels(&opts.release, &m.component.name);
        labels.extend(ownership.clone());
        let job = Job {
            component: m.component.name.clone(),
            transformer: m.transformer.clone(),
            source: Arc::clone(source),
            ctx: TransformerContext {
                release: opts.release.name.clone(),
                namespace: opts.release.namespace.clone(),
                version: opts.version.clone(),
                provider: provider.to_string(),
                component: m.component.name.clone(),
                timestamp,
                strict: opts.strict,
                labels,
            },
            ownership,
        };
        debug!(component = %job.component, transformer = %job.transformer.fqn, "transform scheduled");
        started_jobs += 1;
        set.spawn_blocking(move || {
            let _permit = permit;
            run_job(job)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(JobResult { outcome: Ok(rs), .. }) => out.resources.extend(rs),
            Ok(JobResult { component, transformer, outcome: Err(cause) }) => {
                counter!("exec_transform_err", 1u64);
                warn!(component = %component, transformer = %transformer, cause = %cause, "transform failed");
                out.errors.push(TransformError { component, transformer, cause });
            }
            Err(e) => {
                // Lost output must fail the render, never shrink it.
                warn!(error = %e, "transform task did not complete");
                out.errors.push(TransformError {
                    component: "(unknown)".into(),
                    transformer: "(unknown)".into(),
                    cause: format!("task did not complete: {}", e),
                });
            }
        }
    }

    let conflicts = dedupe(&mut out.resources);
    out.errors.extend(conflicts);
    out.errors.sort_by(|a, b| a.component.cmp(&b.component).then_with(|| a.transformer.cmp(&b.transformer)));
    histogram!("exec_total_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(
        matches = plan.matches.len(),
        started = started_jobs,
        resources = out.resources.len(),
        errors = out.errors.len(),
        cancelled = out.cancelled,
        "execution finished"
    );
    out
}

fn run_job(job: Job) -> JobResult {
    let t0 = Instant::now();
    let Job { component, transformer, source, ctx, ownership } = job;
    let namespace = ctx.namespace.clone();
    let eval = Evaluation::new();
    let produced = eval
        .load(&source)
        .and_then(|spec| eval.apply(&transformer, &spec, &eval.bind(ctx)))
        .and_then(|v| eval.take(v));
    let outcome = match produced {
        Ok(value) => decode_output(value, &namespace, &component, &transformer.fqn)
            .map(|mut rs| {
                for r in rs.iter_mut() {
                    r.stamp_labels(&ownership);
                }
                rs
            })
            .map_err(|e| e.to_string()),
        Err(EvalError::Transform(e)) => Err(format!("{:#}", e)),
        Err(e) => Err(e.to_string()),
    };
    histogram!("exec_transform_ms", t0.elapsed().as_secs_f64() * 1000.0);
    JobResult { component, transformer: transformer.fqn, outcome }
}

/// Decode any of the three legal output shapes: a single object, a list of
/// objects, or a map of objects (decoded in key order).
pub fn decode_output(value: Json, default_ns: &str, component: &str, transformer: &str) -> Result<Vec<Resource>, DecodeError> {
    // A manifest header marks a single object, even a malformed one.
    let single = value.get("apiVersion").is_some() || value.get("kind").is_some();
    let items: Vec<Json> = match value {
        _ if single => vec![value],
        Json::Array(items) => items,
        Json::Object(obj) => {
            let sorted: BTreeMap<String, Json> = obj.into_iter().collect();
            sorted.into_values().collect()
        }
        Json::Null => return Err(DecodeError::Shape("null")),
        Json::Bool(_) => return Err(DecodeError::Shape("bool")),
        Json::Number(_) => return Err(DecodeError::Shape("number")),
        Json::String(_) => return Err(DecodeError::Shape("string")),
    };
    items
        .into_iter()
        .map(|item| {
            if !item.is_object() {
                return Err(DecodeError::Shape("collection of non-objects"));
            }
            Resource::from_object(item, default_ns, component, transformer)
        })
        .collect()
}

/// Sort and drop resources with the same identity. Identical payloads collapse
/// silently; differing payloads are reported as conflicts, and so is one
/// cluster object rendered by two components.
fn dedupe(resources: &mut Vec<Resource>) -> Vec<TransformError> {
    sort_resources(resources);
    let mut conflicts = Vec::new();
    let mut kept: Vec<Resource> = Vec::with_capacity(resources.len());
    for r in resources.drain(..) {
        let Some(prev) = kept.last() else {
            kept.push(r);
            continue;
        };
        let (a, b) = (prev.entry(), r.entry());
        if a == b {
            if prev.data != r.data {
                conflicts.push(TransformError {
                    component: r.source_component.clone(),
                    transformer: r.source_transformer.clone(),
                    cause: format!("{} conflicts with output of {}", r, prev.source_transformer),
                });
            }
        } else if a.same_object(&b) {
            conflicts.push(TransformError {
                component: r.source_component.clone(),
                transformer: r.source_transformer.clone(),
                cause: format!("{} is also rendered by component {:?}", r, prev.source_component),
            });
        } else {
            kept.push(r);
        }
    }
    *resources = kept;
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_single_list_and_map() {
        let single = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } });
        assert_eq!(decode_output(single.clone(), "ns", "c", "t").unwrap().len(), 1);

        let list = json!([single.clone(), { "apiVersion": "v1", "kind": "Secret", "metadata": { "name": "b" } }]);
        let rs = decode_output(list, "ns", "c", "t").unwrap();
        assert_eq!(rs.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(), vec!["ConfigMap", "Secret"]);

        let map = json!({
            "zeta": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "z" } },
            "alpha": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } }
        });
        let rs = decode_output(map, "ns", "c", "t").unwrap();
        assert_eq!(rs.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["a", "z"]);
        assert!(rs.iter().all(|r| r.source_component == "c" && r.source_transformer == "t"));
    }

    #[test]
    fn rejects_scalars_and_mixed_lists() {
        assert_eq!(decode_output(json!(3), "ns", "c", "t"), Err(DecodeError::Shape("number")));
        assert!(decode_output(json!([1, 2]), "ns", "c", "t").is_err());
        assert_eq!(decode_output(json!([]), "ns", "c", "t").unwrap().len(), 0);
    }

    #[test]
    fn malformed_manifest_names_the_missing_field() {
        let no_kind = json!({ "apiVersion": "v1", "metadata": { "name": "a" } });
        assert_eq!(decode_output(no_kind, "ns", "c", "t"), Err(DecodeError::Missing("kind")));
        let bad_version = json!({ "apiVersion": 1, "kind": "ConfigMap", "metadata": { "name": "a" } });
        assert_eq!(decode_output(bad_version, "ns", "c", "t"), Err(DecodeError::Missing("apiVersion")));
    }

    #[test]
    fn dedupe_collapses_identical_and_flags_conflicts() {
        let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" }, "data": {} });
        let a = Resource::from_object(obj.clone(), "ns", "c", "t1").unwrap();
        let b = Resource::from_object(obj, "ns", "c", "t2").unwrap();
        let mut rs = vec![a.clone(), b];
        assert!(dedupe(&mut rs).is_empty());
        assert_eq!(rs.len(), 1);

        let changed = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" }, "data": { "k": "v" } });
        let mut rs = vec![a, Resource::from_object(changed, "ns", "c", "t2").unwrap()];
        let conflicts = dedupe(&mut rs);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(rs.len(), 1);
    }

    #[test]
    fn dedupe_flags_one_object_from_two_components() {
        let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "shared" } });
        let web = Resource::from_object(obj.clone(), "ns", "web", "t").unwrap();
        let worker = Resource::from_object(obj, "ns", "worker", "t").unwrap();
        let mut rs = vec![worker, web];
        let conflicts = dedupe(&mut rs);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].source_component, "web");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].component, "worker");
        assert!(conflicts[0].cause.contains("\"web\""), "cause={}", conflicts[0].cause);
    }
}
