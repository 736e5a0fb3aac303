#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use keel_core::{Component, ReleaseIdentity, RenderError, Transformer, TransformerContext};
use keel_provider::{kubernetes, Provider};
use keel_render::{execute, match_components, render, RenderOptions};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

fn opts(max: usize) -> RenderOptions {
    let mut o = RenderOptions::new(ReleaseIdentity::derive("shop", "prod", "example.com/shop"));
    o.version = "1.2.3".into();
    o.max_concurrency = max;
    o
}

fn config_map(_: &Json, ctx: &TransformerContext) -> anyhow::Result<Json> {
    Ok(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": ctx.metadata(&ctx.object_name(Some("cfg"))) }))
}

fn failing(_: &Json, _: &TransformerContext) -> anyhow::Result<Json> {
    anyhow::bail!("missing field spec.port")
}

static SLOW_RUNS: AtomicUsize = AtomicUsize::new(0);

fn slow(_: &Json, ctx: &TransformerContext) -> anyhow::Result<Json> {
    SLOW_RUNS.fetch_add(1, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(60));
    config_map(&Json::Null, ctx)
}

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

fn tracked(_: &Json, ctx: &TransformerContext) -> anyhow::Result<Json> {
    let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
    PEAK.fetch_max(now, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    config_map(&Json::Null, ctx)
}

fn components(n: usize) -> Vec<Component> {
    (0..n).map(|i| Component::new(format!("c{}", i)).with_resource("Config")).collect()
}

fn web() -> Component {
    Component::new("web")
        .with_label("workload-type", "stateless")
        .with_resource("Container")
        .with_trait("Expose")
        .with_spec(json!({
            "container": { "image": "nginx:1.27" },
            "expose": { "ports": [{ "name": "http", "port": 80 }] }
        }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executing_twice_yields_same_identities() {
    let p = kubernetes::provider().unwrap();
    let comps = vec![web()];
    let plan = match_components(&comps, &p.transformers());
    let cancel = CancellationToken::new();
    let a = execute(&plan, &p.name, &opts(4), &cancel).await;
    let b = execute(&plan, &p.name, &opts(4), &cancel).await;
    assert!(a.errors.is_empty(), "errors={:?}", a.errors);
    let ids = |o: &keel_render::ExecOutcome| o.resources.iter().map(|r| r.entry()).collect::<Vec<_>>();
    assert_eq!(ids(&a), ids(&b));
    assert_eq!(a.resources.len(), 2);
    // Service (weight 50) sorts before Deployment (weight 101).
    assert_eq!(a.resources[0].kind, "Service");
    assert_eq!(a.resources[1].kind, "Deployment");
    let labels = &a.resources[1].data["metadata"]["labels"];
    assert_eq!(labels["app.kubernetes.io/managed-by"], "keel");
    assert_eq!(labels["keel.dev/component"], "web");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_do_not_stop_other_matches() {
    let p = Provider::new("test", "v0")
        .with(Transformer::new("test#ok", config_map).require_resource("Config")).unwrap()
        .with(Transformer::new("test#broken", failing).require_resource("Config")).unwrap();
    let comps = components(3);
    let plan = match_components(&comps, &p.transformers());
    assert_eq!(plan.matches.len(), 6);
    let out = execute(&plan, &p.name, &opts(2), &CancellationToken::new()).await;
    assert_eq!(out.resources.len(), 3);
    assert_eq!(out.errors.len(), 3);
    assert!(out.errors.iter().all(|e| e.transformer == "test#broken" && e.cause.contains("spec.port")));
    assert!(!out.cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_is_bounded() {
    let p = Provider::new("test", "v0")
        .with(Transformer::new("test#tracked", tracked).require_resource("Config")).unwrap();
    let comps = components(8);
    let plan = match_components(&comps, &p.transformers());
    let out = execute(&plan, &p.name, &opts(2), &CancellationToken::new()).await;
    assert_eq!(out.resources.len(), 8);
    assert!(PEAK.load(Ordering::SeqCst) <= 2, "peak={}", PEAK.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_stops_new_matches_but_keeps_in_flight_output() {
    let p = Provider::new("test", "v0")
        .with(Transformer::new("test#slow", slow).require_resource("Config")).unwrap();
    let comps = components(6);
    let plan = match_components(&comps, &p.transformers());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let out = execute(&plan, &p.name, &opts(1), &cancel).await;
    assert!(out.cancelled);
    let ran = SLOW_RUNS.load(Ordering::SeqCst);
    assert!(ran >= 1 && ran < 6, "ran={}", ran);
    assert_eq!(out.resources.len(), ran);
    assert!(out.errors.is_empty());
}

#[tokio::test]
async fn render_reports_unmatched_and_transform_errors_together() {
    let p = kubernetes::provider().unwrap();
    let broken = Component::new("api")
        .with_label("workload-type", "stateless")
        .with_resource("Container")
        .with_spec(json!({ "container": {} }));
    let cache = Component::new("cache").with_resource("Redis");
    let err = render(&[web(), broken, cache], &p, &opts(4), &CancellationToken::new()).await.unwrap_err();
    match &err {
        RenderError::Incomplete { unmatched, errors } => {
            let u = unmatched.as_ref().expect("cache is unmatched");
            assert_eq!(u.components.len(), 1);
            assert_eq!(u.components[0].component, "cache");
            assert_eq!(u.components[0].considered.len(), p.len());
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].component, "api");
            assert_eq!(errors[0].transformer, "kubernetes#deployment");
        }
        other => panic!("unexpected error: {}", other),
    }
    let msg = err.to_string();
    assert!(msg.contains("cache") && msg.contains("spec.container.image"), "msg={}", msg);
}

#[tokio::test]
async fn render_rejects_invalid_components_before_matching() {
    let p = kubernetes::provider().unwrap();
    let err = render(&[web(), web()], &p, &opts(1), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RenderError::Validation(ref v) if v.len() == 1), "err={}", err);
}

#[tokio::test]
async fn render_already_cancelled_starts_nothing() {
    let p = kubernetes::provider().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = render(&[web()], &p, &opts(1), &cancel).await.unwrap_err();
    assert!(matches!(err, RenderError::Cancelled));
}
