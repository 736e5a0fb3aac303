#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::labels::ownership_labels;
use keel_core::{InventoryEntry, ReleaseIdentity};
use keel_reconcile::{
    first_install_check, reconcile, DeleteError, Deleter, LiveLookup, LiveObject, PruneOptions, Pruner,
    ReconcileError,
};
use tokio_util::sync::CancellationToken;

fn entry(group: &str, kind: &str, ns: &str, name: &str, component: &str) -> InventoryEntry {
    InventoryEntry {
        group: group.into(),
        kind: kind.into(),
        namespace: ns.into(),
        name: name.into(),
        component: component.into(),
        version: "v1".into(),
    }
}

fn deploy(name: &str, component: &str) -> InventoryEntry {
    entry("apps", "Deployment", "prod", name, component)
}

fn release() -> ReleaseIdentity {
    ReleaseIdentity::derive("shop", "prod", "example.com/shop")
}

#[test]
fn removed_component_becomes_stale() {
    let prev = vec![deploy("shop-web", "web"), deploy("shop-worker", "worker")];
    let cur = vec![deploy("shop-web", "web")];
    let stale = reconcile(Some(&prev), &cur, false).unwrap();
    assert_eq!(stale, vec![deploy("shop-worker", "worker")]);
}

#[test]
fn object_moved_between_components_is_not_stale() {
    let prev = vec![deploy("shop-web", "web")];
    let cur = vec![deploy("shop-web", "frontend")];
    let stale = reconcile(Some(&prev), &cur, false).unwrap();
    assert!(stale.is_empty(), "stale={:?}", stale);
}

#[test]
fn first_install_has_nothing_stale() {
    let cur = vec![deploy("shop-web", "web")];
    assert!(reconcile(None, &cur, false).unwrap().is_empty());
    assert!(reconcile(None, &[], false).unwrap().is_empty());
}

#[test]
fn empty_render_is_refused_unless_forced() {
    let prev = vec![deploy("shop-web", "web"), entry("", "Service", "prod", "shop-web", "web")];
    match reconcile(Some(&prev), &[], false) {
        Err(ReconcileError::EmptyRender { previous }) => assert_eq!(previous, 2),
        other => panic!("expected empty render gate, got {:?}", other),
    }
    let stale = reconcile(Some(&prev), &[], true).unwrap();
    assert_eq!(stale.len(), 2);
    // Apply order: Service before Deployment.
    assert_eq!(stale[0].kind, "Service");
}

#[test]
fn empty_previous_and_empty_render_is_fine() {
    assert!(reconcile(Some(&[]), &[], false).unwrap().is_empty());
}

struct Cluster {
    objects: HashMap<String, LiveObject>,
}

#[async_trait]
impl LiveLookup for Cluster {
    async fn get(&self, entry: &InventoryEntry) -> anyhow::Result<Option<LiveObject>> {
        Ok(self.objects.get(&entry.name).cloned())
    }
}

#[tokio::test]
async fn first_install_refuses_foreign_objects() {
    let cluster = Cluster {
        objects: HashMap::from([("shop-web".to_string(), LiveObject::default())]),
    };
    let err = first_install_check(&[deploy("shop-web", "web")], &release(), &cluster).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotOwned(ref v) if v.len() == 1), "err={}", err);
}

#[tokio::test]
async fn first_install_refuses_other_release_and_terminating() {
    let other = ReleaseIdentity::derive("blog", "prod", "example.com/blog");
    let cluster = Cluster {
        objects: HashMap::from([
            ("shop-web".to_string(), LiveObject { labels: ownership_labels(&other, "web"), ..Default::default() }),
            (
                "shop-old".to_string(),
                LiveObject { labels: ownership_labels(&release(), "web"), deleting: true, ready: None },
            ),
        ]),
    };
    let err = first_install_check(&[deploy("shop-web", "web")], &release(), &cluster).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotOwned(_)));
    let err = first_install_check(&[deploy("shop-old", "web")], &release(), &cluster).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Terminating(_)));
}

#[tokio::test]
async fn first_install_adopts_own_and_ignores_missing() {
    let cluster = Cluster {
        objects: HashMap::from([(
            "shop-web".to_string(),
            LiveObject { labels: ownership_labels(&release(), "web"), ..Default::default() },
        )]),
    };
    let cur = vec![deploy("shop-web", "web"), deploy("shop-new", "web")];
    first_install_check(&cur, &release(), &cluster).await.unwrap();
}

#[derive(Default)]
struct RecordingDeleter {
    calls: Mutex<Vec<String>>,
    missing: HashSet<String>,
    broken: HashSet<String>,
    cancel_after: Option<(usize, CancellationToken)>,
}

#[async_trait]
impl Deleter for RecordingDeleter {
    async fn delete(&self, entry: &InventoryEntry) -> Result<(), DeleteError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(format!("{}/{}", entry.kind, entry.name));
            calls.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        if self.missing.contains(&entry.name) {
            return Err(DeleteError::NotFound);
        }
        if self.broken.contains(&entry.name) {
            return Err(DeleteError::Other(anyhow::anyhow!("forbidden")));
        }
        Ok(())
    }
}

fn stale_set() -> Vec<InventoryEntry> {
    vec![
        entry("", "ConfigMap", "prod", "cfg", "web"),
        deploy("web", "web"),
        entry("", "Namespace", "", "prod", "web"),
        entry("", "Service", "prod", "web", "web"),
    ]
}

#[tokio::test]
async fn prune_deletes_in_reverse_weight_order_and_keeps_namespaces() {
    let d = RecordingDeleter::default();
    let report = Pruner::new(&d, PruneOptions::default())
        .prune(&stale_set(), &CancellationToken::new())
        .await
        .unwrap();
    let calls = d.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["Deployment/web", "Service/web", "ConfigMap/cfg"]);
    assert_eq!(report.deleted.len(), 3);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].is_namespace());
    assert!(report.is_clean());
    assert_eq!(report.retained(), vec![entry("", "Namespace", "", "prod", "web")]);
}

#[tokio::test]
async fn prune_namespaces_when_asked() {
    let d = RecordingDeleter::default();
    Pruner::new(&d, PruneOptions { prune_namespaces: true })
        .prune(&stale_set(), &CancellationToken::new())
        .await
        .unwrap();
    let calls = d.calls.lock().unwrap().clone();
    assert_eq!(calls.last().map(String::as_str), Some("Namespace/prod"));
}

#[tokio::test]
async fn prune_is_idempotent_when_objects_are_already_gone() {
    let d = RecordingDeleter {
        missing: ["web".to_string(), "cfg".to_string()].into_iter().collect(),
        ..Default::default()
    };
    let report = Pruner::new(&d, PruneOptions::default())
        .prune(&stale_set(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.deleted.is_empty());
    assert_eq!(report.missing.len(), 3);
}

#[tokio::test]
async fn prune_attempts_everything_and_reports_failures() {
    let d = RecordingDeleter { broken: ["cfg".to_string()].into_iter().collect(), ..Default::default() };
    let err = Pruner::new(&d, PruneOptions::default())
        .prune(&stale_set(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.report.deleted.len(), 2);
    assert_eq!(err.report.failed.len(), 1);
    assert_eq!(
        err.report.retained(),
        vec![entry("", "ConfigMap", "prod", "cfg", "web"), entry("", "Namespace", "", "prod", "web")]
    );
    assert!(err.to_string().contains("forbidden"));
}

#[tokio::test]
async fn prune_stops_between_deletes_when_cancelled() {
    let token = CancellationToken::new();
    let d = RecordingDeleter { cancel_after: Some((1, token.clone())), ..Default::default() };
    let err = Pruner::new(&d, PruneOptions::default()).prune(&stale_set(), &token).await.unwrap_err();
    assert_eq!(d.calls.lock().unwrap().len(), 1);
    assert_eq!(err.report.deleted.len(), 1);
    assert_eq!(err.report.pending.len(), 3);
}
