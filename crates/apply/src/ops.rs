use anyhow::Context;
use keel_core::{Component, InventoryEntry, Resource};
use keel_persist::{now_ts, ChangeRecord, InventoryStore};
use keel_provider::Provider;
use keel_reconcile::{reconcile, Deleter, LiveLookup, PruneReport, Pruner};
use keel_render::{render, RenderOptions};
use serde::Serialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::diff::{diff_summary, strip_noisy, DiffSummary};
use crate::{Applier, ApplyError, ApplyOptions, ApplyReport};

/// Serialize resources as a multi-document YAML stream, in the given order.
pub fn to_yaml_stream(resources: &[Resource]) -> anyhow::Result<String> {
    let mut out = String::new();
    for r in resources {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&r.data).with_context(|| format!("serializing {}", r))?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct VetReport {
    pub components: usize,
    pub matches: usize,
    pub resources: usize,
    /// Server dry-run rejections, when a server was consulted.
    pub rejected: Vec<(String, String)>,
}

impl VetReport {
    pub fn ok(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Render and, given a server, dry-run every resource against it.
pub async fn vet(
    components: &[Component],
    provider: &Provider,
    render_opts: &RenderOptions,
    server: Option<&dyn Applier>,
    cancel: &CancellationToken,
) -> Result<VetReport, ApplyError> {
    let rendered = render(components, provider, render_opts, cancel).await?;
    let mut rejected = Vec::new();
    if let Some(applier) = server {
        for r in &rendered.resources {
            if let Err(e) = applier.apply(r, true).await {
                rejected.push((r.to_string(), format!("{:#}", e)));
            }
        }
    }
    Ok(VetReport {
        components: components.len(),
        matches: rendered.plan.matches.len(),
        resources: rendered.resources.len(),
        rejected,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    pub resource: String,
    pub exists: bool,
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffReport {
    pub resources: Vec<ResourceDiff>,
    /// What an apply would delete.
    pub prune: Vec<InventoryEntry>,
}

impl DiffReport {
    pub fn has_changes(&self) -> bool {
        !self.prune.is_empty() || self.resources.iter().any(|d| !d.exists || !d.summary.is_empty())
    }
}

pub async fn diff(
    components: &[Component],
    provider: &Provider,
    render_opts: &RenderOptions,
    opts: &ApplyOptions,
    applier: &dyn Applier,
    store: &dyn InventoryStore,
    cancel: &CancellationToken,
) -> Result<DiffReport, ApplyError> {
    let rendered = render(components, provider, render_opts, cancel).await?;
    let current: Vec<InventoryEntry> = rendered.resources.iter().map(Resource::entry).collect();
    let stored = store.load(&render_opts.release.key()).await?;
    let prune = reconcile(stored.as_ref().map(|s| s.inventory.entries.as_slice()), &current, opts.force_empty)?;

    let mut resources = Vec::with_capacity(rendered.resources.len());
    for r in &rendered.resources {
        let live = applier.fetch(r).await.with_context(|| format!("reading live {}", r))?;
        let target = strip_noisy(r.data.clone());
        let (exists, summary) = match live {
            Some(l) => (true, diff_summary(&target, &strip_noisy(l))),
            None => (false, diff_summary(&target, &Json::Null)),
        };
        resources.push(ResourceDiff { resource: r.to_string(), exists, summary });
    }
    Ok(DiffReport { resources, prune })
}

/// Delete everything a release owns, then its inventory record. Entries that
/// could not be deleted are written back so a later delete retries them.
pub async fn delete(
    release_key: &str,
    opts: &ApplyOptions,
    deleter: &dyn Deleter,
    store: &dyn InventoryStore,
    cancel: &CancellationToken,
) -> Result<PruneReport, ApplyError> {
    let stored = store.load(release_key).await?.ok_or_else(|| ApplyError::NoInventory(release_key.to_string()))?;
    info!(release = %release_key, entries = stored.inventory.entries.len(), "deleting release");
    match Pruner::new(deleter, opts.prune()).prune(&stored.inventory.entries, cancel).await {
        Ok(report) if report.skipped.is_empty() => {
            store.remove(release_key, Some(&stored.version)).await?;
            Ok(report)
        }
        Ok(report) => {
            // The record outlives the release while it still owns namespaces.
            warn!(count = report.skipped.len(), "namespaces left in place; keeping them in the inventory");
            let mut inv = stored.inventory;
            inv.record(report.retained(), now_ts(), opts.history_limit);
            store.write(&inv, Some(&stored.version)).await?;
            Ok(report)
        }
        Err(e) => {
            let mut inv = stored.inventory;
            inv.record(e.report.retained(), now_ts(), opts.history_limit);
            let version = store.write(&inv, Some(&stored.version)).await?;
            let report = ApplyReport { prune: Some(e.report.clone()), inventory_version: Some(version), ..Default::default() };
            Err(ApplyError::Prune { source: e, report })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Ready,
    NotReady,
    /// Exists; the kind has no readiness signal.
    Present,
    Terminating,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryStatus {
    pub entry: InventoryEntry,
    pub state: EntryState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub release: String,
    pub version: String,
    pub entries: Vec<EntryStatus>,
    pub history: Vec<ChangeRecord>,
}

impl StatusReport {
    pub fn healthy(&self) -> bool {
        self.entries.iter().all(|e| matches!(e.state, EntryState::Ready | EntryState::Present))
    }
}

pub async fn status(release_key: &str, lookup: &dyn LiveLookup, store: &dyn InventoryStore) -> Result<StatusReport, ApplyError> {
    let stored = store.load(release_key).await?.ok_or_else(|| ApplyError::NoInventory(release_key.to_string()))?;
    let mut entries = Vec::with_capacity(stored.inventory.entries.len());
    for e in &stored.inventory.entries {
        let live = lookup.get(e).await.with_context(|| format!("reading live {}", e))?;
        let state = match live {
            None => EntryState::Missing,
            Some(l) if l.deleting => EntryState::Terminating,
            Some(l) => match l.ready {
                Some(true) => EntryState::Ready,
                Some(false) => EntryState::NotReady,
                None => EntryState::Present,
            },
        };
        entries.push(EntryStatus { entry: e.clone(), state });
    }
    Ok(StatusReport {
        release: release_key.to_string(),
        version: stored.version,
        entries,
        history: stored.inventory.history.into_iter().collect(),
    })
}
