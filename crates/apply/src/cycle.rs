use keel_core::{Component, InventoryEntry};
use keel_persist::{now_ts, Inventory, InventoryStore, StoreError};
use keel_provider::Provider;
use keel_reconcile::{first_install_check, reconcile, Pruner};
use keel_render::{render, RenderOptions};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{ApplyError, ApplyOptions, ApplyReport, Cluster, Phase};

fn enter(report: &mut ApplyReport, phase: Phase) {
    info!(phase = %phase, "apply phase");
    report.phases.push(phase);
}

/// Run one apply cycle for a release.
///
/// Safety gates (identity, empty render, first-install ownership) run before
/// anything touches the cluster. Any apply failure aborts the cycle with the
/// cluster's previous stale resources and the stored inventory left alone.
pub async fn apply(
    components: &[Component],
    provider: &Provider,
    render_opts: &RenderOptions,
    opts: &ApplyOptions,
    cluster: Cluster<'_>,
    store: &dyn InventoryStore,
    cancel: &CancellationToken,
) -> Result<ApplyReport, ApplyError> {
    let started = std::time::Instant::now();
    let mut report = ApplyReport::default();
    let release = &render_opts.release;

    enter(&mut report, Phase::Rendering);
    let rendered = render(components, provider, render_opts, cancel).await?;
    let current: Vec<InventoryEntry> = rendered.resources.iter().map(|r| r.entry()).collect();

    let stored = store.load(&release.key()).await?;
    if let Some(s) = &stored {
        if s.inventory.release != *release {
            return Err(StoreError::IdentityChanged {
                key: release.key(),
                stored: s.inventory.release.uuid.to_string(),
                given: release.uuid.to_string(),
            }
            .into());
        }
    }
    let previous = stored.as_ref().map(|s| s.inventory.entries.as_slice());
    report.stale = reconcile(previous, &current, opts.force_empty)?;
    report.first_install = stored.is_none();
    if report.first_install {
        first_install_check(&current, release, cluster.lookup).await?;
    }
    info!(
        release = %release.key(),
        resources = current.len(),
        stale = report.stale.len(),
        first_install = report.first_install,
        dry_run = opts.dry_run,
        "render reconciled"
    );

    enter(&mut report, Phase::Applying);
    let mut failed: Vec<(InventoryEntry, String)> = Vec::new();
    for r in &rendered.resources {
        if cancel.is_cancelled() {
            warn!(applied = report.applied.len(), "apply cancelled");
            enter(&mut report, Phase::Aborted);
            return Err(ApplyError::Cancelled { report });
        }
        let t0 = std::time::Instant::now();
        match cluster.applier.apply(r, opts.dry_run).await {
            Ok(()) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                report.applied.push(r.entry());
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(resource = %r, error = %e, "apply failed");
                failed.push((r.entry(), format!("{:#}", e)));
            }
        }
    }
    if !failed.is_empty() {
        enter(&mut report, Phase::PartialFailure);
        enter(&mut report, Phase::Aborted);
        return Err(ApplyError::PartialFailure { failed, report });
    }
    enter(&mut report, Phase::AllApplied);

    if opts.dry_run {
        enter(&mut report, Phase::Done);
        return Ok(report);
    }

    enter(&mut report, Phase::Pruning);
    let pruned = Pruner::new(cluster.deleter, opts.prune()).prune(&report.stale, cancel).await;
    let (retained, prune_err) = match pruned {
        Ok(r) => {
            let kept = r.retained();
            report.prune = Some(r);
            (kept, None)
        }
        Err(e) => {
            report.prune = Some(e.report.clone());
            (e.report.retained(), Some(e))
        }
    };

    enter(&mut report, Phase::InventoryWrite);
    let t0 = std::time::Instant::now();
    let (mut inv, expected) = match stored {
        Some(s) => (s.inventory, Some(s.version)),
        None => (Inventory::new(release.clone()), None),
    };
    let mut entries = current;
    if prune_err.is_some() {
        warn!(count = retained.len(), "keeping stale resources that could not be deleted in the inventory");
    }
    entries.extend(retained);
    inv.record(entries, now_ts(), opts.history_limit);
    let version = store.write(&inv, expected.as_deref()).await?;
    histogram!("inventory_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
    report.inventory_version = Some(version);

    if let Some(source) = prune_err {
        enter(&mut report, Phase::Done);
        return Err(ApplyError::Prune { source, report });
    }
    enter(&mut report, Phase::Done);
    histogram!("apply_cycle_ms", started.elapsed().as_secs_f64() * 1000.0);
    info!(release = %release.key(), applied = report.applied.len(), "apply complete");
    Ok(report)
}
