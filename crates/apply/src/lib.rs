//! Keel apply: drive one release through render, apply, prune and inventory
//! write, plus the read-only operations built from the same pieces.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use keel_core::{InventoryEntry, RenderError, Resource};
use keel_persist::{StoreError, DEFAULT_HISTORY};
use keel_reconcile::{Deleter, LiveLookup, PruneError, PruneOptions, PruneReport, ReconcileError};
use serde::Serialize;
use serde_json::Value as Json;
use thiserror::Error;

mod cycle;
pub mod diff;
mod ops;

pub use cycle::apply;
pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use ops::{
    delete, diff, status, to_yaml_stream, vet, DiffReport, EntryState, EntryStatus, ResourceDiff, StatusReport,
    VetReport,
};

/// Writes rendered objects to the cluster.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Server-side apply one object. With `dry_run` the server validates and
    /// discards.
    async fn apply(&self, resource: &Resource, dry_run: bool) -> anyhow::Result<()>;

    /// The live object with the same identity, if any.
    async fn fetch(&self, resource: &Resource) -> anyhow::Result<Option<Json>>;
}

/// Everything the pipeline needs from a cluster.
#[derive(Clone, Copy)]
pub struct Cluster<'a> {
    pub applier: &'a dyn Applier,
    pub lookup: &'a dyn LiveLookup,
    pub deleter: &'a dyn Deleter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Rendering,
    Applying,
    AllApplied,
    Pruning,
    InventoryWrite,
    Done,
    PartialFailure,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Allow an empty render to prune everything the release owns.
    pub force_empty: bool,
    pub prune_namespaces: bool,
    pub history_limit: usize,
    /// Server-side dry run: nothing is pruned or written.
    pub dry_run: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { force_empty: false, prune_namespaces: false, history_limit: DEFAULT_HISTORY, dry_run: false }
    }
}

impl ApplyOptions {
    pub fn prune(&self) -> PruneOptions {
        PruneOptions { prune_namespaces: self.prune_namespaces }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Every phase entered, in order.
    pub phases: Vec<Phase>,
    pub applied: Vec<InventoryEntry>,
    pub stale: Vec<InventoryEntry>,
    pub prune: Option<PruneReport>,
    /// Version token of the inventory written by this run.
    pub inventory_version: Option<String>,
    pub first_install: bool,
}

impl ApplyReport {
    pub fn phase(&self) -> Option<Phase> {
        self.phases.last().copied()
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Some applies failed. Nothing was pruned and the inventory is untouched.
    #[error("{}", partial_failure(.failed, .report))]
    PartialFailure { failed: Vec<(InventoryEntry, String)>, report: ApplyReport },
    /// Every apply succeeded and the inventory was written, but some stale
    /// resources could not be deleted. They stay in the inventory.
    #[error("{source}")]
    Prune { source: PruneError, report: ApplyReport },
    #[error("apply cancelled; skipped prune and inventory write")]
    Cancelled { report: ApplyReport },
    #[error("no inventory recorded for release {0}")]
    NoInventory(String),
    #[error(transparent)]
    Cluster(#[from] anyhow::Error),
}

fn partial_failure(failed: &[(InventoryEntry, String)], report: &ApplyReport) -> String {
    let mut msg = format!(
        "{} of {} resource(s) failed to apply; skipped prune and inventory write",
        failed.len(),
        failed.len() + report.applied.len()
    );
    for (e, cause) in failed {
        msg.push_str(&format!("\n  {}: {}", e, cause));
    }
    msg
}

impl ApplyError {
    /// Another writer got there first; rerunning is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Store(e) if e.is_retryable())
    }
}
