//! Pruning: delete stale resources in reverse creation order.

use std::cmp::Reverse;
use std::fmt;

use async_trait::async_trait;
use keel_core::InventoryEntry;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Deletes one cluster object.
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, entry: &InventoryEntry) -> Result<(), DeleteError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    /// Namespaces are left in place unless this is set.
    pub prune_namespaces: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub deleted: Vec<InventoryEntry>,
    /// Already gone; counted as success.
    pub missing: Vec<InventoryEntry>,
    /// Namespaces left in place. Still owned, so still tracked.
    pub skipped: Vec<InventoryEntry>,
    pub failed: Vec<(InventoryEntry, String)>,
    /// Entries never attempted because the run was cancelled.
    pub pending: Vec<InventoryEntry>,
}

impl PruneReport {
    /// Entries that must stay in the inventory: failures and cancelled
    /// deletes so the next run retries them, and skipped namespaces so a later
    /// run with namespace pruning can still find them.
    pub fn retained(&self) -> Vec<InventoryEntry> {
        self.failed
            .iter()
            .map(|(e, _)| e.clone())
            .chain(self.pending.iter().cloned())
            .chain(self.skipped.iter().cloned())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.pending.is_empty()
    }
}

/// Some deletes failed or were never attempted. The report still lists what
/// did succeed.
#[derive(Debug)]
pub struct PruneError {
    pub report: PruneReport,
}

impl fmt::Display for PruneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prune incomplete: {} failed", self.report.failed.len())?;
        if !self.report.pending.is_empty() {
            write!(f, ", {} not attempted (cancelled)", self.report.pending.len())?;
        }
        for (e, cause) in &self.report.failed {
            write!(f, "\n  {}: {}", e, cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for PruneError {}

pub struct Pruner<'a> {
    deleter: &'a dyn Deleter,
    opts: PruneOptions,
}

impl<'a> Pruner<'a> {
    pub fn new(deleter: &'a dyn Deleter, opts: PruneOptions) -> Self {
        Self { deleter, opts }
    }

    /// Delete `stale` highest weight first. Every entry is attempted even
    /// after a failure; cancellation is honoured between deletes.
    pub async fn prune(&self, stale: &[InventoryEntry], cancel: &CancellationToken) -> Result<PruneReport, PruneError> {
        let started = std::time::Instant::now();
        let mut order: Vec<&InventoryEntry> = stale.iter().collect();
        order.sort_by(|a, b| Reverse(a.weight()).cmp(&Reverse(b.weight())).then_with(|| b.cmp(a)));
        order.dedup();

        let mut report = PruneReport::default();
        for (i, e) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(remaining = order.len() - i, "prune cancelled");
                report.pending.extend(order[i..].iter().map(|e| (*e).clone()));
                break;
            }
            if e.is_namespace() && !self.opts.prune_namespaces {
                info!(entry = %e, "leaving namespace in place");
                report.skipped.push((*e).clone());
                continue;
            }
            match self.deleter.delete(e).await {
                Ok(()) => {
                    debug!(entry = %e, "deleted");
                    counter!("prune_deleted_total", 1u64);
                    report.deleted.push((*e).clone());
                }
                Err(DeleteError::NotFound) => {
                    debug!(entry = %e, "already gone");
                    report.missing.push((*e).clone());
                }
                Err(DeleteError::Other(err)) => {
                    warn!(entry = %e, error = %err, "delete failed");
                    counter!("prune_failed_total", 1u64);
                    report.failed.push(((*e).clone(), format!("{:#}", err)));
                }
            }
        }
        histogram!("prune_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            deleted = report.deleted.len(),
            missing = report.missing.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "prune finished"
        );
        if report.is_clean() {
            Ok(report)
        } else {
            Err(PruneError { report })
        }
    }
}
