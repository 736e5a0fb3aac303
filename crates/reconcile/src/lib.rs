//! Keel reconcile: decide which previously applied resources are stale, and
//! refuse to proceed when the render or the cluster looks unsafe.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use keel_core::labels::{ownership, Ownership};
use keel_core::{sort_for_apply, InventoryEntry, Labels, ObjectKey, ReleaseIdentity};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info};

mod prune;

pub use prune::{DeleteError, Deleter, PruneError, PruneOptions, PruneReport, Pruner};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(
        "render produced no resources but the release currently owns {previous}; \
         refusing to delete everything (pass --force-empty to allow)"
    )]
    EmptyRender { previous: usize },
    #[error("{} resource(s) already exist and are not owned by this release: {}", .0.len(), .0.join(", "))]
    NotOwned(Vec<String>),
    #[error("{} resource(s) are being deleted; wait and retry: {}", .0.len(), .0.join(", "))]
    Terminating(Vec<String>),
    #[error("looking up {entry}: {source:#}")]
    Lookup { entry: String, source: anyhow::Error },
}

/// Compute the stale set.
///
/// `previous` is `None` on first install, in which case nothing is stale.
/// Otherwise stale = previous − current by full identity, minus anything whose
/// Kubernetes identity (ignoring component) is still rendered.
pub fn reconcile(
    previous: Option<&[InventoryEntry]>,
    current: &[InventoryEntry],
    force_empty: bool,
) -> Result<Vec<InventoryEntry>, ReconcileError> {
    let Some(previous) = previous else {
        return Ok(Vec::new());
    };
    if current.is_empty() && !previous.is_empty() && !force_empty {
        return Err(ReconcileError::EmptyRender { previous: previous.len() });
    }

    let wanted: FxHashSet<&InventoryEntry> = current.iter().collect();
    let wanted_objects: FxHashSet<ObjectKey> = current.iter().map(InventoryEntry::object_key).collect();

    let mut stale: Vec<InventoryEntry> = Vec::new();
    for e in previous {
        if wanted.contains(e) {
            continue;
        }
        if wanted_objects.contains(&e.object_key()) {
            debug!(entry = %e, "object moved to another component; not stale");
            continue;
        }
        stale.push(e.clone());
    }
    sort_for_apply(&mut stale);
    stale.dedup();
    if !stale.is_empty() {
        info!(stale = stale.len(), previous = previous.len(), current = current.len(), "stale resources found");
    }
    Ok(stale)
}

/// What the cluster reports for one inventory entry.
#[derive(Debug, Clone, Default)]
pub struct LiveObject {
    pub labels: Labels,
    /// `metadata.deletionTimestamp` is set.
    pub deleting: bool,
    /// Kind-specific readiness, when the kind has a notion of it.
    pub ready: Option<bool>,
}

#[async_trait]
pub trait LiveLookup: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, entry: &InventoryEntry) -> anyhow::Result<Option<LiveObject>>;
}

/// Before the first apply of a release, make sure none of the rendered
/// resources already exist under someone else's ownership or mid-deletion.
pub async fn first_install_check(
    current: &[InventoryEntry],
    release: &ReleaseIdentity,
    lookup: &dyn LiveLookup,
) -> Result<(), ReconcileError> {
    let mut not_owned = Vec::new();
    let mut terminating = Vec::new();
    for e in current {
        let live = lookup
            .get(e)
            .await
            .map_err(|source| ReconcileError::Lookup { entry: e.to_string(), source })?;
        let Some(live) = live else { continue };
        if live.deleting {
            terminating.push(e.to_string());
        } else if ownership(&live.labels, release) != Ownership::Release {
            not_owned.push(e.to_string());
        }
    }
    if !terminating.is_empty() {
        return Err(ReconcileError::Terminating(terminating));
    }
    if !not_owned.is_empty() {
        return Err(ReconcileError::NotOwned(not_owned));
    }
    Ok(())
}
