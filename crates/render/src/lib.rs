//! Keel render: match components to transformers, then execute the matches.

#![forbid(unsafe_code)]

use keel_core::labels::validate_components;
use keel_core::{Component, RenderError, Resource};
use keel_provider::Provider;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod eval;
pub mod executor;
pub mod matcher;

pub use executor::{default_concurrency, execute, ExecOutcome, RenderOptions};
pub use matcher::{match_components, unmatched_report, Match, MatchPlan};

/// A complete, error-free render.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub plan: MatchPlan,
    /// Deduplicated and sorted in apply order.
    pub resources: Vec<Resource>,
}

/// Validate, match and execute. Unmatched components and transform failures
/// are collected to the end and reported together.
pub async fn render(
    components: &[Component],
    provider: &Provider,
    opts: &RenderOptions,
    cancel: &CancellationToken,
) -> Result<Rendered, RenderError> {
    validate_components(components).map_err(RenderError::Validation)?;
    let transformers = provider.transformers();
    let plan = match_components(components, &transformers);
    let unmatched = unmatched_report(&plan, &transformers);
    info!(
        release = %opts.release.name,
        components = components.len(),
        matches = plan.matches.len(),
        unmatched = plan.unmatched.len(),
        "match plan built"
    );
    let outcome = execute(&plan, &provider.name, opts, cancel).await;
    if outcome.cancelled {
        return Err(RenderError::Cancelled);
    }
    if unmatched.is_some() || !outcome.errors.is_empty() {
        return Err(RenderError::Incomplete { unmatched, errors: outcome.errors });
    }
    Ok(Rendered { plan, resources: outcome.resources })
}
