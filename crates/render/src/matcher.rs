//! Pure component-to-transformer matching.

use std::sync::Arc;

use keel_core::{Component, Requirements, Transformer, UnmatchedComponent, UnmatchedComponentError};
use serde::Serialize;
use smallvec::SmallVec;

/// One component paired with one transformer that accepts it.
#[derive(Debug, Clone)]
pub struct Match {
    pub component: Arc<Component>,
    pub transformer: Transformer,
    /// Human summary of which requirement sets were satisfied. Diagnostics only.
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct MatchPlan {
    pub matches: Vec<Match>,
    pub unmatched: Vec<String>,
}

#[derive(Serialize)]
struct MatchRow<'a> {
    component: &'a str,
    transformer: &'a str,
    reason: &'a str,
}

#[derive(Serialize)]
struct PlanView<'a> {
    matches: Vec<MatchRow<'a>>,
    unmatched: &'a [String],
}

impl MatchPlan {
    /// Canonical JSON rendering, used for verbose output and plan comparison.
    pub fn to_json(&self) -> serde_json::Value {
        let view = PlanView {
            matches: self
                .matches
                .iter()
                .map(|m| MatchRow { component: &m.component.name, transformer: &m.transformer.fqn, reason: &m.reason })
                .collect(),
            unmatched: &self.unmatched,
        };
        serde_json::to_value(view).unwrap_or(serde_json::Value::Null)
    }

    pub fn matches_for<'a>(&'a self, component: &'a str) -> impl Iterator<Item = &'a Match> + 'a {
        self.matches.iter().filter(move |m| m.component.name == component)
    }
}

/// Pair every component with every transformer whose required sets it satisfies.
///
/// Both inputs are iterated in sorted order (component name, transformer FQN),
/// so the plan only depends on the inputs' contents. Transformers repeated
/// under one FQN are considered once.
pub fn match_components(components: &[Component], transformers: &[Transformer]) -> MatchPlan {
    let mut comps: Vec<&Component> = components.iter().collect();
    comps.sort_by(|a, b| a.name.cmp(&b.name));
    let ts = sorted_unique(transformers);

    let mut plan = MatchPlan::default();
    for c in comps {
        let shared = Arc::new(c.clone());
        let mut hit = false;
        for t in &ts {
            if let Some(reason) = satisfies(c, &t.required, &t.optional) {
                hit = true;
                plan.matches.push(Match { component: Arc::clone(&shared), transformer: (*t).clone(), reason });
            }
        }
        if !hit && plan.unmatched.last() != Some(&c.name) {
            plan.unmatched.push(c.name.clone());
        }
    }
    metrics::counter!("render_matches_total", plan.matches.len() as u64);
    plan
}

fn sorted_unique(transformers: &[Transformer]) -> Vec<&Transformer> {
    let mut ts: Vec<&Transformer> = transformers.iter().collect();
    ts.sort_by(|a, b| a.fqn.cmp(&b.fqn));
    ts.dedup_by(|a, b| a.fqn == b.fqn);
    ts
}

/// `Some(reason)` when every required label (key and value), resource and trait
/// is declared by the component.
fn satisfies(c: &Component, required: &Requirements, optional: &Requirements) -> Option<String> {
    let labels_ok = required.labels.iter().all(|(k, v)| c.labels.get(k) == Some(v));
    let resources_ok = required.resources.is_subset(&c.declared_resources);
    let traits_ok = required.traits.is_subset(&c.declared_traits);
    if !(labels_ok && resources_ok && traits_ok) {
        return None;
    }
    let mut parts: SmallVec<[String; 2]> = SmallVec::new();
    parts.push(format!("required {}", required));
    let present = Requirements {
        labels: optional
            .labels
            .iter()
            .filter(|(k, v)| c.labels.get(*k) == Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        resources: optional.resources.intersection(&c.declared_resources).cloned().collect(),
        traits: optional.traits.intersection(&c.declared_traits).cloned().collect(),
    };
    if !present.is_empty() {
        parts.push(format!("optional {}", present));
    }
    Some(parts.join("; "))
}

/// Build the aggregated diagnostic for every unmatched component, listing each
/// considered transformer's required set.
pub fn unmatched_report(plan: &MatchPlan, transformers: &[Transformer]) -> Option<UnmatchedComponentError> {
    if plan.unmatched.is_empty() {
        return None;
    }
    let considered: Vec<(String, Requirements)> = sorted_unique(transformers)
        .into_iter()
        .map(|t| (t.fqn.clone(), t.required.clone()))
        .collect();
    Some(UnmatchedComponentError {
        components: plan
            .unmatched
            .iter()
            .map(|name| UnmatchedComponent { component: name.clone(), considered: considered.clone() })
            .collect(),
    })
}
