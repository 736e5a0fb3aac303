//! Ownership labels stamped on every rendered resource, and component validation.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Component, Labels, ReleaseIdentity, ValidationError};

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "keel";
pub const RELEASE_NAME: &str = "keel.dev/release-name";
pub const RELEASE_NAMESPACE: &str = "keel.dev/release-namespace";
pub const RELEASE_UUID: &str = "keel.dev/release-uuid";
pub const COMPONENT: &str = "keel.dev/component";

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex")
});

/// Labels identifying `release` as the owner of a resource from `component`.
pub fn ownership_labels(release: &ReleaseIdentity, component: &str) -> Labels {
    let mut l = Labels::new();
    l.insert(MANAGED_BY.into(), MANAGED_BY_VALUE.into());
    l.insert(RELEASE_NAME.into(), release.name.clone());
    l.insert(RELEASE_NAMESPACE.into(), release.namespace.clone());
    l.insert(RELEASE_UUID.into(), release.uuid.to_string());
    l.insert(COMPONENT.into(), component.to_string());
    l
}

/// Who owns a live object, judged by its labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Carries this release's uuid.
    Release,
    /// Managed by keel, but for a different release.
    OtherRelease,
    /// No keel markers at all.
    Foreign,
}

pub fn ownership<'a, I>(labels: I, release: &ReleaseIdentity) -> Ownership
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut managed = false;
    let mut uuid_match = false;
    for (k, v) in labels {
        if k == MANAGED_BY && v == MANAGED_BY_VALUE {
            managed = true;
        }
        if k == RELEASE_UUID && *v == release.uuid.to_string() {
            uuid_match = true;
        }
    }
    match (managed, uuid_match) {
        (true, true) => Ownership::Release,
        (true, false) => Ownership::OtherRelease,
        _ => Ownership::Foreign,
    }
}

pub fn is_dns_label(s: &str) -> bool {
    s.len() <= 63 && DNS_LABEL.is_match(s)
}

/// Structural checks on upstream components. Collects every problem.
pub fn validate_components(components: &[Component]) -> Result<(), Vec<ValidationError>> {
    let mut errs = Vec::new();
    let mut seen = BTreeSet::new();
    for c in components {
        if !is_dns_label(&c.name) {
            errs.push(ValidationError::InvalidName(c.name.clone()));
        }
        if !seen.insert(c.name.as_str()) {
            errs.push(ValidationError::DuplicateComponent(c.name.clone()));
        }
        let found = match &c.spec {
            serde_json::Value::Object(_) => None,
            serde_json::Value::Null => Some("null"),
            serde_json::Value::Array(_) => Some("array"),
            serde_json::Value::String(_) => Some("string"),
            serde_json::Value::Number(_) => Some("number"),
            serde_json::Value::Bool(_) => Some("bool"),
        };
        if let Some(found) = found {
            errs.push(ValidationError::SpecNotObject { component: c.name.clone(), found });
        }
        for k in c.labels.keys() {
            if k.trim().is_empty() {
                errs.push(ValidationError::EmptyLabelKey { component: c.name.clone(), key: k.clone() });
            }
        }
    }
    if errs.is_empty() { Ok(()) } else { Err(errs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_distinguishes_release_other_and_foreign() {
        let rel = ReleaseIdentity::derive("shop", "prod", "m");
        let other = ReleaseIdentity::derive("blog", "prod", "m");
        let mine = ownership_labels(&rel, "web");
        assert_eq!(ownership(&mine, &rel), Ownership::Release);
        assert_eq!(ownership(&mine, &other), Ownership::OtherRelease);
        let bare = Labels::new();
        assert_eq!(ownership(&bare, &rel), Ownership::Foreign);
    }

    #[test]
    fn validation_collects_all_problems() {
        let comps = vec![
            Component::new("web"),
            Component::new("web"),
            Component::new("Bad_Name"),
            Component::new("nulls").with_spec(serde_json::Value::Null),
        ];
        let errs = validate_components(&comps).unwrap_err();
        assert_eq!(errs.len(), 3, "errs={:?}", errs);
        assert!(errs.contains(&ValidationError::DuplicateComponent("web".into())));
        assert!(errs.contains(&ValidationError::InvalidName("Bad_Name".into())));
    }

    #[test]
    fn dns_labels() {
        assert!(is_dns_label("web-1"));
        assert!(!is_dns_label("-web"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
