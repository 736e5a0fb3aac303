//! Render error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::Requirements;

/// Upstream component data is structurally invalid. Fatal before matching.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("component name {0:?} is not a valid DNS-1123 label")]
    InvalidName(String),
    #[error("component {0:?} is declared more than once")]
    DuplicateComponent(String),
    #[error("component {component:?}: spec must be an object, got {found}")]
    SpecNotObject { component: String, found: &'static str },
    #[error("component {component:?}: label key {key:?} is empty")]
    EmptyLabelKey { component: String, key: String },
}

/// A manifest returned by a transform could not be decoded into a resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("transform output must be an object, list or map of objects, got {0}")]
    Shape(&'static str),
}

/// A matched transform failed. Aggregated, never fatal mid-run.
#[derive(Debug, Clone, Error)]
#[error("component {component:?} via {transformer}: {cause}")]
pub struct TransformError {
    pub component: String,
    pub transformer: String,
    pub cause: String,
}

/// One component that no transformer accepted, with what was considered.
#[derive(Debug, Clone)]
pub struct UnmatchedComponent {
    pub component: String,
    /// `(transformer fqn, required set)` for every transformer considered.
    pub considered: Vec<(String, Requirements)>,
}

/// Aggregated diagnostic for every unmatched component in a render.
#[derive(Debug, Clone, Error)]
pub struct UnmatchedComponentError {
    pub components: Vec<UnmatchedComponent>,
}

impl fmt::Display for UnmatchedComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} component(s) matched no transformer", self.components.len())?;
        for u in &self.components {
            write!(f, "\n  component {:?}; considered:", u.component)?;
            if u.considered.is_empty() {
                write!(f, " (no transformers registered)")?;
            }
            for (fqn, req) in &u.considered {
                write!(f, "\n    {} requires {}", fqn, req)?;
            }
        }
        Ok(())
    }
}

/// Everything that can make a render unusable for apply.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid components: {}", join(.0))]
    Validation(Vec<ValidationError>),
    /// Matching and execution ran to the end; these are all the failures.
    #[error("{}", incomplete(.unmatched, .errors))]
    Incomplete {
        unmatched: Option<UnmatchedComponentError>,
        errors: Vec<TransformError>,
    },
    #[error("render cancelled")]
    Cancelled,
}

fn incomplete(unmatched: &Option<UnmatchedComponentError>, errors: &[TransformError]) -> String {
    let mut parts = Vec::new();
    if let Some(u) = unmatched {
        parts.push(u.to_string());
    }
    if !errors.is_empty() {
        parts.push(format!("{} transform(s) failed:\n  {}", errors.len(), join_lines(errors)));
    }
    parts.join("\n")
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_error_lists_every_considered_transformer() {
        let mut req = Requirements::default();
        req.resources.insert("Container".into());
        let e = UnmatchedComponentError {
            components: vec![UnmatchedComponent {
                component: "cache".into(),
                considered: vec![
                    ("kubernetes#deployment".into(), req.clone()),
                    ("kubernetes#service".into(), Requirements::default()),
                ],
            }],
        };
        let s = e.to_string();
        assert!(s.contains("\"cache\""), "s={}", s);
        assert!(s.contains("kubernetes#deployment requires resources[Container]"), "s={}", s);
        assert!(s.contains("kubernetes#service requires (none)"), "s={}", s);
    }

    #[test]
    fn incomplete_render_reports_unmatched_and_transform_errors() {
        let e = RenderError::Incomplete {
            unmatched: Some(UnmatchedComponentError {
                components: vec![UnmatchedComponent { component: "cache".into(), considered: vec![] }],
            }),
            errors: vec![
                TransformError { component: "a".into(), transformer: "t1".into(), cause: "boom".into() },
                TransformError { component: "b".into(), transformer: "t2".into(), cause: "bang".into() },
            ],
        };
        let s = e.to_string();
        assert!(s.starts_with("1 component(s) matched no transformer"), "s={}", s);
        assert!(s.contains("(no transformers registered)"), "s={}", s);
        assert!(s.contains("2 transform(s) failed"), "s={}", s);
        assert!(s.contains("component \"a\" via t1: boom"));
        assert!(s.contains("component \"b\" via t2: bang"));
    }
}
