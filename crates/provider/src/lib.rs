//! Keel providers: a catalog of transformers keyed by FQN.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::Transformer;
use thiserror::Error;
use tracing::debug;

pub mod kubernetes;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transformer {0} is already registered")]
    Duplicate(String),
    #[error("transformer fqn must not be empty")]
    EmptyFqn,
    #[error("transformer {0} declares no requirements and would match every component")]
    Unconstrained(String),
}

/// A provider's transformer catalog. Loaded once, immutable after.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub version: String,
    transformers: BTreeMap<String, Transformer>,
}

impl Provider {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into(), transformers: BTreeMap::new() }
    }

    /// Register a transformer. A second registration under the same FQN is
    /// rejected rather than silently shadowing the first.
    pub fn register(&mut self, t: Transformer) -> Result<(), RegistryError> {
        if t.fqn.trim().is_empty() {
            return Err(RegistryError::EmptyFqn);
        }
        if t.required.is_empty() {
            return Err(RegistryError::Unconstrained(t.fqn));
        }
        if self.transformers.contains_key(&t.fqn) {
            return Err(RegistryError::Duplicate(t.fqn));
        }
        debug!(provider = %self.name, fqn = %t.fqn, required = %t.required, "transformer registered");
        self.transformers.insert(t.fqn.clone(), t);
        Ok(())
    }

    pub fn with(mut self, t: Transformer) -> Result<Self, RegistryError> {
        self.register(t)?;
        Ok(self)
    }

    /// Transformers in FQN order.
    pub fn transformers(&self) -> Vec<Transformer> {
        self.transformers.values().cloned().collect()
    }

    pub fn get(&self, fqn: &str) -> Option<&Transformer> {
        self.transformers.get(fqn)
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}
