//! Task-local evaluation arenas.
//!
//! Every concurrent transform rebuilds its inputs from immutable source bytes
//! inside its own [`Evaluation`]. Values carry the id of the evaluation that
//! produced them; handing a value to a different evaluation is an error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use keel_core::{Transformer, TransformerContext};
use serde_json::Value as Json;
use thiserror::Error;

static NEXT_EVAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("value from evaluation {found} used in evaluation {expected}")]
    ForeignValue { expected: u64, found: u64 },
    #[error("rebuilding spec from source: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0:#}")]
    Transform(anyhow::Error),
    #[error("transform panicked: {0}")]
    Panicked(String),
}

/// A value bound to the evaluation that produced it.
#[derive(Debug)]
pub struct Scoped<T> {
    scope: u64,
    value: T,
}

impl<T> Scoped<T> {
    pub fn scope(&self) -> u64 {
        self.scope
    }
}

/// One isolated evaluation instance. Not `Clone`; never shared across tasks.
#[derive(Debug)]
pub struct Evaluation {
    id: u64,
}

impl Default for Evaluation {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluation {
    pub fn new() -> Self {
        Self { id: NEXT_EVAL_ID.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rebuild a spec value from its serialized source.
    pub fn load(&self, source: &[u8]) -> Result<Scoped<Json>, EvalError> {
        let value = serde_json::from_slice(source)?;
        Ok(self.bind(value))
    }

    pub fn bind<T>(&self, value: T) -> Scoped<T> {
        Scoped { scope: self.id, value }
    }

    fn check<T>(&self, v: &Scoped<T>) -> Result<(), EvalError> {
        if v.scope != self.id {
            return Err(EvalError::ForeignValue { expected: self.id, found: v.scope });
        }
        Ok(())
    }

    /// Run `t` on a spec and context that both belong to this evaluation.
    pub fn apply(
        &self,
        t: &Transformer,
        spec: &Scoped<Json>,
        ctx: &Scoped<TransformerContext>,
    ) -> Result<Scoped<Json>, EvalError> {
        self.check(spec)?;
        self.check(ctx)?;
        let f = t.transform;
        let out = catch_unwind(AssertUnwindSafe(|| f(&spec.value, &ctx.value)))
            .map_err(|p| EvalError::Panicked(panic_message(p)))?
            .map_err(EvalError::Transform)?;
        Ok(self.bind(out))
    }

    /// Take a value out of the arena, checking it was produced here.
    pub fn take<T>(&self, v: Scoped<T>) -> Result<T, EvalError> {
        self.check(&v)?;
        Ok(v.value)
    }
}

fn panic_message(p: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = p.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}
