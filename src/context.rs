//! Per-session evaluation context.
//!
//! The only ambient input a filter can consult besides the record itself is
//! the current source-channel identifier, matched by `ident` comparisons. It
//! is an explicit per-session value passed to `evaluate`, not process-global
//! state, which keeps the evaluator a pure function of its arguments.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalContext {
    ident: Option<String>,
}

impl EvalContext {
    /// Context with no current identifier; positive `ident` filters never
    /// match against it.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ident(ident: impl Into<String>) -> Self {
        Self { ident: Some(ident.into()) }
    }

    pub fn set_ident(&mut self, ident: impl Into<String>) {
        self.ident = Some(ident.into());
    }

    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }
}
