//! Unified error type for all fallible flowfilter operations.

use thiserror::Error;

/// Errors surfaced by filter compilation and the record layout self-check.
///
/// Evaluation itself is infallible by design: every runtime edge case
/// (including undefined derived metrics) has a defined match/no-match
/// convention, so `evaluate` returns a plain `bool`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The filter text could not be tokenized or parsed. `pos` is the byte
    /// offset of the offending token in the input.
    #[error("syntax error at offset {pos}: {msg}")]
    Syntax { pos: usize, msg: String },

    /// The filter parsed but cannot be lowered to a block chain, e.g. an
    /// operator that is not defined for the field, or a mixed-family
    /// address list.
    #[error("invalid filter: {0}")]
    Semantic(String),

    /// The field descriptor table no longer matches the documented record
    /// layout. This indicates a build mismatch; callers must treat it as
    /// fatal rather than filter with silently wrong offsets.
    #[error("record layout check failed: {0}")]
    Layout(String),
}

impl FilterError {
    pub(crate) fn syntax(pos: usize, msg: impl Into<String>) -> Self {
        FilterError::Syntax { pos, msg: msg.into() }
    }

    pub(crate) fn semantic(msg: impl Into<String>) -> Self {
        FilterError::Semantic(msg.into())
    }
}
