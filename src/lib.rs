//! Flowfilter: a compiled filter engine for network flow records.
//!
//! Filter text in a small tcpdump-like language is parsed into an AST and
//! lowered into a chain of comparison blocks that a non-recursive evaluator
//! walks per record. Compilation happens once per filter, off the hot path;
//! evaluation is allocation-free and safe to run concurrently from many
//! worker threads over one shared [`CompiledFilter`].
//!
//! # Example
//! ```
//! use flowfilter::{compile, EvalContext, FlowRecord, RecordField};
//!
//! let filter = compile("proto 6 and dst port 80").unwrap();
//! let mut record = FlowRecord::new();
//! record.set(RecordField::Proto, 6).set(RecordField::DstPort, 80);
//! assert!(filter.evaluate(&record, &EvalContext::new()));
//! ```

mod compiler;
mod context;
mod error;
mod expr;
mod filter;
mod record;
mod set;

pub use compiler::compile_expr;
pub use context::EvalContext;
pub use error::FilterError;
pub use expr::{
    proto_number, Addr, CmpOp, Comparison, Direction, Field, FilterExpr, FilterParser, NetMask,
    Operand,
};
pub use filter::{Block, CompiledFilter, Comparator, Metric, MetricOp, Target};
pub use record::{
    descriptor, verify_layout, FieldDescriptor, FlowRecord, RecordField, FIELD_TABLE, FLAG_IPV6,
    RECORD_WORDS,
};
pub use set::{AddrSet, MembershipSet, ValueSet};

use std::sync::OnceLock;

/// Compile filter text into an executable program.
///
/// The first call validates the record layout table; a mismatch there is a
/// deployment error and every subsequent compile fails with the same
/// [`FilterError::Layout`], so callers should treat it as fatal.
pub fn compile(text: &str) -> Result<CompiledFilter, FilterError> {
    static LAYOUT: OnceLock<Result<(), FilterError>> = OnceLock::new();
    LAYOUT.get_or_init(record::verify_layout).clone()?;
    let expr = FilterParser::parse(text)?;
    compiler::compile_expr(&expr)
}
