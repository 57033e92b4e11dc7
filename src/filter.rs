//! Compiled filter: the block-chain program and its evaluator.
//!
//! A [`CompiledFilter`] is an arena of [`Block`]s plus an entry [`Target`].
//! Each block extracts one masked word (or word pair, or derived metric) from
//! the record, runs its comparator, and jumps to one of two successor
//! targets. The code generator only ever wires successors to already
//! allocated blocks or to the Accept/Reject sentinels, so every chain is
//! acyclic by construction and evaluation is a plain loop: no recursion, no
//! allocation, bounded by the number of leaf comparisons in the filter.
//!
//! Evaluation takes `&self` and touches no shared mutable state, so one
//! compiled filter can be shared across any number of worker threads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::EvalContext;
use crate::record::FlowRecord;
use crate::set::{AddrSet, ValueSet};

/// Successor of a block: another block in the arena or a final verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    Accept,
    Reject,
    Block(usize),
}

/// Derived per-record metrics, computed at evaluation time from the stored
/// counters because they depend on the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Milliseconds between first and last packet.
    Duration,
    /// Packets per second.
    Pps,
    /// Bits per second.
    Bps,
    /// Bytes per packet.
    Bpp,
}

/// Operator for metric comparisons (mirrors the grammar's eq/lt/gt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricOp {
    Eq,
    Lt,
    Gt,
}

/// The test a block runs on its extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Comparator {
    Eq(u64),
    /// Not produced by the filter grammar, which lowers negation by swapping
    /// successor targets; available to programs built directly.
    Ne(u64),
    Lt(u64),
    Gt(u64),
    /// Subset-of-bits: all compare bits must be set, other bits are ignored.
    BitsSet(u64),
    /// Membership lookup over 64-bit keys (ports, AS numbers, v4 addresses).
    InSet(ValueSet),
    /// Membership lookup over a two-word IPv6 address; reads this block's
    /// word as the high half and the following word as the low half.
    InAddrSet(AddrSet),
    /// Derived-metric comparison; the extraction fields are unused.
    Metric { metric: Metric, op: MetricOp, value: u64 },
    /// Exact match against the session's current channel identifier.
    Ident(String),
}

/// One elementary comparison step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Word index into the record.
    pub word: usize,
    /// Right-shift applied before masking.
    pub shift: u32,
    /// Extraction mask applied after shifting. For `net` blocks this is the
    /// resolved netmask rather than a field-width mask.
    pub mask: u64,
    pub cmp: Comparator,
    pub on_true: Target,
    pub on_false: Target,
}

/// A filter lowered to a block chain, ready for per-record evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFilter {
    pub(crate) blocks: Vec<Block>,
    pub(crate) entry: Target,
    pub(crate) extended: bool,
}

impl CompiledFilter {
    /// Evaluate one record. Pure: reads the record and context, mutates
    /// nothing, terminates after at most one step per block.
    pub fn evaluate(&self, record: &FlowRecord, ctx: &EvalContext) -> bool {
        let mut target = self.entry;
        loop {
            let idx = match target {
                Target::Accept => return true,
                Target::Reject => return false,
                Target::Block(idx) => idx,
            };
            let block = &self.blocks[idx];
            let value = (record.word(block.word) >> block.shift) & block.mask;
            let hit = match &block.cmp {
                Comparator::Eq(v) => value == *v,
                Comparator::Ne(v) => value != *v,
                Comparator::Lt(v) => value < *v,
                Comparator::Gt(v) => value > *v,
                Comparator::BitsSet(bits) => value & bits == *bits,
                Comparator::InSet(set) => set.contains(&value),
                Comparator::InAddrSet(set) => {
                    let pair = (u128::from(record.word(block.word)) << 64)
                        | u128::from(record.word(block.word + 1));
                    set.contains(&pair)
                }
                Comparator::Metric { metric, op, value } => {
                    metric_compare(record, *metric, *op, *value)
                }
                Comparator::Ident(name) => ctx.ident() == Some(name.as_str()),
            };
            target = if hit { block.on_true } else { block.on_false };
        }
    }

    /// Number of blocks in the chain.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Whether any block needs multi-word, membership-set, or derived-metric
    /// evaluation. Reporting only; never consulted for correctness.
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

/// Evaluate one derived-metric comparison.
///
/// Zero-denominator convention: when duration (for pps/bps) or the packet
/// count (for bpp) is zero the metric is undefined and no positive comparison
/// matches; the block takes its false branch. A negative raw duration (a
/// malformed record) is clamped to zero.
fn metric_compare(record: &FlowRecord, metric: Metric, op: MetricOp, value: u64) -> bool {
    let duration = duration_ms(record);
    let computed = match metric {
        Metric::Duration => duration,
        Metric::Pps => {
            if duration == 0 {
                return false;
            }
            record.get(crate::record::RecordField::Packets) as u128 * 1000 / duration as u128
        }
        Metric::Bps => {
            if duration == 0 {
                return false;
            }
            record.get(crate::record::RecordField::Bytes) as u128 * 8 * 1000 / duration as u128
        }
        Metric::Bpp => {
            let packets = record.get(crate::record::RecordField::Packets);
            if packets == 0 {
                return false;
            }
            record.get(crate::record::RecordField::Bytes) as u128 / packets as u128
        }
    };
    match op {
        MetricOp::Eq => computed == u128::from(value),
        MetricOp::Lt => computed < u128::from(value),
        MetricOp::Gt => computed > u128::from(value),
    }
}

fn duration_ms(record: &FlowRecord) -> u128 {
    use crate::record::RecordField;
    let secs = record.get(RecordField::Last) as i64 - record.get(RecordField::First) as i64;
    let msecs =
        record.get(RecordField::MsecLast) as i64 - record.get(RecordField::MsecFirst) as i64;
    (secs * 1000 + msecs).max(0) as u128
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Accept => write!(f, "accept"),
            Target::Reject => write!(f, "reject"),
            Target::Block(idx) => write!(f, "#{idx}"),
        }
    }
}

/// Diagnostic dump of the block chain, one block per line.
impl fmt::Display for CompiledFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "entry {} blocks {} extended {}",
            self.entry,
            self.blocks.len(),
            self.extended
        )?;
        for (idx, b) in self.blocks.iter().enumerate() {
            writeln!(
                f,
                "#{idx}: word {} shift {} mask {:#018x} {:?} true->{} false->{}",
                b.word, b.shift, b.mask, b.cmp, b.on_true, b.on_false
            )?;
        }
        Ok(())
    }
}
