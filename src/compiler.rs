//! Code generator: lowers a parsed [`FilterExpr`] into a [`CompiledFilter`]
//! block chain.
//!
//! Lowering walks the AST with a pair of continuation targets `(on_true,
//! on_false)`. `and` threads the left operand's true edge into the right
//! operand's entry, `or` threads the false edge, and `not` simply swaps the
//! pair, pushing negation down to the leaves. Operands are lowered
//! right-to-left so every block's successors are either sentinels or blocks
//! that already exist at lower arena indices. Cycles are therefore impossible
//! by construction, and evaluation always walks toward lower indices.

use crate::error::FilterError;
use crate::expr::{Addr, CmpOp, Comparison, Direction, Field, FilterExpr, NetMask, Operand};
use crate::filter::{Block, CompiledFilter, Comparator, Metric, MetricOp, Target};
use crate::record::{descriptor, FieldDescriptor, RecordField, FLAG_IPV6};
use crate::set::{AddrSet, ValueSet};

/// Lower an AST into an executable block chain.
pub fn compile_expr(expr: &FilterExpr) -> Result<CompiledFilter, FilterError> {
    let mut c = Compiler { blocks: Vec::new(), extended: false };
    let entry = c.lower(expr, Target::Accept, Target::Reject)?;
    Ok(CompiledFilter { blocks: c.blocks, entry, extended: c.extended })
}

struct Compiler {
    blocks: Vec<Block>,
    extended: bool,
}

impl Compiler {
    fn push(&mut self, block: Block) -> Target {
        self.blocks.push(block);
        Target::Block(self.blocks.len() - 1)
    }

    fn push_field(
        &mut self,
        d: &FieldDescriptor,
        cmp: Comparator,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        self.push(Block { word: d.word, shift: d.shift, mask: d.mask(), cmp, on_true, on_false })
    }

    fn lower(
        &mut self,
        expr: &FilterExpr,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        match expr {
            FilterExpr::And(l, r) => {
                let r_entry = self.lower(r, on_true, on_false)?;
                self.lower(l, r_entry, on_false)
            }
            FilterExpr::Or(l, r) => {
                let r_entry = self.lower(r, on_true, on_false)?;
                self.lower(l, on_true, r_entry)
            }
            FilterExpr::Not(e) => self.lower(e, on_false, on_true),
            FilterExpr::Compare(c) => self.lower_compare(c, on_true, on_false),
        }
    }

    fn lower_compare(
        &mut self,
        c: &Comparison,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        match c.field {
            Field::Any => {
                // Matches every record; kept as a real block so `not any`
                // falls out of the usual target swap.
                Ok(self.push(Block {
                    word: 0,
                    shift: 0,
                    mask: 0,
                    cmp: Comparator::Eq(0),
                    on_true,
                    on_false,
                }))
            }
            Field::Ipv4 => Ok(self.family_block(false, on_true, on_false)),
            Field::Ipv6 => Ok(self.family_block(true, on_true, on_false)),
            Field::Proto => self.scalar_block(c, RecordField::Proto, on_true, on_false),
            Field::Tos => self.scalar_block(c, RecordField::Tos, on_true, on_false),
            Field::InIf => self.scalar_block(c, RecordField::InputIf, on_true, on_false),
            Field::OutIf => self.scalar_block(c, RecordField::OutputIf, on_true, on_false),
            Field::Packets => self.scalar_block(c, RecordField::Packets, on_true, on_false),
            Field::Bytes => self.scalar_block(c, RecordField::Bytes, on_true, on_false),
            Field::Flags => {
                let d = descriptor(RecordField::TcpFlags);
                let cmp = match &c.operand {
                    Operand::FlagBits(bits) => Comparator::BitsSet(u64::from(*bits)),
                    Operand::Number(n) => scalar_cmp(c.op, *n),
                    _ => return Err(FilterError::semantic("flags expects a flag combination or a number")),
                };
                Ok(self.push_field(d, cmp, on_true, on_false))
            }
            Field::IcmpType => self.icmp_block(c, 8, on_true, on_false),
            Field::IcmpCode => self.icmp_block(c, 0, on_true, on_false),
            Field::Port => self.paired_numeric(
                c,
                RecordField::SrcPort,
                RecordField::DstPort,
                on_true,
                on_false,
            ),
            Field::As => self.paired_numeric(
                c,
                RecordField::SrcAs,
                RecordField::DstAs,
                on_true,
                on_false,
            ),
            Field::Ip => self.addr_compare(c, on_true, on_false),
            Field::Net => self.net_compare(c, on_true, on_false),
            Field::Duration => self.metric_block(c, Metric::Duration, on_true, on_false),
            Field::Pps => self.metric_block(c, Metric::Pps, on_true, on_false),
            Field::Bps => self.metric_block(c, Metric::Bps, on_true, on_false),
            Field::Bpp => self.metric_block(c, Metric::Bpp, on_true, on_false),
            Field::Ident => {
                let name = match &c.operand {
                    Operand::Ident(name) => name.clone(),
                    _ => return Err(FilterError::semantic("ident expects an identifier")),
                };
                Ok(self.push(Block {
                    word: 0,
                    shift: 0,
                    mask: 0,
                    cmp: Comparator::Ident(name),
                    on_true,
                    on_false,
                }))
            }
        }
    }

    /// Single-field numeric comparison.
    fn scalar_block(
        &mut self,
        c: &Comparison,
        field: RecordField,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let value = expect_number(&c.operand)?;
        Ok(self.push_field(descriptor(field), scalar_cmp(c.op, value), on_true, on_false))
    }

    /// Family-flag test: bit 0 of the record flags selects IPv6.
    fn family_block(&mut self, v6: bool, on_true: Target, on_false: Target) -> Target {
        let d = descriptor(RecordField::RecordFlags);
        self.push(Block {
            word: d.word,
            shift: d.shift,
            mask: FLAG_IPV6,
            cmp: Comparator::Eq(u64::from(v6)),
            on_true,
            on_false,
        })
    }

    /// ICMP type and code live in the two halves of the destination port.
    fn icmp_block(
        &mut self,
        c: &Comparison,
        sub_shift: u32,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let value = expect_number(&c.operand)?;
        if value > 0xff {
            return Err(FilterError::semantic(format!("icmp value {value} exceeds 255")));
        }
        let d = descriptor(RecordField::DstPort);
        Ok(self.push(Block {
            word: d.word,
            shift: d.shift + sub_shift,
            mask: 0xff,
            cmp: scalar_cmp(c.op, value),
            on_true,
            on_false,
        }))
    }

    fn metric_block(
        &mut self,
        c: &Comparison,
        metric: Metric,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let value = expect_number(&c.operand)?;
        let op = match c.op {
            CmpOp::Eq => MetricOp::Eq,
            CmpOp::Lt => MetricOp::Lt,
            CmpOp::Gt => MetricOp::Gt,
        };
        self.extended = true;
        Ok(self.push(Block {
            word: 0,
            shift: 0,
            mask: 0,
            cmp: Comparator::Metric { metric, op, value },
            on_true,
            on_false,
        }))
    }

    /// Numeric comparison on a src/dst field pair. A bare direction expands
    /// to src-or-dst: the src block's false edge falls through to the dst
    /// block.
    fn paired_numeric(
        &mut self,
        c: &Comparison,
        src: RecordField,
        dst: RecordField,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let cmp = match &c.operand {
            Operand::Number(n) => scalar_cmp(c.op, *n),
            Operand::NumberList(values) => {
                self.extended = true;
                Comparator::InSet(values.iter().copied().collect::<ValueSet>())
            }
            _ => return Err(FilterError::semantic("expected a number or a list")),
        };
        Ok(match c.dir {
            Direction::Src => self.push_field(descriptor(src), cmp, on_true, on_false),
            Direction::Dst => self.push_field(descriptor(dst), cmp, on_true, on_false),
            Direction::Either => {
                let dst_entry = self.push_field(descriptor(dst), cmp.clone(), on_true, on_false);
                self.push_field(descriptor(src), cmp, on_true, dst_entry)
            }
        })
    }

    /// `ip`/`host` equality against one address or an address list. The
    /// family test is fused in front of the value chain so the overlapping
    /// v4/v6 words are never misread.
    fn addr_compare(
        &mut self,
        c: &Comparison,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        match &c.operand {
            Operand::Addr(Addr::V4(a)) => {
                let value = u64::from(*a);
                let chain = match c.dir {
                    Direction::Src => self.v4_block(
                        RecordField::SrcAddrV4,
                        u32::MAX,
                        value,
                        on_true,
                        on_false,
                    ),
                    Direction::Dst => self.v4_block(
                        RecordField::DstAddrV4,
                        u32::MAX,
                        value,
                        on_true,
                        on_false,
                    ),
                    Direction::Either => {
                        let dst = self.v4_block(
                            RecordField::DstAddrV4,
                            u32::MAX,
                            value,
                            on_true,
                            on_false,
                        );
                        self.v4_block(RecordField::SrcAddrV4, u32::MAX, value, on_true, dst)
                    }
                };
                Ok(self.family_block(false, chain, on_false))
            }
            Operand::Addr(Addr::V6(a)) => {
                self.extended = true;
                let chain = match c.dir {
                    Direction::Src => self.v6_src_chain(*a, u128::MAX, on_true, on_false),
                    Direction::Dst => self.v6_dst_chain(*a, u128::MAX, on_true, on_false),
                    Direction::Either => {
                        let dst = self.v6_dst_chain(*a, u128::MAX, on_true, on_false);
                        self.v6_src_chain(*a, u128::MAX, on_true, dst)
                    }
                };
                Ok(self.family_block(true, chain, on_false))
            }
            Operand::AddrList(addrs) => self.addr_list(c, addrs, on_true, on_false),
            _ => Err(FilterError::semantic("ip expects an address")),
        }
    }

    /// Network comparison: the written mask is resolved here because word
    /// granularity differs between families.
    fn net_compare(
        &mut self,
        c: &Comparison,
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let (addr, mask) = match &c.operand {
            Operand::Net { addr, mask } => (*addr, *mask),
            _ => return Err(FilterError::semantic("net expects an address and a mask")),
        };
        match addr {
            Addr::V4(a) => {
                let mask32 = match mask {
                    NetMask::Prefix(p) if p <= 32 => prefix_mask_v4(p),
                    NetMask::Prefix(p) => {
                        return Err(FilterError::semantic(format!("prefix /{p} too long for an IPv4 net")))
                    }
                    NetMask::V4Mask(m) => m,
                };
                let value = u64::from(a & mask32);
                let chain = match c.dir {
                    Direction::Src => {
                        self.v4_block(RecordField::SrcAddrV4, mask32, value, on_true, on_false)
                    }
                    Direction::Dst => {
                        self.v4_block(RecordField::DstAddrV4, mask32, value, on_true, on_false)
                    }
                    Direction::Either => {
                        let dst = self.v4_block(
                            RecordField::DstAddrV4,
                            mask32,
                            value,
                            on_true,
                            on_false,
                        );
                        self.v4_block(RecordField::SrcAddrV4, mask32, value, on_true, dst)
                    }
                };
                Ok(self.family_block(false, chain, on_false))
            }
            Addr::V6(a) => {
                let prefix = match mask {
                    NetMask::Prefix(p) if p <= 128 => p,
                    NetMask::Prefix(p) => {
                        return Err(FilterError::semantic(format!("prefix /{p} too long for an IPv6 net")))
                    }
                    NetMask::V4Mask(_) => {
                        return Err(FilterError::semantic("dotted netmask is not valid for an IPv6 net"))
                    }
                };
                let mask128 = prefix_mask_v6(prefix);
                let value = a & mask128;
                self.extended = true;
                let chain = match c.dir {
                    Direction::Src => self.v6_src_chain(value, mask128, on_true, on_false),
                    Direction::Dst => self.v6_dst_chain(value, mask128, on_true, on_false),
                    Direction::Either => {
                        let dst = self.v6_dst_chain(value, mask128, on_true, on_false);
                        self.v6_src_chain(value, mask128, on_true, dst)
                    }
                };
                Ok(self.family_block(true, chain, on_false))
            }
        }
    }

    fn addr_list(
        &mut self,
        c: &Comparison,
        addrs: &[Addr],
        on_true: Target,
        on_false: Target,
    ) -> Result<Target, FilterError> {
        let all_v4 = addrs.iter().all(|a| matches!(a, Addr::V4(_)));
        let all_v6 = addrs.iter().all(|a| matches!(a, Addr::V6(_)));
        if !all_v4 && !all_v6 {
            return Err(FilterError::semantic("address list mixes IPv4 and IPv6 members"));
        }
        self.extended = true;
        if all_v4 {
            let set: ValueSet = addrs
                .iter()
                .filter_map(|a| match a {
                    Addr::V4(v) => Some(u64::from(*v)),
                    Addr::V6(_) => None,
                })
                .collect();
            let src = descriptor(RecordField::SrcAddrV4);
            let dst = descriptor(RecordField::DstAddrV4);
            let chain = match c.dir {
                Direction::Src => {
                    self.push_field(src, Comparator::InSet(set), on_true, on_false)
                }
                Direction::Dst => {
                    self.push_field(dst, Comparator::InSet(set), on_true, on_false)
                }
                Direction::Either => {
                    let dst_entry =
                        self.push_field(dst, Comparator::InSet(set.clone()), on_true, on_false);
                    self.push_field(src, Comparator::InSet(set), on_true, dst_entry)
                }
            };
            Ok(self.family_block(false, chain, on_false))
        } else {
            let set: AddrSet = addrs
                .iter()
                .filter_map(|a| match a {
                    Addr::V6(v) => Some(*v),
                    Addr::V4(_) => None,
                })
                .collect();
            let chain = match c.dir {
                Direction::Src => {
                    self.v6_set_block(RecordField::SrcAddrHi, set, on_true, on_false)
                }
                Direction::Dst => {
                    self.v6_set_block(RecordField::DstAddrHi, set, on_true, on_false)
                }
                Direction::Either => {
                    let dst =
                        self.v6_set_block(RecordField::DstAddrHi, set.clone(), on_true, on_false);
                    self.v6_set_block(RecordField::SrcAddrHi, set, on_true, dst)
                }
            };
            Ok(self.family_block(true, chain, on_false))
        }
    }

    /// IPv4 value or net test; `mask32` is the full field for plain address
    /// equality and the resolved netmask for `net`.
    fn v4_block(
        &mut self,
        field: RecordField,
        mask32: u32,
        value: u64,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        let d = descriptor(field);
        self.push(Block {
            word: d.word,
            shift: d.shift,
            mask: u64::from(mask32),
            cmp: Comparator::Eq(value),
            on_true,
            on_false,
        })
    }

    fn v6_src_chain(
        &mut self,
        value: u128,
        mask128: u128,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        self.v6_chain(
            RecordField::SrcAddrHi,
            RecordField::SrcAddrLo,
            value,
            mask128,
            on_true,
            on_false,
        )
    }

    fn v6_dst_chain(
        &mut self,
        value: u128,
        mask128: u128,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        self.v6_chain(
            RecordField::DstAddrHi,
            RecordField::DstAddrLo,
            value,
            mask128,
            on_true,
            on_false,
        )
    }

    /// Two-word 128-bit comparison: high word first, low word only when the
    /// mask reaches into it.
    fn v6_chain(
        &mut self,
        hi: RecordField,
        lo: RecordField,
        value: u128,
        mask128: u128,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        let (hi_mask, lo_mask) = ((mask128 >> 64) as u64, mask128 as u64);
        let (hi_val, lo_val) = ((value >> 64) as u64, value as u64);
        let hi_next = if lo_mask == 0 {
            on_true
        } else {
            let d = descriptor(lo);
            self.push(Block {
                word: d.word,
                shift: 0,
                mask: lo_mask,
                cmp: Comparator::Eq(lo_val),
                on_true,
                on_false,
            })
        };
        let d = descriptor(hi);
        self.push(Block {
            word: d.word,
            shift: 0,
            mask: hi_mask,
            cmp: Comparator::Eq(hi_val),
            on_true: hi_next,
            on_false,
        })
    }

    fn v6_set_block(
        &mut self,
        hi: RecordField,
        set: AddrSet,
        on_true: Target,
        on_false: Target,
    ) -> Target {
        let d = descriptor(hi);
        self.push(Block {
            word: d.word,
            shift: 0,
            mask: u64::MAX,
            cmp: Comparator::InAddrSet(set),
            on_true,
            on_false,
        })
    }
}

fn scalar_cmp(op: CmpOp, value: u64) -> Comparator {
    match op {
        CmpOp::Eq => Comparator::Eq(value),
        CmpOp::Lt => Comparator::Lt(value),
        CmpOp::Gt => Comparator::Gt(value),
    }
}

fn expect_number(operand: &Operand) -> Result<u64, FilterError> {
    match operand {
        Operand::Number(n) => Ok(*n),
        _ => Err(FilterError::semantic("expected a number")),
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::FilterParser;

    fn compile(text: &str) -> CompiledFilter {
        compile_expr(&FilterParser::parse(text).unwrap()).unwrap()
    }

    fn successors(f: &CompiledFilter) -> impl Iterator<Item = (usize, Target)> + '_ {
        f.blocks
            .iter()
            .enumerate()
            .flat_map(|(i, b)| [(i, b.on_true), (i, b.on_false)])
    }

    #[test]
    fn test_single_comparison_is_one_block() {
        let f = compile("proto 6");
        assert_eq!(f.num_blocks(), 1);
        assert_eq!(f.blocks[0].cmp, Comparator::Eq(6));
        assert_eq!(f.blocks[0].on_true, Target::Accept);
        assert_eq!(f.blocks[0].on_false, Target::Reject);
    }

    #[test]
    fn test_and_threads_true_edge() {
        let f = compile("proto 6 and src port 80");
        // Right operand is built first, so the entry (left operand) is the
        // last block and its true edge points into the right operand.
        let entry = match f.entry {
            Target::Block(i) => i,
            other => panic!("entry {other:?}"),
        };
        let left = &f.blocks[entry];
        assert_eq!(left.on_false, Target::Reject);
        match left.on_true {
            Target::Block(i) => {
                assert_eq!(f.blocks[i].on_true, Target::Accept);
                assert_eq!(f.blocks[i].on_false, Target::Reject);
            }
            other => panic!("true edge {other:?}"),
        }
    }

    #[test]
    fn test_or_threads_false_edge() {
        let f = compile("proto 6 or proto 17");
        let entry = match f.entry {
            Target::Block(i) => i,
            other => panic!("entry {other:?}"),
        };
        let left = &f.blocks[entry];
        assert_eq!(left.on_true, Target::Accept);
        assert!(matches!(left.on_false, Target::Block(_)));
    }

    #[test]
    fn test_not_swaps_targets() {
        let f = compile("not proto 6");
        assert_eq!(f.num_blocks(), 1);
        assert_eq!(f.blocks[0].on_true, Target::Reject);
        assert_eq!(f.blocks[0].on_false, Target::Accept);
    }

    #[test]
    fn test_successors_point_strictly_downward() {
        let filters = [
            "proto 6 and (src port 80 or dst port 443) and not flags R",
            "ip 10.0.0.1 or net 172.16/16 and packets > 10",
            "src ip fe80::1 and dst net 2001:db8::/32 or duration > 100",
            "port in [80 443 8080] and not (tos 16 or in if 5)",
        ];
        for text in filters {
            let f = compile(text);
            for (i, t) in successors(&f) {
                if let Target::Block(j) = t {
                    assert!(j < i, "{text}: block {i} points up to {j}");
                }
            }
            assert!(matches!(f.entry, Target::Block(i) if i == f.num_blocks() - 1));
        }
    }

    #[test]
    fn test_family_test_guards_address_blocks() {
        let f = compile("src ip 10.0.0.1");
        // Entry is the family test; only its true edge reaches the value
        // block.
        let entry = match f.entry {
            Target::Block(i) => i,
            other => panic!("entry {other:?}"),
        };
        let family = &f.blocks[entry];
        assert_eq!(family.mask, FLAG_IPV6);
        assert_eq!(family.cmp, Comparator::Eq(0));
        assert_eq!(family.on_false, Target::Reject);
        assert!(matches!(family.on_true, Target::Block(_)));
    }

    #[test]
    fn test_v6_address_compares_both_words() {
        let f = compile("src ip 2001:db8::1");
        // family test + hi word + lo word
        assert_eq!(f.num_blocks(), 3);
        assert!(f.is_extended());
    }

    #[test]
    fn test_v6_net_within_high_word_skips_low_block() {
        let f = compile("src net 2001:db8::/32");
        // family test + hi word only
        assert_eq!(f.num_blocks(), 2);
        let f = compile("src net 2001:db8::/112");
        // /112 reaches into the low word
        assert_eq!(f.num_blocks(), 3);
    }

    #[test]
    fn test_partial_quad_net_resolves_mask() {
        let f = compile("src net 172.16/16");
        let value_block = f
            .blocks
            .iter()
            .find(|b| b.mask == u64::from(0xffff_0000u32))
            .expect("net block");
        assert_eq!(value_block.cmp, Comparator::Eq(u64::from(0xac10_0000u32)));
    }

    #[test]
    fn test_bare_direction_expands_to_both_sides() {
        let f = compile("port 80");
        assert_eq!(f.num_blocks(), 2);
        let entry = match f.entry {
            Target::Block(i) => i,
            other => panic!("entry {other:?}"),
        };
        let src = &f.blocks[entry];
        assert_eq!(src.on_true, Target::Accept);
        assert!(matches!(src.on_false, Target::Block(_)));
    }

    #[test]
    fn test_flags_letters_are_subset_test() {
        let f = compile("flags SF");
        assert_eq!(f.blocks[0].cmp, Comparator::BitsSet(3));
        let f = compile("flags 3");
        assert_eq!(f.blocks[0].cmp, Comparator::Eq(3));
    }

    #[test]
    fn test_icmp_fields_address_dst_port_halves() {
        let f = compile("icmp-type 8");
        assert_eq!(f.blocks[0].word, 4);
        assert_eq!(f.blocks[0].shift, 24);
        assert_eq!(f.blocks[0].mask, 0xff);
        let f = compile("icmp-code 1");
        assert_eq!(f.blocks[0].shift, 16);
    }

    #[test]
    fn test_icmp_value_out_of_range_is_rejected() {
        let expr = FilterParser::parse("icmp-type 256").unwrap();
        assert!(matches!(compile_expr(&expr), Err(FilterError::Semantic(_))));
    }

    #[test]
    fn test_mixed_family_list_is_rejected() {
        let expr = FilterParser::parse("ip in [10.0.0.1 fe80::1]").unwrap();
        assert!(matches!(compile_expr(&expr), Err(FilterError::Semantic(_))));
    }

    #[test]
    fn test_extended_flag_tracks_block_kinds() {
        assert!(!compile("proto 6 and port 80").is_extended());
        assert!(compile("src ip fe80::1").is_extended());
        assert!(compile("port in [80 443]").is_extended());
        assert!(compile("bps > 1k").is_extended());
    }

    #[test]
    fn test_list_builds_membership_set() {
        let f = compile("src port in [80 443 8080]");
        match &f.blocks[0].cmp {
            Comparator::InSet(set) => {
                assert_eq!(set.len(), 3);
                assert!(set.contains(&443));
            }
            other => panic!("{other:?}"),
        }
    }
}
