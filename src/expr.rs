//! Expression (AST) module: the parsed representation of filter text.
//!
//! Filter text is tokenized and parsed by a hand-written recursive descent
//! parser into a [`FilterExpr`] tree. `and` and `or` have equal precedence
//! and associate left; `not` binds to a single term. The AST is consumed by
//! the code generator and discarded.

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Direction qualifier on a comparison. An absent qualifier means the
/// comparison matches if either side does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Src,
    Dst,
    Either,
}

/// Comparison operator. An omitted operator in filter text means equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Lt,
    Gt,
}

/// Filterable fields; a closed, domain-specific vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// `ip` / `host` address equality.
    Ip,
    Net,
    Port,
    Proto,
    As,
    Flags,
    Tos,
    InIf,
    OutIf,
    Packets,
    Bytes,
    Duration,
    Pps,
    Bps,
    Bpp,
    Ident,
    Ipv4,
    Ipv6,
    Any,
    IcmpType,
    IcmpCode,
}

/// An address literal, tagged with its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Addr {
    V4(u32),
    V6(u128),
}

/// A network mask as written, carried unresolved to the code generator
/// (word granularity differs between families).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMask {
    Prefix(u8),
    /// Explicit dotted netmask; IPv4 only.
    V4Mask(u32),
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Number(u64),
    Addr(Addr),
    Net { addr: Addr, mask: NetMask },
    /// TCP flag letter combination, already folded to bits.
    FlagBits(u8),
    NumberList(Vec<u64>),
    AddrList(Vec<Addr>),
    Ident(String),
    /// `ipv4` / `ipv6` / `any` take no operand.
    None,
}

/// One leaf comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub dir: Direction,
    pub field: Field,
    pub op: CmpOp,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Compare(Comparison),
}

/// Well-known protocol names accepted by `proto`.
pub fn proto_number(name: &str) -> Option<u64> {
    Some(match name {
        "icmp" => 1,
        "igmp" => 2,
        "ipip" => 4,
        "tcp" => 6,
        "udp" => 17,
        "rsvp" => 46,
        "gre" => 47,
        "esp" => 50,
        "ah" => 51,
        "icmp6" => 58,
        "ospf" => 89,
        "sctp" => 132,
        _ => return None,
    })
}

const FLAG_FIN: u8 = 1;
const FLAG_SYN: u8 = 2;
const FLAG_RST: u8 = 4;
const FLAG_PSH: u8 = 8;
const FLAG_ACK: u8 = 16;
const FLAG_URG: u8 = 32;
const FLAG_ALL: u8 = 63;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Lt,
    Gt,
    Word(String),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '-')
}

fn lex(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut it = input.char_indices().peekable();
    while let Some((pos, c)) = it.next() {
        let tok = match c {
            c if c.is_whitespace() => continue,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '<' => Tok::Lt,
            '>' => Tok::Gt,
            '=' => {
                // '=' and '==' both mean equality.
                if matches!(it.peek(), Some((_, '='))) {
                    it.next();
                }
                Tok::Eq
            }
            c if is_word_char(c) => {
                let mut end = pos + c.len_utf8();
                while let Some((i, c)) = it.peek().copied() {
                    if is_word_char(c) {
                        end = i + c.len_utf8();
                        it.next();
                    } else {
                        break;
                    }
                }
                Tok::Word(input[pos..end].to_string())
            }
            c => {
                return Err(FilterError::syntax(
                    pos,
                    format!("unexpected character '{c}'"),
                ))
            }
        };
        tokens.push(Token { tok, pos });
    }
    Ok(tokens)
}

/// Hand-written recursive descent parser over the token stream.
pub struct FilterParser {
    tokens: Vec<Token>,
    pos: usize,
    input_len: usize,
}

impl FilterParser {
    /// Parse filter text into an AST, or fail with the offending position.
    pub fn parse(input: &str) -> Result<FilterExpr, FilterError> {
        let tokens = lex(input)?;
        let mut parser = FilterParser { tokens, pos: 0, input_len: input.len() };
        if parser.at_end() {
            return Err(FilterError::syntax(0, "empty filter"));
        }
        let expr = parser.parse_expr()?;
        if !parser.at_end() {
            return Err(parser.err_here("unexpected trailing input"));
        }
        Ok(expr)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn cur(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn cur_pos(&self) -> usize {
        self.cur().map_or(self.input_len, |t| t.pos)
    }

    fn err_here(&self, msg: impl Into<String>) -> FilterError {
        FilterError::syntax(self.cur_pos(), msg)
    }

    fn eat_tok(&mut self, tok: &Tok) -> bool {
        if self.cur().map(|t| &t.tok) == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        match self.cur() {
            Some(Token { tok: Tok::Word(w), .. }) if w == word => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn peek_word(&self) -> Option<&str> {
        match self.cur() {
            Some(Token { tok: Tok::Word(w), .. }) => Some(w.as_str()),
            _ => None,
        }
    }

    fn expect_word(&mut self, what: &str) -> Result<(usize, String), FilterError> {
        match self.cur() {
            Some(Token { tok: Tok::Word(w), pos }) => {
                let out = (*pos, w.clone());
                self.pos += 1;
                Ok(out)
            }
            _ => Err(self.err_here(format!("expected {what}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<FilterExpr, FilterError> {
        // "and" and "or" share one precedence level, left associative; this
        // matches the original engine's evaluation order.
        let mut left = self.parse_term()?;
        loop {
            if self.eat_word("and") {
                let right = self.parse_term()?;
                left = FilterExpr::And(Box::new(left), Box::new(right));
            } else if self.eat_word("or") {
                let right = self.parse_term()?;
                left = FilterExpr::Or(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<FilterExpr, FilterError> {
        if self.eat_word("not") {
            let inner = self.parse_term()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        if self.eat_tok(&Tok::LParen) {
            let inner = self.parse_expr()?;
            if !self.eat_tok(&Tok::RParen) {
                return Err(self.err_here("expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr, FilterError> {
        let dir = if self.eat_word("src") {
            Direction::Src
        } else if self.eat_word("dst") {
            Direction::Dst
        } else {
            Direction::Either
        };

        if dir == Direction::Either {
            if self.peek_word() == Some("in") {
                // "in if N" is the input-interface comparison; a field's own
                // "in [...]" never reaches here because the field consumes it.
                self.pos += 1;
                if !self.eat_word("if") {
                    return Err(self.err_here("expected 'if' after 'in'"));
                }
                return self.numeric_comparison(Field::InIf, false);
            }
            if self.eat_word("out") {
                if !self.eat_word("if") {
                    return Err(self.err_here("expected 'if' after 'out'"));
                }
                return self.numeric_comparison(Field::OutIf, false);
            }
        }

        let (pos, field) = self.expect_word("field name")?;
        match field.as_str() {
            "ip" | "host" => self.addr_comparison(dir),
            "net" => self.net_comparison(dir),
            "port" => self.paired_numeric(dir, Field::Port),
            "as" => self.paired_numeric(dir, Field::As),
            "proto" => {
                self.no_direction(dir, pos, "proto")?;
                self.proto_comparison()
            }
            "flags" => {
                self.no_direction(dir, pos, "flags")?;
                self.flags_comparison()
            }
            "tos" => {
                self.no_direction(dir, pos, "tos")?;
                self.numeric_comparison(Field::Tos, false)
            }
            "packets" => {
                self.no_direction(dir, pos, "packets")?;
                self.numeric_comparison(Field::Packets, true)
            }
            "bytes" => {
                self.no_direction(dir, pos, "bytes")?;
                self.numeric_comparison(Field::Bytes, true)
            }
            "duration" => {
                self.no_direction(dir, pos, "duration")?;
                self.numeric_comparison(Field::Duration, true)
            }
            "pps" => {
                self.no_direction(dir, pos, "pps")?;
                self.numeric_comparison(Field::Pps, true)
            }
            "bps" => {
                self.no_direction(dir, pos, "bps")?;
                self.numeric_comparison(Field::Bps, true)
            }
            "bpp" => {
                self.no_direction(dir, pos, "bpp")?;
                self.numeric_comparison(Field::Bpp, true)
            }
            "icmp-type" => {
                self.no_direction(dir, pos, "icmp-type")?;
                self.numeric_comparison(Field::IcmpType, false)
            }
            "icmp-code" => {
                self.no_direction(dir, pos, "icmp-code")?;
                self.numeric_comparison(Field::IcmpCode, false)
            }
            "ident" => {
                self.no_direction(dir, pos, "ident")?;
                let (_, name) = self.expect_word("channel identifier")?;
                Ok(compare(Direction::Either, Field::Ident, CmpOp::Eq, Operand::Ident(name)))
            }
            "ipv4" => {
                self.no_direction(dir, pos, "ipv4")?;
                Ok(compare(Direction::Either, Field::Ipv4, CmpOp::Eq, Operand::None))
            }
            "ipv6" => {
                self.no_direction(dir, pos, "ipv6")?;
                Ok(compare(Direction::Either, Field::Ipv6, CmpOp::Eq, Operand::None))
            }
            "any" => {
                self.no_direction(dir, pos, "any")?;
                Ok(compare(Direction::Either, Field::Any, CmpOp::Eq, Operand::None))
            }
            _ => Err(FilterError::syntax(pos, format!("unknown field '{field}'"))),
        }
    }

    fn no_direction(&self, dir: Direction, pos: usize, name: &str) -> Result<(), FilterError> {
        if dir == Direction::Either {
            Ok(())
        } else {
            Err(FilterError::syntax(
                pos,
                format!("'src'/'dst' cannot qualify '{name}'"),
            ))
        }
    }

    fn parse_op(&mut self) -> Option<CmpOp> {
        let op = match self.cur().map(|t| &t.tok) {
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Word(w)) => match w.as_str() {
                "eq" => CmpOp::Eq,
                "lt" => CmpOp::Lt,
                "gt" => CmpOp::Gt,
                _ => return None,
            },
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn expect_number(&mut self, allow_suffix: bool) -> Result<u64, FilterError> {
        let (pos, word) = self.expect_word("number")?;
        parse_number(&word, pos, allow_suffix)
    }

    fn numeric_comparison(
        &mut self,
        field: Field,
        allow_suffix: bool,
    ) -> Result<FilterExpr, FilterError> {
        let op = self.parse_op().unwrap_or(CmpOp::Eq);
        let value = self.expect_number(allow_suffix)?;
        Ok(compare(Direction::Either, field, op, Operand::Number(value)))
    }

    fn paired_numeric(&mut self, dir: Direction, field: Field) -> Result<FilterExpr, FilterError> {
        if self.eat_word("in") {
            let list = self.number_list()?;
            return Ok(compare(dir, field, CmpOp::Eq, Operand::NumberList(list)));
        }
        let op = self.parse_op().unwrap_or(CmpOp::Eq);
        let value = self.expect_number(false)?;
        Ok(compare(dir, field, op, Operand::Number(value)))
    }

    fn addr_comparison(&mut self, dir: Direction) -> Result<FilterExpr, FilterError> {
        if self.eat_word("in") {
            let list = self.addr_list()?;
            return Ok(compare(dir, Field::Ip, CmpOp::Eq, Operand::AddrList(list)));
        }
        if let Some(op) = self.parse_op() {
            if op != CmpOp::Eq {
                return Err(self.err_here("ordered comparison not supported for addresses"));
            }
        }
        let (pos, word) = self.expect_word("address")?;
        let addr = parse_addr(&word, pos, false)?;
        Ok(compare(dir, Field::Ip, CmpOp::Eq, Operand::Addr(addr)))
    }

    fn net_comparison(&mut self, dir: Direction) -> Result<FilterExpr, FilterError> {
        let (pos, word) = self.expect_word("network")?;
        if let Some((addr_part, len_part)) = word.split_once('/') {
            let addr = parse_addr(addr_part, pos, true)?;
            let len: u8 = len_part
                .parse()
                .map_err(|_| FilterError::syntax(pos, "malformed prefix length"))?;
            let max = match addr {
                Addr::V4(_) => 32,
                Addr::V6(_) => 128,
            };
            if len > max {
                return Err(FilterError::syntax(
                    pos,
                    format!("prefix length /{len} out of range (max /{max})"),
                ));
            }
            return Ok(compare(
                dir,
                Field::Net,
                CmpOp::Eq,
                Operand::Net { addr, mask: NetMask::Prefix(len) },
            ));
        }
        let addr = parse_addr(&word, pos, true)?;
        if matches!(addr, Addr::V6(_)) {
            return Err(FilterError::syntax(pos, "IPv6 network requires a /prefix"));
        }
        let (mpos, mword) = self.expect_word("netmask")?;
        match parse_addr(&mword, mpos, false)? {
            Addr::V4(mask) => Ok(compare(
                dir,
                Field::Net,
                CmpOp::Eq,
                Operand::Net { addr, mask: NetMask::V4Mask(mask) },
            )),
            Addr::V6(_) => Err(FilterError::syntax(mpos, "netmask must be IPv4 dotted-quad")),
        }
    }

    fn proto_comparison(&mut self) -> Result<FilterExpr, FilterError> {
        let (pos, word) = self.expect_word("protocol")?;
        let value = if word.bytes().all(|b| b.is_ascii_digit()) {
            let n = parse_number(&word, pos, false)?;
            if n > 255 {
                return Err(FilterError::syntax(pos, "protocol number out of range"));
            }
            n
        } else {
            proto_number(&word)
                .ok_or_else(|| FilterError::syntax(pos, format!("unknown protocol '{word}'")))?
        };
        Ok(compare(Direction::Either, Field::Proto, CmpOp::Eq, Operand::Number(value)))
    }

    fn flags_comparison(&mut self) -> Result<FilterExpr, FilterError> {
        // An explicit operator or a purely numeric literal selects the exact
        // value comparison; a letter combination selects the subset test.
        if let Some(op) = self.parse_op() {
            let value = self.expect_number(false)?;
            return Ok(compare(Direction::Either, Field::Flags, op, Operand::Number(value)));
        }
        let (pos, word) = self.expect_word("flags")?;
        if word.bytes().all(|b| b.is_ascii_digit()) {
            let value = parse_number(&word, pos, false)?;
            return Ok(compare(Direction::Either, Field::Flags, CmpOp::Eq, Operand::Number(value)));
        }
        let mut bits: u8 = 0;
        for c in word.chars() {
            bits |= match c {
                'F' => FLAG_FIN,
                'S' => FLAG_SYN,
                'R' => FLAG_RST,
                'P' => FLAG_PSH,
                'A' => FLAG_ACK,
                'U' => FLAG_URG,
                'X' => FLAG_ALL,
                _ => {
                    return Err(FilterError::syntax(
                        pos,
                        format!("invalid flag letter '{c}'"),
                    ))
                }
            };
        }
        Ok(compare(Direction::Either, Field::Flags, CmpOp::Eq, Operand::FlagBits(bits)))
    }

    fn number_list(&mut self) -> Result<Vec<u64>, FilterError> {
        if !self.eat_tok(&Tok::LBracket) {
            return Err(self.err_here("expected '[' after 'in'"));
        }
        let mut values = Vec::new();
        while let Some(word) = self.peek_word() {
            let pos = self.cur_pos();
            let word = word.to_string();
            self.pos += 1;
            values.push(parse_number(&word, pos, false)?);
        }
        if !self.eat_tok(&Tok::RBracket) {
            return Err(self.err_here("expected ']'"));
        }
        if values.is_empty() {
            return Err(self.err_here("empty list"));
        }
        Ok(values)
    }

    fn addr_list(&mut self) -> Result<Vec<Addr>, FilterError> {
        if !self.eat_tok(&Tok::LBracket) {
            return Err(self.err_here("expected '[' after 'in'"));
        }
        let mut values = Vec::new();
        while let Some(word) = self.peek_word() {
            let pos = self.cur_pos();
            let word = word.to_string();
            self.pos += 1;
            values.push(parse_addr(&word, pos, false)?);
        }
        if !self.eat_tok(&Tok::RBracket) {
            return Err(self.err_here("expected ']'"));
        }
        if values.is_empty() {
            return Err(self.err_here("empty list"));
        }
        Ok(values)
    }
}

fn compare(dir: Direction, field: Field, op: CmpOp, operand: Operand) -> FilterExpr {
    FilterExpr::Compare(Comparison { dir, field, op, operand })
}

/// Parse a decimal literal with an optional `k`/`m`/`g` suffix (×1024^1/2/3).
fn parse_number(word: &str, pos: usize, allow_suffix: bool) -> Result<u64, FilterError> {
    let (digits, scale) = match word.chars().last() {
        Some('k') => (&word[..word.len() - 1], 1024u64),
        Some('m') => (&word[..word.len() - 1], 1024 * 1024),
        Some('g') => (&word[..word.len() - 1], 1024 * 1024 * 1024),
        _ => (word, 1),
    };
    if scale != 1 && !allow_suffix {
        return Err(FilterError::syntax(pos, "unit suffix not allowed for this field"));
    }
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FilterError::syntax(pos, format!("malformed number '{word}'")));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| FilterError::syntax(pos, format!("number '{word}' out of range")))?;
    value
        .checked_mul(scale)
        .ok_or_else(|| FilterError::syntax(pos, format!("number '{word}' out of range")))
}

/// Parse an address literal. IPv4 accepts a partial dotted-quad (missing
/// octets zero-filled) when `partial_ok`, which the `net` field uses for
/// forms like `172.32/16`.
fn parse_addr(word: &str, pos: usize, partial_ok: bool) -> Result<Addr, FilterError> {
    if word.contains(':') {
        let addr: std::net::Ipv6Addr = word
            .parse()
            .map_err(|_| FilterError::syntax(pos, format!("malformed IPv6 address '{word}'")))?;
        return Ok(Addr::V6(u128::from_be_bytes(addr.octets())));
    }
    let parts: Vec<&str> = word.split('.').collect();
    if parts.len() > 4 || (!partial_ok && parts.len() != 4) {
        return Err(FilterError::syntax(
            pos,
            format!("malformed IPv4 address '{word}'"),
        ));
    }
    let mut value: u32 = 0;
    for (i, part) in parts.iter().enumerate() {
        let octet: u8 = part
            .parse()
            .map_err(|_| FilterError::syntax(pos, format!("malformed IPv4 address '{word}'")))?;
        value |= u32::from(octet) << (8 * (3 - i as u32));
    }
    Ok(Addr::V4(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(expr: &FilterExpr) -> &Comparison {
        match expr {
            FilterExpr::Compare(c) => c,
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_implicit_equality() {
        let expr = FilterParser::parse("src port 63").unwrap();
        let c = leaf(&expr);
        assert_eq!(c.dir, Direction::Src);
        assert_eq!(c.field, Field::Port);
        assert_eq!(c.op, CmpOp::Eq);
        assert_eq!(c.operand, Operand::Number(63));
    }

    #[test]
    fn test_parse_operator_spellings() {
        for text in ["src port = 63", "src port == 63", "src port eq 63"] {
            assert_eq!(leaf(&FilterParser::parse(text).unwrap()).op, CmpOp::Eq);
        }
        for text in ["src port > 62", "src port gt 62"] {
            assert_eq!(leaf(&FilterParser::parse(text).unwrap()).op, CmpOp::Gt);
        }
        for text in ["src port < 64", "src port lt 64"] {
            assert_eq!(leaf(&FilterParser::parse(text).unwrap()).op, CmpOp::Lt);
        }
    }

    #[test]
    fn test_and_or_equal_precedence_left_assoc() {
        // No boolean-algebra precedence of and over or: strictly left to right.
        let expr = FilterParser::parse("port 80 or port 443 and proto tcp").unwrap();
        match expr {
            FilterExpr::And(left, _) => match *left {
                FilterExpr::Or(..) => {}
                other => panic!("expected or on the left, got {other:?}"),
            },
            other => panic!("expected top-level and, got {other:?}"),
        }
    }

    #[test]
    fn test_parens_override_associativity() {
        let expr = FilterParser::parse("port 80 or (port 443 and proto tcp)").unwrap();
        match expr {
            FilterExpr::Or(_, right) => match *right {
                FilterExpr::And(..) => {}
                other => panic!("expected and on the right, got {other:?}"),
            },
            other => panic!("expected top-level or, got {other:?}"),
        }
    }

    #[test]
    fn test_not_binds_to_term() {
        let expr = FilterParser::parse("not port 80 and proto tcp").unwrap();
        match expr {
            FilterExpr::And(left, _) => assert!(matches!(*left, FilterExpr::Not(_))),
            other => panic!("expected and, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_v4_address() {
        let expr = FilterParser::parse("src ip 172.32.7.16").unwrap();
        assert_eq!(leaf(&expr).operand, Operand::Addr(Addr::V4(0xac20_0710)));
    }

    #[test]
    fn test_parse_v6_address() {
        let expr = FilterParser::parse("dst ip fe80::2110:abcd:1234:5678").unwrap();
        assert_eq!(
            leaf(&expr).operand,
            Operand::Addr(Addr::V6(0xfe80_0000_0000_0000_2110_abcd_1234_5678))
        );
    }

    #[test]
    fn test_host_is_alias_for_ip() {
        let expr = FilterParser::parse("host 10.10.10.11").unwrap();
        assert_eq!(leaf(&expr).field, Field::Ip);
    }

    #[test]
    fn test_parse_net_prefix_and_partial_quad() {
        let expr = FilterParser::parse("src net 172.32/16").unwrap();
        assert_eq!(
            leaf(&expr).operand,
            Operand::Net { addr: Addr::V4(0xac20_0000), mask: NetMask::Prefix(16) }
        );
    }

    #[test]
    fn test_parse_net_explicit_mask() {
        let expr = FilterParser::parse("net 172.32.7.0 255.255.255.224").unwrap();
        assert_eq!(
            leaf(&expr).operand,
            Operand::Net { addr: Addr::V4(0xac20_0700), mask: NetMask::V4Mask(0xffff_ffe0) }
        );
    }

    #[test]
    fn test_v6_net_requires_prefix() {
        assert!(matches!(
            FilterParser::parse("net fe80:: 255.255.0.0"),
            Err(FilterError::Syntax { .. })
        ));
        let expr = FilterParser::parse("src net fe80::/16").unwrap();
        assert_eq!(
            leaf(&expr).operand,
            Operand::Net {
                addr: Addr::V6(0xfe80_0000_0000_0000_0000_0000_0000_0000),
                mask: NetMask::Prefix(16)
            }
        );
    }

    #[test]
    fn test_prefix_length_out_of_range() {
        assert!(FilterParser::parse("net 10.0.0.0/33").is_err());
        assert!(FilterParser::parse("net fe80::/129").is_err());
    }

    #[test]
    fn test_parse_port_list() {
        let expr = FilterParser::parse("port in [ 62 63 64 ]").unwrap();
        assert_eq!(leaf(&expr).operand, Operand::NumberList(vec![62, 63, 64]));
        assert_eq!(leaf(&expr).dir, Direction::Either);
    }

    #[test]
    fn test_parse_addr_list() {
        let expr = FilterParser::parse("src ip in [172.32.7.16 10.10.10.11]").unwrap();
        assert_eq!(
            leaf(&expr).operand,
            Operand::AddrList(vec![Addr::V4(0xac20_0710), Addr::V4(0x0a0a_0a0b)])
        );
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(FilterParser::parse("port in [ ]").is_err());
    }

    #[test]
    fn test_unit_suffix_scaling() {
        assert_eq!(
            leaf(&FilterParser::parse("bytes 2k").unwrap()).operand,
            Operand::Number(2048)
        );
        assert_eq!(
            leaf(&FilterParser::parse("bytes 2m").unwrap()).operand,
            Operand::Number(2048 * 1024)
        );
        assert_eq!(
            leaf(&FilterParser::parse("bytes 2g").unwrap()).operand,
            Operand::Number(2048 * 1024 * 1024)
        );
    }

    #[test]
    fn test_unit_suffix_rejected_on_non_scaling_field() {
        assert!(FilterParser::parse("port 2k").is_err());
        assert!(FilterParser::parse("tos 1k").is_err());
    }

    #[test]
    fn test_flags_letters_vs_numeric() {
        assert_eq!(
            leaf(&FilterParser::parse("flags SF").unwrap()).operand,
            Operand::FlagBits(3)
        );
        assert_eq!(
            leaf(&FilterParser::parse("flags X").unwrap()).operand,
            Operand::FlagBits(63)
        );
        assert_eq!(
            leaf(&FilterParser::parse("flags 3").unwrap()).operand,
            Operand::Number(3)
        );
        let c = FilterParser::parse("flags > 6").unwrap();
        assert_eq!(leaf(&c).op, CmpOp::Gt);
        assert_eq!(leaf(&c).operand, Operand::Number(6));
    }

    #[test]
    fn test_proto_names_and_numbers() {
        assert_eq!(
            leaf(&FilterParser::parse("proto tcp").unwrap()).operand,
            Operand::Number(6)
        );
        assert_eq!(
            leaf(&FilterParser::parse("proto rsvp").unwrap()).operand,
            Operand::Number(46)
        );
        assert_eq!(
            leaf(&FilterParser::parse("proto 47").unwrap()).operand,
            Operand::Number(47)
        );
        assert!(FilterParser::parse("proto nosuch").is_err());
    }

    #[test]
    fn test_interface_comparisons() {
        let expr = FilterParser::parse("in if 5").unwrap();
        assert_eq!(leaf(&expr).field, Field::InIf);
        let expr = FilterParser::parse("out if 6").unwrap();
        assert_eq!(leaf(&expr).field, Field::OutIf);
    }

    #[test]
    fn test_icmp_type_and_code() {
        assert_eq!(
            leaf(&FilterParser::parse("icmp-type 3").unwrap()).field,
            Field::IcmpType
        );
        assert_eq!(
            leaf(&FilterParser::parse("icmp-code 250").unwrap()).field,
            Field::IcmpCode
        );
    }

    #[test]
    fn test_ident_takes_bare_string() {
        let expr = FilterParser::parse("ident channel1").unwrap();
        assert_eq!(leaf(&expr).operand, Operand::Ident("channel1".into()));
    }

    #[test]
    fn test_family_and_any() {
        assert_eq!(leaf(&FilterParser::parse("ipv4").unwrap()).field, Field::Ipv4);
        assert_eq!(leaf(&FilterParser::parse("ipv6").unwrap()).field, Field::Ipv6);
        assert_eq!(leaf(&FilterParser::parse("any").unwrap()).field, Field::Any);
    }

    #[test]
    fn test_direction_rejected_where_meaningless() {
        assert!(FilterParser::parse("src proto tcp").is_err());
        assert!(FilterParser::parse("dst flags S").is_err());
    }

    #[test]
    fn test_syntax_error_reports_position() {
        match FilterParser::parse("frobnicate 1") {
            Err(FilterError::Syntax { pos, msg }) => {
                assert_eq!(pos, 0);
                assert!(msg.contains("unknown field"), "{msg}");
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
        match FilterParser::parse("port 80 port 443") {
            Err(FilterError::Syntax { pos, msg }) => {
                assert_eq!(pos, 8);
                assert!(msg.contains("trailing"), "{msg}");
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_unbalanced_paren_and_bracket() {
        assert!(FilterParser::parse("(port 80").is_err());
        assert!(FilterParser::parse("port in [ 80").is_err());
        assert!(FilterParser::parse("").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let expr = FilterParser::parse("src net 172.32.7.0/27 and not flags SF").unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        let back: FilterExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }
}
