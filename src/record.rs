//! Flow record layout: the binary contract between the engine and its
//! record-storage collaborator.
//!
//! A [`FlowRecord`] is a fixed sequence of 64-bit words. Logical fields live
//! at known word offsets and bit ranges described by the [`FieldDescriptor`]
//! table, which is the single point of truth for the layout: the code
//! generator resolves field names through it and the typed accessors below go
//! through it as well. [`verify_layout`] checks the table against the
//! documented anchor positions once at startup; a drift here would silently
//! corrupt every filter result, so callers must abort on failure.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Number of 64-bit words in one flow record.
pub const RECORD_WORDS: usize = 11;

/// Bit set in [`RecordField::RecordFlags`] when the record carries an IPv6
/// address pair. IPv4 and IPv6 addresses occupy overlapping words and are
/// distinguished only by this flag.
pub const FLAG_IPV6: u64 = 0x1;

/// Logical fields of a flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordField {
    First,
    Last,
    MsecFirst,
    MsecLast,
    RecordFlags,
    Dir,
    InputIf,
    OutputIf,
    Proto,
    TcpFlags,
    Tos,
    SrcPort,
    DstPort,
    SrcAs,
    DstAs,
    /// High 64 bits of the IPv6 source address.
    SrcAddrHi,
    /// Low 64 bits of the IPv6 source address.
    SrcAddrLo,
    /// IPv4 source address; overlays the low 32 bits of [`RecordField::SrcAddrLo`].
    SrcAddrV4,
    DstAddrHi,
    DstAddrLo,
    DstAddrV4,
    Packets,
    Bytes,
}

/// Position of one logical field inside the word buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub field: RecordField,
    /// Word index into the record.
    pub word: usize,
    /// Right-shift applied to the word before masking.
    pub shift: u32,
    /// Field width in bits.
    pub bits: u32,
}

impl FieldDescriptor {
    /// Extraction mask for the field width, applied after shifting.
    pub fn mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }
}

/// The layout table. Order matches [`RecordField`] declaration order so
/// `descriptor()` can be a direct dispatch.
pub const FIELD_TABLE: &[FieldDescriptor] = &[
    FieldDescriptor { field: RecordField::First, word: 0, shift: 0, bits: 32 },
    FieldDescriptor { field: RecordField::Last, word: 0, shift: 32, bits: 32 },
    FieldDescriptor { field: RecordField::MsecFirst, word: 1, shift: 0, bits: 16 },
    FieldDescriptor { field: RecordField::MsecLast, word: 1, shift: 16, bits: 16 },
    FieldDescriptor { field: RecordField::RecordFlags, word: 1, shift: 32, bits: 8 },
    FieldDescriptor { field: RecordField::Dir, word: 1, shift: 40, bits: 8 },
    FieldDescriptor { field: RecordField::InputIf, word: 2, shift: 0, bits: 32 },
    FieldDescriptor { field: RecordField::OutputIf, word: 2, shift: 32, bits: 32 },
    FieldDescriptor { field: RecordField::Proto, word: 3, shift: 0, bits: 8 },
    FieldDescriptor { field: RecordField::TcpFlags, word: 3, shift: 8, bits: 8 },
    FieldDescriptor { field: RecordField::Tos, word: 3, shift: 16, bits: 8 },
    FieldDescriptor { field: RecordField::SrcPort, word: 4, shift: 0, bits: 16 },
    FieldDescriptor { field: RecordField::DstPort, word: 4, shift: 16, bits: 16 },
    FieldDescriptor { field: RecordField::SrcAs, word: 4, shift: 32, bits: 16 },
    FieldDescriptor { field: RecordField::DstAs, word: 4, shift: 48, bits: 16 },
    FieldDescriptor { field: RecordField::SrcAddrHi, word: 5, shift: 0, bits: 64 },
    FieldDescriptor { field: RecordField::SrcAddrLo, word: 6, shift: 0, bits: 64 },
    FieldDescriptor { field: RecordField::SrcAddrV4, word: 6, shift: 0, bits: 32 },
    FieldDescriptor { field: RecordField::DstAddrHi, word: 7, shift: 0, bits: 64 },
    FieldDescriptor { field: RecordField::DstAddrLo, word: 8, shift: 0, bits: 64 },
    FieldDescriptor { field: RecordField::DstAddrV4, word: 8, shift: 0, bits: 32 },
    FieldDescriptor { field: RecordField::Packets, word: 9, shift: 0, bits: 64 },
    FieldDescriptor { field: RecordField::Bytes, word: 10, shift: 0, bits: 64 },
];

/// Look up the descriptor for a field.
pub fn descriptor(field: RecordField) -> &'static FieldDescriptor {
    // FIELD_TABLE order matches the enum; verified by verify_layout and the
    // tests below.
    &FIELD_TABLE[field as usize]
}

/// Validate the descriptor table against the documented layout.
///
/// Checked once at startup by [`crate::compile`]; a mismatch is a deployment
/// error, not a per-record condition, and must stop the process.
pub fn verify_layout() -> Result<(), FilterError> {
    for (i, d) in FIELD_TABLE.iter().enumerate() {
        if d.field as usize != i {
            return Err(FilterError::Layout(format!(
                "descriptor table out of order at index {i}"
            )));
        }
        if d.word >= RECORD_WORDS {
            return Err(FilterError::Layout(format!(
                "{:?} word {} out of range",
                d.field, d.word
            )));
        }
        if d.bits == 0 || d.shift + d.bits > 64 {
            return Err(FilterError::Layout(format!(
                "{:?} bit range {}..{} invalid",
                d.field,
                d.shift,
                d.shift + d.bits
            )));
        }
    }

    // Anchor positions the code generator depends on.
    let anchors = [
        (RecordField::First, 0usize, 0u32, 32u32),
        (RecordField::Last, 0, 32, 32),
        (RecordField::RecordFlags, 1, 32, 8),
        (RecordField::Dir, 1, 40, 8),
        (RecordField::Proto, 3, 0, 8),
        (RecordField::TcpFlags, 3, 8, 8),
        (RecordField::Tos, 3, 16, 8),
        (RecordField::SrcPort, 4, 0, 16),
        (RecordField::DstPort, 4, 16, 16),
        (RecordField::SrcAs, 4, 32, 16),
        (RecordField::DstAs, 4, 48, 16),
    ];
    for (field, word, shift, bits) in anchors {
        let d = descriptor(field);
        if (d.word, d.shift, d.bits) != (word, shift, bits) {
            return Err(FilterError::Layout(format!(
                "{:?} expected at word {} bits {}..{}, found word {} bits {}..{}",
                field,
                word,
                shift,
                shift + bits,
                d.word,
                d.shift,
                d.shift + d.bits
            )));
        }
    }

    // The v4 address must overlay the low word of the v6 address, low-aligned.
    for (v4, lo) in [
        (RecordField::SrcAddrV4, RecordField::SrcAddrLo),
        (RecordField::DstAddrV4, RecordField::DstAddrLo),
    ] {
        let (d4, dlo) = (descriptor(v4), descriptor(lo));
        if d4.word != dlo.word || d4.shift != 0 || d4.bits != 32 {
            return Err(FilterError::Layout(format!(
                "{v4:?} must occupy the low 32 bits of {lo:?}"
            )));
        }
        let hi = descriptor(match v4 {
            RecordField::SrcAddrV4 => RecordField::SrcAddrHi,
            _ => RecordField::DstAddrHi,
        });
        if hi.word + 1 != dlo.word {
            return Err(FilterError::Layout(format!(
                "{lo:?} must directly follow its high word"
            )));
        }
    }
    Ok(())
}

/// One flow record: a read-only, fixed-width word buffer from the evaluator's
/// point of view. Produced externally, evaluated zero or more times, never
/// mutated by the engine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    words: [u64; RECORD_WORDS],
}

impl FlowRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw word access; the evaluator only ever reads through descriptor
    /// offsets, which `verify_layout` has bounds-checked.
    #[inline]
    pub fn word(&self, idx: usize) -> u64 {
        self.words[idx]
    }

    /// Read a logical field.
    #[inline]
    pub fn get(&self, field: RecordField) -> u64 {
        let d = descriptor(field);
        (self.words[d.word] >> d.shift) & d.mask()
    }

    /// Write a logical field, truncating to the field width.
    pub fn set(&mut self, field: RecordField, value: u64) -> &mut Self {
        let d = descriptor(field);
        let mask = d.mask();
        self.words[d.word] =
            (self.words[d.word] & !(mask << d.shift)) | ((value & mask) << d.shift);
        self
    }

    /// Store a source address and update the family flag to match.
    pub fn set_src_addr(&mut self, addr: IpAddr) -> &mut Self {
        self.set_addr(addr, RecordField::SrcAddrHi, RecordField::SrcAddrLo)
    }

    /// Store a destination address and update the family flag to match.
    pub fn set_dst_addr(&mut self, addr: IpAddr) -> &mut Self {
        self.set_addr(addr, RecordField::DstAddrHi, RecordField::DstAddrLo)
    }

    fn set_addr(&mut self, addr: IpAddr, hi: RecordField, lo: RecordField) -> &mut Self {
        match addr {
            IpAddr::V4(a) => {
                self.set(hi, 0);
                self.set(lo, u64::from(u32::from(a)));
                let flags = self.get(RecordField::RecordFlags) & !FLAG_IPV6;
                self.set(RecordField::RecordFlags, flags);
            }
            IpAddr::V6(a) => {
                let v = u128::from_be_bytes(a.octets());
                self.set(hi, (v >> 64) as u64);
                self.set(lo, v as u64);
                let flags = self.get(RecordField::RecordFlags) | FLAG_IPV6;
                self.set(RecordField::RecordFlags, flags);
            }
        }
        self
    }

    /// True when the record carries an IPv6 address pair.
    pub fn is_ipv6(&self) -> bool {
        self.get(RecordField::RecordFlags) & FLAG_IPV6 != 0
    }
}
