//! Decoded instruction record.

use std::fmt;

use bitflags::bitflags;
use iced_x86::{Formatter, IntelFormatter, Mnemonic};
use serde::{Deserialize, Serialize};

use super::expr::{ExprKind, ExprVector};
use super::pattern::Pattern;

/// Longest legal x86 instruction.
pub const MAX_INST_LENGTH: usize = 15;

/// The halt opcode, used for padding and to stub out instructions.
pub const HALT_OPCODE: u8 = 0xf4;

bitflags! {
    /// Legacy and REX prefixes seen before the opcode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PrefixMask: u16 {
        const SEG_CS = 1 << 0;
        const SEG_SS = 1 << 1;
        const SEG_DS = 1 << 2;
        const SEG_ES = 1 << 3;
        const SEG_FS = 1 << 4;
        const SEG_GS = 1 << 5;
        const DATA16 = 1 << 6;
        const ADDR16 = 1 << 7;
        const LOCK = 1 << 8;
        const REPNE = 1 << 9;
        const REP = 1 << 10;
        const REX = 1 << 11;

        const SEGMENTS = Self::SEG_CS.bits()
            | Self::SEG_SS.bits()
            | Self::SEG_DS.bits()
            | Self::SEG_ES.bits()
            | Self::SEG_FS.bits()
            | Self::SEG_GS.bits();
    }
}

/// Location of an encoded constant inside the instruction bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteSpan {
    pub offset: u8,
    pub len: u8,
}

impl ByteSpan {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Little-endian value of the span, zero-extended.
    pub fn read(&self, bytes: &[u8]) -> u64 {
        let start = self.offset as usize;
        let end = (start + self.len as usize).min(bytes.len());
        bytes
            .get(start..end)
            .unwrap_or(&[])
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }
}

/// One decoded instruction with its prefix breakdown and operand tree.
#[derive(Clone)]
pub struct DecodedInstruction {
    /// Virtual address of the first byte.
    pub vpc: u64,
    /// Encoded length, at least 1.
    pub length: u8,
    /// Bytes of the instruction that lie inside the segment.
    pub read_length: u8,
    /// Instruction bytes, zero-filled past the end of the segment.
    pub bytes: [u8; MAX_INST_LENGTH],
    /// Prefix bytes including REX.
    pub num_prefix_bytes: u8,
    pub prefix_mask: PrefixMask,
    pub num_rex_prefixes: u8,
    /// Last REX byte seen, 0 if none.
    pub rex: u8,
    /// Position of the last REX byte within the prefixes.
    pub rex_index: Option<u8>,
    pub has_prefix_duplicates: bool,
    pub has_ambig_segment_prefixes: bool,
    /// Padding nop whose 66/2E prefixes belong to the recognized sequence.
    pub multibyte_nop: bool,
    pub num_opcode_bytes: u8,
    pub modrm: Option<u8>,
    pub sib: Option<u8>,
    pub displacement: ByteSpan,
    pub immediate: ByteSpan,
    pub immediate2: ByteSpan,
    /// Effective operand size in bytes.
    pub operand_size: u8,
    /// Effective address size in bytes.
    pub address_size: u8,
    /// First operand is a 32-bit register write that clears the upper half.
    pub zero_extends: bool,
    pub pattern: &'static Pattern,
    pub exprs: ExprVector,
    pub(crate) iced: iced_x86::Instruction,
}

impl DecodedInstruction {
    pub fn mnemonic(&self) -> Mnemonic {
        self.pattern.mnemonic
    }

    /// Encoded bytes, `length` of them.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// First opcode byte.
    pub fn opcode_byte(&self) -> u8 {
        self.byte(self.num_prefix_bytes as usize)
    }

    pub fn has_prefix(&self, prefix: PrefixMask) -> bool {
        self.prefix_mask.intersects(prefix)
    }

    pub fn has_sib(&self) -> bool {
        self.sib.is_some()
    }

    pub fn is_valid(&self) -> bool {
        !self.pattern.is_invalid()
    }

    /// Address just past the instruction.
    pub fn next_pc(&self) -> u64 {
        self.vpc.wrapping_add(self.length as u64)
    }

    /// Expression index of the root of operand `n` (1-based), if present.
    pub fn operand_root(&self, n: usize) -> Option<usize> {
        let index = self.exprs.nth_kind(ExprKind::OperandReference, n);
        (index < self.exprs.len()).then_some(index + 1)
    }

    /// Intel syntax text of the instruction.
    pub fn text(&self) -> String {
        if !self.is_valid() {
            return "(bad)".to_string();
        }
        let mut out = String::new();
        IntelFormatter::new().format(&self.iced, &mut out);
        out
    }
}

impl fmt::Debug for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedInstruction")
            .field("vpc", &format_args!("{:#x}", self.vpc))
            .field("bytes", &format_args!("{:02x?}", self.bytes()))
            .field("pattern", &self.pattern.code)
            .field("prefix_mask", &self.prefix_mask)
            .field("exprs", &self.exprs)
            .finish()
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}: ", self.vpc)?;
        for b in self.bytes() {
            write!(f, "{:02x} ", b)?;
        }
        write!(f, "{}", self.text())
    }
}
