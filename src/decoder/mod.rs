//! Instruction decoding.
//!
//! Decoding is delegated to iced-x86; this module turns an iced instruction
//! into a [`DecodedInstruction`] with the prefix, ModRM/SIB and operand tree
//! breakdown the validator plugins work on.

pub mod iter;
pub mod operands;
pub mod prefix;

use iced_x86::{Code, Decoder, DecoderOptions, InstructionInfoFactory, Mnemonic};

use crate::core::instruction::{ByteSpan, DecodedInstruction, PrefixMask, MAX_INST_LENGTH};
use crate::core::pattern::{self, Pattern};
use crate::core::ExprVector;

pub use iter::InstIter;
pub use prefix::{scan_prefixes, PrefixInfo};

/// Opcode tables for one instruction set.
pub trait DecodeTables: Sync {
    fn name(&self) -> &'static str;

    /// Decoder bitness.
    fn bitness(&self) -> u32;

    fn pattern(&self, code: Code) -> &'static Pattern;

    /// Pattern assigned to byte sequences that do not decode.
    fn undefined(&self) -> &'static Pattern;
}

/// 64-bit mode tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64Tables;

impl DecodeTables for X86_64Tables {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn bitness(&self) -> u32 {
        64
    }

    fn pattern(&self, code: Code) -> &'static Pattern {
        pattern::lookup(code)
    }

    fn undefined(&self) -> &'static Pattern {
        pattern::undefined_pattern()
    }
}

pub static X86_64: X86_64Tables = X86_64Tables;

/// Decodes single instructions out of a segment.
pub struct InstDecoder {
    tables: &'static dyn DecodeTables,
    info: InstructionInfoFactory,
}

impl InstDecoder {
    pub fn new(tables: &'static dyn DecodeTables) -> Self {
        Self {
            tables,
            info: InstructionInfoFactory::new(),
        }
    }

    pub fn tables(&self) -> &'static dyn DecodeTables {
        self.tables
    }

    /// Decode the instruction at `offset` of `segment`, which is mapped at
    /// `vbase`. Bytes past the end of the segment read as zero.
    pub fn decode(&mut self, segment: &[u8], offset: usize, vbase: u64) -> DecodedInstruction {
        let available = segment.len().saturating_sub(offset).min(MAX_INST_LENGTH);
        let mut bytes = [0u8; MAX_INST_LENGTH];
        if available > 0 {
            bytes[..available].copy_from_slice(&segment[offset..offset + available]);
        }
        let vpc = vbase.wrapping_add(offset as u64);

        let mut decoder = Decoder::with_ip(self.tables.bitness(), &bytes, vpc, DecoderOptions::NONE);
        let instr = decoder.decode();
        let offsets = decoder.get_constant_offsets(&instr);
        let length = instr.len().clamp(1, MAX_INST_LENGTH);
        if available < length {
            tracing::error!(
                vpc = %format_args!("{:x}", vpc),
                length,
                available,
                "instruction runs past the end of the segment"
            );
        }

        let pattern = if instr.is_invalid() {
            self.tables.undefined()
        } else {
            self.tables.pattern(instr.code())
        };

        let prefixes = scan_prefixes(&bytes[..length]);
        let multibyte_nop = pattern.mnemonic == Mnemonic::Nop
            && prefixes.only_uses(PrefixMask::DATA16 | PrefixMask::SEG_CS);

        let span = |present: bool, offset: usize, size: usize| {
            if present {
                ByteSpan {
                    offset: offset as u8,
                    len: size as u8,
                }
            } else {
                ByteSpan::default()
            }
        };
        let displacement = span(
            offsets.has_displacement(),
            offsets.displacement_offset(),
            offsets.displacement_size(),
        );
        let immediate = span(
            offsets.has_immediate(),
            offsets.immediate_offset(),
            offsets.immediate_size(),
        );
        let immediate2 = span(
            offsets.has_immediate2(),
            offsets.immediate_offset2(),
            offsets.immediate_size2(),
        );

        let num_opcode_bytes = if pattern.is_invalid() { 0 } else { pattern.opcode_len };
        let opcode_end = prefixes.num_prefix_bytes as usize + num_opcode_bytes as usize;
        let first_constant = [displacement, immediate, immediate2]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.offset as usize)
            .min()
            .unwrap_or(length);
        let modrm = (!pattern.is_invalid() && opcode_end < first_constant.min(length))
            .then(|| bytes[opcode_end]);
        let sib = modrm
            .filter(|m| m >> 6 != 3 && m & 7 == 4)
            .map(|_| bytes[(opcode_end + 1).min(MAX_INST_LENGTH - 1)]);

        let address_size = if prefixes.mask.contains(PrefixMask::ADDR16) { 4 } else { 8 };
        let operand_size = match pattern.operand_size {
            0 if prefixes.rex & 0x08 != 0 => 8,
            0 if prefixes.mask.contains(PrefixMask::DATA16) => 2,
            0 => 4,
            bits => bits / 8,
        };

        let (exprs, zero_extends) = if pattern.is_invalid() {
            (ExprVector::new(), false)
        } else {
            let info = self.info.info(&instr);
            let source = operands::OperandSource {
                instr: &instr,
                info,
                bytes: &bytes,
                displacement,
                immediate,
                immediate2,
                address_size,
            };
            (
                operands::build_exprs(&source),
                operands::first_operand_zero_extends(&instr, info),
            )
        };

        DecodedInstruction {
            vpc,
            length: length as u8,
            read_length: available.min(length) as u8,
            bytes,
            num_prefix_bytes: prefixes.num_prefix_bytes,
            prefix_mask: prefixes.mask,
            num_rex_prefixes: prefixes.num_rex_prefixes,
            rex: prefixes.rex,
            rex_index: prefixes.rex_index,
            has_prefix_duplicates: prefixes.has_duplicates,
            has_ambig_segment_prefixes: prefixes.has_ambig_segments,
            multibyte_nop,
            num_opcode_bytes,
            modrm,
            sib,
            displacement,
            immediate,
            immediate2,
            operand_size,
            address_size,
            zero_extends,
            pattern,
            exprs,
            iced: instr,
        }
    }
}

/// Decode one instruction from the start of `bytes`, mapped at `vpc`.
pub fn decode_one(bytes: &[u8], vpc: u64) -> DecodedInstruction {
    InstDecoder::new(&X86_64).decode(bytes, 0, vpc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::{ExprFlags, ExprKind};
    use crate::core::pattern::InstType;
    use iced_x86::Register;
    use std::sync::{Arc, Mutex};

    /// Log output of `f`, formatted without colors.
    fn captured_log<T>(f: impl FnOnce() -> T) -> (T, String) {
        #[derive(Clone, Default)]
        struct Buffer(Arc<Mutex<Vec<u8>>>);

        impl std::io::Write for Buffer {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("log buffer").extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8(buffer.0.lock().expect("log buffer").clone()).expect("utf8");
        (value, text)
    }

    #[test]
    fn truncated_instruction_is_logged() {
        // mov eax, imm32 with only two bytes left
        let (inst, log) = captured_log(|| decode_one(&[0xb8, 0x01], 0x40));
        assert_eq!(inst.mnemonic(), Mnemonic::Mov);
        assert_eq!(inst.length, 5);
        assert_eq!(inst.read_length, 2);
        assert!(log.contains("ERROR"), "{}", log);
        assert!(log.contains("instruction runs past the end of the segment"), "{}", log);
        assert!(log.contains("vpc=40"), "{}", log);

        let (_, log) = captured_log(|| decode_one(&[0xb8, 0x01, 0x00, 0x00, 0x00], 0x40));
        assert!(log.is_empty(), "{}", log);
    }

    #[test]
    fn decode_add_rsp_r15() {
        let inst = decode_one(&[0x4c, 0x01, 0xfc], 0x1000);
        assert_eq!(inst.vpc, 0x1000);
        assert_eq!(inst.length, 3);
        assert_eq!(inst.mnemonic(), Mnemonic::Add);
        assert_eq!(inst.num_prefix_bytes, 1);
        assert_eq!(inst.rex, 0x4c);
        assert_eq!(inst.num_opcode_bytes, 1);
        assert_eq!(inst.modrm, Some(0xfc));
        assert_eq!(inst.sib, None);
        assert_eq!(inst.operand_size, 8);
        assert_eq!(inst.address_size, 8);

        let exprs = &inst.exprs;
        assert_eq!(exprs.operand_count(), 2);
        assert!(exprs[1].is_register(Register::RSP));
        assert!(exprs[1].has(ExprFlags::SET | ExprFlags::USED | ExprFlags::SIZE64));
        assert!(exprs[3].is_register(Register::R15));
        assert!(exprs[3].has(ExprFlags::USED));
        assert!(!exprs[3].has(ExprFlags::SET));
    }

    #[test]
    fn decode_and_keeps_raw_immediate() {
        // and eax, 0xffffffe0
        let inst = decode_one(&[0x83, 0xe0, 0xe0], 0);
        assert_eq!(inst.mnemonic(), Mnemonic::And);
        assert_eq!(inst.opcode_byte(), 0x83);
        assert!(inst.zero_extends);
        assert_eq!(inst.exprs.register(1), Register::EAX);
        assert_eq!(inst.exprs[3].kind, ExprKind::Constant);
        assert_eq!(inst.exprs.constant(3), Some(0xe0));
    }

    #[test]
    fn decode_memory_operand() {
        // mov [r15+rax*1+0x10], ecx
        let inst = decode_one(&[0x41, 0x89, 0x4c, 0x07, 0x10], 0);
        assert_eq!(inst.sib, Some(0x07));
        let exprs = &inst.exprs;
        let root = inst.operand_root(1).expect("operand");
        assert_eq!(exprs[root].kind, ExprKind::MemOffset);
        assert!(exprs[root].has(ExprFlags::SET | ExprFlags::SIZE64));
        assert_eq!(exprs.register(root + 1), Register::R15);
        assert_eq!(exprs.register(root + 2), Register::RAX);
        assert_eq!(exprs.constant(root + 3), Some(1));
        assert_eq!(exprs.constant(root + 4), Some(0x10));
    }

    #[test]
    fn decode_direct_jump_target() {
        let inst = decode_one(&[0xe9, 0x0b, 0x00, 0x00, 0x00], 0x20);
        assert!(inst.pattern.is_jump());
        let exprs = &inst.exprs;
        assert!(exprs[0].has(ExprFlags::IMPLICIT));
        assert!(exprs[1].is_register(Register::RIP));
        assert!(exprs[1].has(ExprFlags::SET));
        assert!(exprs[3].has(ExprFlags::JUMP_TARGET));
        assert_eq!(exprs.constant(3), Some(0x30));
    }

    #[test]
    fn decode_call_layout() {
        let inst = decode_one(&[0xe8, 0x00, 0x00, 0x00, 0x00], 0);
        let exprs = &inst.exprs;
        assert!(exprs[1].is_register(Register::RIP));
        assert!(exprs[3].is_register(Register::RSP));
        assert!(exprs[5].has(ExprFlags::JUMP_TARGET));
    }

    #[test]
    fn decode_string_operand() {
        // stos dword ptr [rdi], eax
        let inst = decode_one(&[0xab], 0);
        let root = inst.operand_root(1).expect("operand");
        assert_eq!(inst.exprs[root].kind, ExprKind::SegmentAddress);
        assert!(inst.exprs[root].has(ExprFlags::SIZE64));
        assert_eq!(inst.exprs.register(root + 1), Register::ES);
        assert_eq!(inst.exprs.register(root + 2), Register::RDI);
    }

    #[test]
    fn decode_invalid_bytes() {
        let inst = decode_one(&[0x06], 0);
        assert!(!inst.is_valid());
        assert_eq!(inst.pattern.inst_type, InstType::Invalid);
        assert_eq!(inst.length, 1);
        assert!(inst.exprs.is_empty());
    }

    #[test]
    fn decode_past_segment_end() {
        let inst = decode_one(&[0xe8, 0x00], 0);
        assert_eq!(inst.length, 5);
        assert_eq!(inst.read_length, 2);
    }

    #[test]
    fn padding_nop_is_recognized() {
        let inst = decode_one(&[0x66, 0x2e, 0x0f, 0x1f, 0x84, 0, 0, 0, 0, 0], 0);
        assert_eq!(inst.mnemonic(), Mnemonic::Nop);
        assert!(inst.multibyte_nop);
        assert!(!decode_one(&[0x90], 0).prefix_mask.contains(PrefixMask::DATA16));
    }
}
