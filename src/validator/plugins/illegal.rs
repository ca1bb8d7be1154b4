//! Rejects opcodes and prefix combinations the sandbox does not allow.

use bitflags::bitflags;

use crate::core::instruction::{DecodedInstruction, PrefixMask};
use crate::core::pattern::{InstType, PatternFlags};
use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::ValidatorState;

bitflags! {
    /// Reasons an instruction is disallowed, in reporting order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Disallows: u16 {
        const TOO_MANY_PREFIX_BYTES = 1 << 0;
        const MARKED_ILLEGAL = 1 << 1;
        const MARKED_INVALID = 1 << 2;
        const MARKED_SYSTEM = 1 << 3;
        const BAD_SEGMENT_PREFIX = 1 << 4;
        const CANT_USE_PREFIX_67 = 1 << 5;
        const MULTIPLE_REX_PREFIX = 1 << 6;
        const REP_DISALLOWED = 1 << 7;
        const REPNE_DISALLOWED = 1 << 8;
        const DATA16_DISALLOWED = 1 << 9;
        const DUPLICATE_PREFIX = 1 << 10;
        const AMBIG_SEGMENT_PREFIXES = 1 << 11;
        const REX_PREFIX_NOT_LAST = 1 << 12;
    }
}

const GENERIC_REASON: &str = "Illegal native client instruction";

const REASONS: &[(Disallows, &str)] = &[
    (
        Disallows::TOO_MANY_PREFIX_BYTES,
        "More than one (non-REX) prefix byte specified",
    ),
    (
        Disallows::MARKED_ILLEGAL,
        "This instruction has been marked illegal by Native Client",
    ),
    (
        Disallows::MARKED_INVALID,
        "Opcode sequence doesn't define a valid x86 instruction",
    ),
    (
        Disallows::MARKED_SYSTEM,
        "System instructions are not allowed by Native Client",
    ),
    (
        Disallows::BAD_SEGMENT_PREFIX,
        "Uses a segment prefix byte not allowed by Native Client",
    ),
    (
        Disallows::CANT_USE_PREFIX_67,
        "Use of 67 (ADDR16) prefix not allowed by Native Client",
    ),
    (
        Disallows::MULTIPLE_REX_PREFIX,
        "Multiple use of REX prefix not allowed",
    ),
    (
        Disallows::REP_DISALLOWED,
        "Use of REP (F3) prefix for instruction not allowed by Native Client",
    ),
    (
        Disallows::REPNE_DISALLOWED,
        "Use of REPNE (F2) prefix for instruction not allowed by Native Client",
    ),
    (
        Disallows::DATA16_DISALLOWED,
        "Use of DATA16 (66) prefix for instruction not allowed by Native Client",
    ),
    (
        Disallows::DUPLICATE_PREFIX,
        "Duplicating a prefix byte is not allowed by Native Client",
    ),
    (
        Disallows::AMBIG_SEGMENT_PREFIXES,
        "Specifying different segment registers using prefix bytes is not allowed by Native Client",
    ),
    (
        Disallows::REX_PREFIX_NOT_LAST,
        "REX prefix byte must appear last",
    ),
];

/// Message for a single reason flag.
pub fn reason(flag: Disallows) -> &'static str {
    REASONS
        .iter()
        .find(|(f, _)| *f == flag)
        .map_or(GENERIC_REASON, |(_, why)| *why)
}

/// Segment prefixes a jump may never carry.
const UNSAFE_JUMP_PREFIXES: PrefixMask = PrefixMask::SEG_ES
    .union(PrefixMask::SEG_FS)
    .union(PrefixMask::SEG_GS)
    .union(PrefixMask::SEG_SS);

/// Branch hints, only meaningful on conditional jumps.
const UNSAFE_UNCONDITIONAL_JUMP_PREFIXES: PrefixMask = PrefixMask::SEG_CS.union(PrefixMask::SEG_DS);

fn check_segment_prefixes(inst: &DecodedInstruction, why: &mut Disallows) {
    if !inst.has_prefix(PrefixMask::SEGMENTS) {
        return;
    }
    let pattern = inst.pattern;
    let ok = if pattern.flags.intersects(PatternFlags::JUMP | PatternFlags::COND_JUMP) {
        !inst.has_prefix(UNSAFE_JUMP_PREFIXES)
            && !(pattern.is_jump() && inst.has_prefix(UNSAFE_UNCONDITIONAL_JUMP_PREFIXES))
    } else {
        false
    };
    if !ok {
        *why |= Disallows::BAD_SEGMENT_PREFIX;
    }
    if inst.has_ambig_segment_prefixes {
        *why |= Disallows::AMBIG_SEGMENT_PREFIXES;
    }
}

fn check_prefixes(inst: &DecodedInstruction, why: &mut Disallows) {
    if !inst.is_valid() {
        *why |= Disallows::MARKED_INVALID;
    }
    // Padding nops are matched as whole byte sequences.
    if inst.multibyte_nop {
        return;
    }

    let mut num_prefix_bytes = inst.num_prefix_bytes;
    if inst.has_prefix(PrefixMask::REX) {
        num_prefix_bytes -= 1;
    }
    if num_prefix_bytes == 0 {
        return;
    }

    // 66 with F0 locks a 16-bit operand.
    let data16_lock = num_prefix_bytes == 2
        && inst.has_prefix(PrefixMask::DATA16)
        && inst.has_prefix(PrefixMask::LOCK);
    if num_prefix_bytes > 1 && !data16_lock {
        *why |= Disallows::TOO_MANY_PREFIX_BYTES;
    }

    let flags = inst.pattern.flags;
    if inst.has_prefix(PrefixMask::REP) && !flags.contains(PatternFlags::ALLOWS_REP) {
        *why |= Disallows::REP_DISALLOWED;
    }
    if inst.has_prefix(PrefixMask::REPNE) && !flags.contains(PatternFlags::ALLOWS_REPNE) {
        *why |= Disallows::REPNE_DISALLOWED;
    }
    if inst.has_prefix(PrefixMask::DATA16) && !flags.contains(PatternFlags::ALLOWS_DATA16) {
        *why |= Disallows::DATA16_DISALLOWED;
    }
    if inst.num_rex_prefixes > 1 {
        *why |= Disallows::MULTIPLE_REX_PREFIX;
    }
    if inst.has_prefix(PrefixMask::ADDR16) {
        *why |= Disallows::CANT_USE_PREFIX_67;
    }

    check_segment_prefixes(inst, why);

    // Multiple REX prefixes already explain the duplicate.
    if inst.has_prefix_duplicates && !why.contains(Disallows::MULTIPLE_REX_PREFIX) {
        *why |= Disallows::DUPLICATE_PREFIX;
    }
    if let Some(rex_index) = inst.rex_index {
        if rex_index + 1 != inst.num_prefix_bytes {
            *why |= Disallows::REX_PREFIX_NOT_LAST;
        }
    }
}

fn check_inst_type(inst: &DecodedInstruction, why: &mut Disallows) {
    match inst.pattern.inst_type {
        InstType::Return
        | InstType::Illegal
        | InstType::Undefined
        | InstType::System
        | InstType::Rdmsr
        | InstType::Rdtscp
        | InstType::Svm => *why |= Disallows::MARKED_ILLEGAL,
        InstType::Invalid => *why |= Disallows::MARKED_INVALID,
        InstType::Syscall | InstType::Sysenter => *why |= Disallows::MARKED_SYSTEM,
        _ => {}
    }
}

/// Everything wrong with `inst`, empty when it is allowed.
pub fn disallows(inst: &DecodedInstruction) -> Disallows {
    let mut why = Disallows::empty();
    check_prefixes(inst, &mut why);
    check_inst_type(inst, &mut why);
    why
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IllegalInstValidator;

impl InstructionValidator for IllegalInstValidator {
    fn name(&self) -> &'static str {
        "illegal"
    }

    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let why = disallows(inst);
        if why.is_empty() {
            return;
        }
        for flag in why.iter() {
            state.inst_message(LogLevel::Error, inst, reason(flag));
            if state.should_quit() {
                break;
            }
        }
    }
}
