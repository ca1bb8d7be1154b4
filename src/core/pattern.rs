//! Static opcode pattern table.
//!
//! Every iced-x86 `Code` gets one [`Pattern`] carrying the policy-relevant
//! facts about that opcode form: its instruction class (which decides the
//! CPU feature it needs or whether it is banned outright), the prefixes it
//! may legally carry and whether it transfers control.

use std::fmt;

use bitflags::bitflags;
use iced_x86::{
    Code, CpuidFeature, EncodingKind, FlowControl, MandatoryPrefix, Mnemonic, OpCodeTableKind,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Instruction class used by the CPU and illegal-instruction checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstType {
    /// Baseline integer instruction.
    Ordinary,
    /// Byte sequence that is not an instruction.
    Invalid,
    /// Opcode that always faults.
    Undefined,
    /// Not allowed inside the sandbox.
    Illegal,
    Return,
    System,
    Syscall,
    Sysenter,
    Rdmsr,
    Rdtscp,
    Svm,
    X87,
    /// x87 conditional move, needs both x87 and CMOV.
    Fcmov,
    Cmov,
    Mmx,
    /// SSE2 instruction on MMX registers.
    MmxSse2,
    Sse,
    Sse2,
    Sse3,
    Ssse3,
    Sse41,
    Sse42,
    Sse4a,
    Movbe,
    Popcnt,
    Lzcnt,
    Cmpxchg8b,
    Cmpxchg16b,
    Rdtsc,
    Clflush,
    Fxsr,
    ThreeDNow,
    E3DNow,
}

bitflags! {
    /// Per-pattern properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PatternFlags: u16 {
        /// Unconditional direct or indirect jump, or call.
        const JUMP = 1 << 0;
        const COND_JUMP = 1 << 1;
        /// F3 prefix is meaningful.
        const ALLOWS_REP = 1 << 2;
        /// F2 prefix is meaningful.
        const ALLOWS_REPNE = 1 << 3;
        /// 66 prefix is meaningful.
        const ALLOWS_DATA16 = 1 << 4;
        /// Only encodable in 64-bit mode.
        const LONG_MODE = 1 << 5;
    }
}

/// Opcode form description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    pub code: Code,
    pub mnemonic: Mnemonic,
    pub inst_type: InstType,
    pub flags: PatternFlags,
    /// Opcode bytes following the prefixes, not counting ModRM.
    pub opcode_len: u8,
    /// Operand size fixed by the opcode form, in bits, 0 if prefix-dependent.
    pub operand_size: u8,
}

impl Pattern {
    pub fn is_jump(&self) -> bool {
        self.flags.contains(PatternFlags::JUMP)
    }

    pub fn is_cond_jump(&self) -> bool {
        self.flags.contains(PatternFlags::COND_JUMP)
    }

    pub fn is_invalid(&self) -> bool {
        self.inst_type == InstType::Invalid
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?}, {:?})", self.code, self.inst_type, self.flags)
    }
}

/// One pattern per `Code`, indexed by `code as usize`.
pub static X86_64_PATTERNS: Lazy<Vec<Pattern>> =
    Lazy::new(|| Code::values().map(build_pattern).collect());

/// Pattern for `code`.
pub fn lookup(code: Code) -> &'static Pattern {
    &X86_64_PATTERNS[code as usize]
}

/// Pattern of the byte sequences that do not decode.
pub fn undefined_pattern() -> &'static Pattern {
    lookup(Code::INVALID)
}

fn build_pattern(code: Code) -> Pattern {
    let op = code.op_code();

    let mut flags = PatternFlags::empty();
    match code.flow_control() {
        FlowControl::UnconditionalBranch
        | FlowControl::IndirectBranch
        | FlowControl::Call
        | FlowControl::IndirectCall => flags |= PatternFlags::JUMP,
        FlowControl::ConditionalBranch => flags |= PatternFlags::COND_JUMP,
        _ => {}
    }
    let mandatory = op.mandatory_prefix();
    if op.can_use_rep_prefix() || mandatory == MandatoryPrefix::PF3 {
        flags |= PatternFlags::ALLOWS_REP;
    }
    if op.can_use_repne_prefix() || mandatory == MandatoryPrefix::PF2 {
        flags |= PatternFlags::ALLOWS_REPNE;
    }
    if mandatory == MandatoryPrefix::P66 || op.operand_size() == 16 {
        flags |= PatternFlags::ALLOWS_DATA16;
    }
    if code.cpuid_features().contains(&CpuidFeature::X64) {
        flags |= PatternFlags::LONG_MODE;
    }

    let opcode_len = match op.table() {
        OpCodeTableKind::Normal => 1,
        OpCodeTableKind::T0F => 2,
        OpCodeTableKind::T0F38 | OpCodeTableKind::T0F3A => 3,
        _ => 1,
    };

    Pattern {
        code,
        mnemonic: code.mnemonic(),
        inst_type: classify(code),
        flags,
        opcode_len,
        operand_size: op.operand_size() as u8,
    }
}

fn classify(code: Code) -> InstType {
    if code == Code::INVALID {
        return InstType::Invalid;
    }
    let op = code.op_code();
    if !op.is_instruction() || !op.mode64() {
        return InstType::Invalid;
    }
    match op.encoding() {
        EncodingKind::Legacy => {}
        EncodingKind::D3NOW => return InstType::ThreeDNow,
        _ => return InstType::Illegal,
    }
    if code.is_jmp_far()
        || code.is_call_far()
        || code.is_jmp_far_indirect()
        || code.is_call_far_indirect()
    {
        return InstType::Illegal;
    }

    let mnemonic = code.mnemonic();
    match mnemonic {
        Mnemonic::Hlt => return InstType::Ordinary,
        Mnemonic::Syscall => return InstType::Syscall,
        Mnemonic::Sysenter => return InstType::Sysenter,
        Mnemonic::Rdmsr | Mnemonic::Wrmsr => return InstType::Rdmsr,
        Mnemonic::Rdtscp => return InstType::Rdtscp,
        Mnemonic::Lar
        | Mnemonic::Lsl
        | Mnemonic::Sgdt
        | Mnemonic::Sidt
        | Mnemonic::Sldt
        | Mnemonic::Str
        | Mnemonic::Smsw
        | Mnemonic::Verr
        | Mnemonic::Verw => return InstType::System,
        _ => {}
    }

    match code.flow_control() {
        FlowControl::Return => return InstType::Return,
        FlowControl::Interrupt | FlowControl::XbeginXabortXend => return InstType::Illegal,
        FlowControl::Exception => return InstType::Undefined,
        _ => {}
    }
    if code.is_privileged() {
        return InstType::System;
    }

    feature_class(code)
}

/// Class implied by the CPUID features an opcode form needs.
fn feature_class(code: Code) -> InstType {
    let features = code.cpuid_features();
    let mut x87 = false;
    let mut class = InstType::Ordinary;
    for feature in features {
        let next = match *feature {
            CpuidFeature::INTEL8086
            | CpuidFeature::INTEL186
            | CpuidFeature::INTEL286
            | CpuidFeature::INTEL386
            | CpuidFeature::INTEL486
            | CpuidFeature::X64
            | CpuidFeature::CPUID
            | CpuidFeature::PAUSE
            | CpuidFeature::MULTIBYTENOP => continue,
            CpuidFeature::FPU | CpuidFeature::FPU287 | CpuidFeature::FPU387 => {
                x87 = true;
                continue;
            }
            CpuidFeature::CMOV => InstType::Cmov,
            CpuidFeature::MMX => InstType::Mmx,
            CpuidFeature::SSE => InstType::Sse,
            CpuidFeature::SSE2 if uses_mmx_registers(code) => InstType::MmxSse2,
            CpuidFeature::SSE2 => InstType::Sse2,
            CpuidFeature::SSE3 => InstType::Sse3,
            CpuidFeature::SSSE3 => InstType::Ssse3,
            CpuidFeature::SSE4_1 => InstType::Sse41,
            CpuidFeature::SSE4_2 => InstType::Sse42,
            CpuidFeature::SSE4A => InstType::Sse4a,
            CpuidFeature::MOVBE => InstType::Movbe,
            CpuidFeature::POPCNT => InstType::Popcnt,
            CpuidFeature::LZCNT => InstType::Lzcnt,
            CpuidFeature::CX8 => InstType::Cmpxchg8b,
            CpuidFeature::CMPXCHG16B => InstType::Cmpxchg16b,
            CpuidFeature::TSC => InstType::Rdtsc,
            CpuidFeature::CLFSH => InstType::Clflush,
            CpuidFeature::FXSR => InstType::Fxsr,
            CpuidFeature::D3NOW => InstType::ThreeDNow,
            CpuidFeature::D3NOWEXT => InstType::E3DNow,
            CpuidFeature::SVM => InstType::Svm,
            _ => return InstType::Illegal,
        };
        // The first feature that is not baseline decides the class.
        if class == InstType::Ordinary {
            class = next;
        }
    }
    match (x87, class) {
        (true, InstType::Cmov) => InstType::Fcmov,
        (true, InstType::Ordinary) => InstType::X87,
        (_, class) => class,
    }
}

/// iced names MMX register operands `mm`, `mmm32` or `mmm64`.
fn uses_mmx_registers(code: Code) -> bool {
    format!("{:?}", code)
        .split('_')
        .skip(1)
        .any(|part| matches!(part, "mm" | "mmm32" | "mmm64"))
}
