//! Operand expression tree construction from an iced-x86 instruction.
//!
//! Constants hold the bytes as encoded, zero-extended, so sign-extended
//! immediates and displacements keep their raw value (`83 e0 e0` yields the
//! constant `0xe0`). Branch targets are the absolute target address.

use iced_x86::{FlowControl, Instruction, InstructionInfo, Mnemonic, OpAccess, OpKind, Register};

use crate::core::expr::{ExprFlags, ExprKind, ExprOverflow, ExprVector};
use crate::core::instruction::ByteSpan;

/// Encoding details the tree builder needs beyond the iced instruction.
pub(crate) struct OperandSource<'a> {
    pub instr: &'a Instruction,
    pub info: &'a InstructionInfo,
    pub bytes: &'a [u8],
    pub displacement: ByteSpan,
    pub immediate: ByteSpan,
    pub immediate2: ByteSpan,
    pub address_size: u8,
}

/// Set/use flags for an operand access.
pub fn access_flags(access: OpAccess) -> ExprFlags {
    match access {
        OpAccess::Read | OpAccess::CondRead => ExprFlags::USED,
        OpAccess::Write | OpAccess::CondWrite => ExprFlags::SET,
        OpAccess::ReadWrite | OpAccess::ReadCondWrite => ExprFlags::SET | ExprFlags::USED,
        OpAccess::NoMemAccess => ExprFlags::ADDRESS,
        _ => ExprFlags::empty(),
    }
}

/// Build the expression vector. A tree that does not fit collapses into a
/// single undefined operand, which the memory check rejects.
pub(crate) fn build_exprs(src: &OperandSource<'_>) -> ExprVector {
    let mut exprs = ExprVector::new();
    if push_operands(src, &mut exprs).is_ok() {
        return exprs;
    }
    tracing::warn!(
        addr = %format_args!("{:x}", src.instr.ip()),
        "operand tree overflow"
    );
    let mut exprs = ExprVector::new();
    let _ = exprs.push(ExprKind::OperandReference, 0, ExprFlags::empty());
    let _ = exprs.push(ExprKind::Undefined, 0, ExprFlags::SET | ExprFlags::USED);
    exprs
}

/// True when the first operand is a 32-bit register the instruction always
/// writes, which clears the upper half of the 64-bit register.
pub(crate) fn first_operand_zero_extends(instr: &Instruction, info: &InstructionInfo) -> bool {
    instr.op_count() > 0
        && instr.op0_kind() == OpKind::Register
        && instr.op0_register().is_gpr32()
        && matches!(info.op0_access(), OpAccess::Write | OpAccess::ReadWrite)
}

fn push_implicit(
    exprs: &mut ExprVector,
    reg: Register,
    flags: ExprFlags,
) -> Result<(), ExprOverflow> {
    exprs.push(ExprKind::OperandReference, 0, ExprFlags::IMPLICIT)?;
    exprs.push_register(reg, flags | ExprFlags::for_size(reg.size()))?;
    Ok(())
}

fn push_operands(src: &OperandSource<'_>, exprs: &mut ExprVector) -> Result<(), ExprOverflow> {
    let instr = src.instr;
    let flow = instr.flow_control();
    let is_branch = matches!(
        flow,
        FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch
            | FlowControl::IndirectBranch
    );
    let is_call = matches!(flow, FlowControl::Call | FlowControl::IndirectCall);

    if is_branch || is_call {
        push_implicit(exprs, Register::RIP, ExprFlags::SET)?;
    }
    if is_call || matches!(instr.mnemonic(), Mnemonic::Push | Mnemonic::Pop) {
        push_implicit(exprs, Register::RSP, ExprFlags::SET | ExprFlags::USED)?;
    }

    for op in 0..instr.op_count() {
        let mut flags = access_flags(src.info.op_access(op));
        exprs.push(ExprKind::OperandReference, 0, ExprFlags::empty())?;
        match instr.op_kind(op) {
            OpKind::Register => {
                let reg = instr.op_register(op);
                if is_branch || is_call {
                    flags |= ExprFlags::JUMP_TARGET;
                }
                exprs.push_register(reg, flags | ExprFlags::for_size(reg.size()))?;
            }
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                exprs.push_constant(
                    instr.near_branch_target(),
                    ExprFlags::USED | ExprFlags::JUMP_TARGET,
                )?;
            }
            OpKind::Immediate8_2nd => {
                push_immediate(src, exprs, op, src.immediate2, flags)?;
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => {
                push_immediate(src, exprs, op, src.immediate, flags)?;
            }
            OpKind::Memory => {
                if is_branch || is_call {
                    flags |= ExprFlags::JUMP_TARGET;
                }
                push_memory(src, exprs, flags)?;
            }
            kind @ (OpKind::MemorySegSI
            | OpKind::MemorySegESI
            | OpKind::MemorySegRSI
            | OpKind::MemorySegDI
            | OpKind::MemorySegEDI
            | OpKind::MemorySegRDI) => {
                let reg = string_register(kind);
                push_segment_address(exprs, instr.memory_segment(), reg, flags)?;
            }
            kind @ (OpKind::MemoryESDI | OpKind::MemoryESEDI | OpKind::MemoryESRDI) => {
                let reg = string_register(kind);
                push_segment_address(exprs, Register::ES, reg, flags)?;
            }
            _ => {
                exprs.push(ExprKind::Undefined, 0, flags)?;
            }
        }
    }

    // Registers the instruction writes without naming them.
    for used in src.info.used_registers() {
        let reg = used.register();
        let written = matches!(
            used.access(),
            OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite
        );
        if !written || !(reg.is_gpr() || reg.is_segment_register()) {
            continue;
        }
        let full = reg.full_register();
        let listed = exprs.iter().any(|n| {
            n.kind == ExprKind::Register
                && n.has(ExprFlags::SET)
                && n.register().full_register() == full
        });
        if !listed {
            push_implicit(exprs, reg, access_flags(used.access()))?;
        }
    }
    Ok(())
}

/// Pointer register of a string operand, at the operand's address width.
fn string_register(kind: OpKind) -> Register {
    match kind {
        OpKind::MemorySegSI => Register::SI,
        OpKind::MemorySegESI => Register::ESI,
        OpKind::MemorySegRSI => Register::RSI,
        OpKind::MemorySegDI | OpKind::MemoryESDI => Register::DI,
        OpKind::MemorySegEDI | OpKind::MemoryESEDI => Register::EDI,
        _ => Register::RDI,
    }
}

fn push_immediate(
    src: &OperandSource<'_>,
    exprs: &mut ExprVector,
    op: u32,
    span: ByteSpan,
    flags: ExprFlags,
) -> Result<(), ExprOverflow> {
    // Implicit immediates such as the count of `shl eax, 1` have no bytes.
    let value = if span.is_empty() {
        src.instr.immediate(op)
    } else {
        span.read(src.bytes)
    };
    exprs.push_constant(value, flags | ExprFlags::for_size(span.len as usize))?;
    Ok(())
}

fn push_memory(
    src: &OperandSource<'_>,
    exprs: &mut ExprVector,
    flags: ExprFlags,
) -> Result<(), ExprOverflow> {
    let instr = src.instr;
    let address_flags = ExprFlags::for_size(src.address_size as usize);
    let segment = instr.segment_prefix();

    if segment != Register::None {
        exprs.push(ExprKind::SegmentAddress, 0, flags | address_flags)?;
        exprs.push_register(segment, ExprFlags::USED | ExprFlags::SIZE16)?;
        exprs.push(ExprKind::MemOffset, 0, address_flags)?;
    } else {
        exprs.push(ExprKind::MemOffset, 0, flags | address_flags)?;
    }

    for reg in [instr.memory_base(), instr.memory_index()] {
        let reg_flags = if reg == Register::None {
            ExprFlags::empty()
        } else {
            ExprFlags::USED | ExprFlags::for_size(reg.size())
        };
        exprs.push_register(reg, reg_flags)?;
    }
    exprs.push_constant(instr.memory_index_scale() as u64, ExprFlags::SIZE8)?;
    let displacement = src.displacement.read(src.bytes);
    exprs.push_constant(displacement, ExprFlags::for_size(src.displacement.len as usize))?;
    Ok(())
}

fn push_segment_address(
    exprs: &mut ExprVector,
    segment: Register,
    reg: Register,
    flags: ExprFlags,
) -> Result<(), ExprOverflow> {
    exprs.push(
        ExprKind::SegmentAddress,
        0,
        flags | ExprFlags::for_size(reg.size()),
    )?;
    exprs.push_register(segment, ExprFlags::USED | ExprFlags::SIZE16)?;
    exprs.push_register(reg, ExprFlags::USED | ExprFlags::for_size(reg.size()))?;
    Ok(())
}
