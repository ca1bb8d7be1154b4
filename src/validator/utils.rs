//! Instruction shape predicates shared by the plugins.
//!
//! Operand trees of two-operand register instructions have a fixed layout:
//! node 1 is the first register and node 3 the second.

use iced_x86::{Mnemonic, Register};

use crate::core::expr::{ExprFlags, ExprKind, ExprVector};
use crate::core::instruction::DecodedInstruction;

fn set_use(flags: ExprFlags) -> ExprFlags {
    flags & (ExprFlags::SET | ExprFlags::USED)
}

/// `name reg1, reg2` with exactly two operands.
pub fn is_binary_using_registers(
    inst: &DecodedInstruction,
    name: Mnemonic,
    reg1: Register,
    reg2: Register,
) -> bool {
    let exprs = &inst.exprs;
    inst.mnemonic() == name
        && exprs.operand_count() == 2
        && exprs.len() > 3
        && exprs[1].is_register(reg1)
        && exprs[3].is_register(reg2)
}

/// `mov reg_set, reg_use` where the first operand is only written and the
/// second only read.
pub fn is_mov_using_registers(inst: &DecodedInstruction, reg_set: Register, reg_use: Register) -> bool {
    is_binary_using_registers(inst, Mnemonic::Mov, reg_set, reg_use)
        && set_use(inst.exprs[1].flags) == ExprFlags::SET
        && set_use(inst.exprs[3].flags) == ExprFlags::USED
}

/// `name reg1, reg2` where the first operand is read and written and the
/// second only read.
pub fn is_binary_set_using_registers(
    inst: &DecodedInstruction,
    name: Mnemonic,
    reg1: Register,
    reg2: Register,
) -> bool {
    is_binary_using_registers(inst, name, reg1, reg2)
        && set_use(inst.exprs[1].flags) == ExprFlags::SET | ExprFlags::USED
        && set_use(inst.exprs[3].flags) == ExprFlags::USED
}

/// The first operand is `reg` and is written.
pub fn operand_one_is_register_set(inst: &DecodedInstruction, reg: Register) -> bool {
    let exprs = &inst.exprs;
    exprs.len() >= 2 && exprs[1].is_register(reg) && exprs[1].has(ExprFlags::SET)
}

/// The first operand is a 32-bit write that clears the upper register half.
pub fn operand_one_zero_extends(inst: &DecodedInstruction) -> bool {
    inst.exprs.operand_count() >= 1 && inst.zero_extends && inst.operand_size == 4
}

/// The instruction assigns the 32-bit register `reg`, zero-extending it.
pub fn assigns_register_with_zero_extends(inst: &DecodedInstruction, reg: Register) -> bool {
    operand_one_is_register_set(inst, reg) && operand_one_zero_extends(inst)
}

/// `add`/`sub` of a constant to ESP.
pub fn is_add_or_sub_bounded_const_from_esp(inst: &DecodedInstruction) -> bool {
    let exprs = &inst.exprs;
    matches!(inst.mnemonic(), Mnemonic::Add | Mnemonic::Sub)
        && exprs.operand_count() == 2
        && exprs.len() > 3
        && exprs[1].is_register(Register::ESP)
        && exprs[3].kind == ExprKind::Constant
}

/// The memory offset at `index` is `[base + index*1 + 0]`.
pub fn mem_offset_matches_base_index(
    exprs: &ExprVector,
    index: usize,
    base: Register,
    index_reg: Register,
) -> bool {
    if index >= exprs.len() || exprs[index].kind != ExprKind::MemOffset {
        return false;
    }
    exprs.register(exprs.kid_index(index, 0)) == base
        && exprs.register(exprs.kid_index(index, 1)) == index_reg
        && exprs.constant(exprs.kid_index(index, 2)) == Some(1)
        && exprs.constant(exprs.kid_index(index, 3)) == Some(0)
}

/// Indices of the roots of the first two operands, if there are two.
pub fn binary_operand_roots(inst: &DecodedInstruction) -> Option<(usize, usize)> {
    Some((inst.operand_root(1)?, inst.operand_root(2)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    #[test]
    fn binary_register_forms() {
        // add rsp, r15
        let add = decode_one(&[0x4c, 0x01, 0xfc], 0);
        assert!(is_binary_using_registers(&add, Mnemonic::Add, Register::RSP, Register::R15));
        assert!(is_binary_set_using_registers(&add, Mnemonic::Add, Register::RSP, Register::R15));
        assert!(!is_mov_using_registers(&add, Register::RSP, Register::R15));

        // mov rsp, rbp
        let mov = decode_one(&[0x48, 0x89, 0xec], 0);
        assert!(is_mov_using_registers(&mov, Register::RSP, Register::RBP));
        assert!(!is_binary_set_using_registers(&mov, Mnemonic::Mov, Register::RSP, Register::RBP));
    }

    #[test]
    fn zero_extending_writes() {
        // mov esp, eax
        let mov = decode_one(&[0x89, 0xc4], 0);
        assert!(assigns_register_with_zero_extends(&mov, Register::ESP));
        assert!(!assigns_register_with_zero_extends(&mov, Register::EAX));

        // mov rsp, rax is not a 32-bit write
        let mov64 = decode_one(&[0x48, 0x89, 0xc4], 0);
        assert!(!operand_one_zero_extends(&mov64));
    }

    #[test]
    fn esp_adjustment() {
        // sub esp, 8
        let sub = decode_one(&[0x83, 0xec, 0x08], 0);
        assert!(is_add_or_sub_bounded_const_from_esp(&sub));
        // add esp, eax
        let add = decode_one(&[0x01, 0xc4], 0);
        assert!(!is_add_or_sub_bounded_const_from_esp(&add));
    }

    #[test]
    fn lea_address_shape() {
        // lea rsp, [rsp+r15*1]
        let lea = decode_one(&[0x4a, 0x8d, 0x24, 0x3c], 0);
        let (_, src) = binary_operand_roots(&lea).expect("two operands");
        assert!(mem_offset_matches_base_index(&lea.exprs, src, Register::RSP, Register::R15));
        assert!(!mem_offset_matches_base_index(&lea.exprs, src, Register::R15, Register::RSP));
    }
}
