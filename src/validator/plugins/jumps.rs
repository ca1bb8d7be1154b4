//! Jump target validation.
//!
//! While walking the segment the plugin collects three address sets: every
//! instruction start (`possible`), every explicit direct jump target
//! (`actual`), and instruction starts inside an atomic idiom that must not
//! be jumped to (`removed`). Once the walk is done it requires every target
//! and every bundle start to be a possible, non-removed address.

use iced_x86::Mnemonic;

use crate::core::expr::{ExprFlags, ExprKind, ExprNode};
use crate::core::instruction::DecodedInstruction;
use crate::core::register::reg64_for_32;
use crate::decoder::InstIter;
use crate::validator::address_set::AddressSet;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::utils::{binary_operand_roots, mem_offset_matches_base_index};
use crate::validator::ValidatorState;

/// Opcode of `and r/m32, imm8`.
const AND_IMM8_OPCODE: u8 = 0x83;

#[derive(Debug)]
pub struct JumpValidator {
    actual: AddressSet,
    possible: AddressSet,
    removed: AddressSet,
}

impl JumpValidator {
    pub fn new(vbase: u64, vlimit: u64) -> Self {
        Self {
            actual: AddressSet::new(vbase, vlimit),
            possible: AddressSet::new(vbase, vlimit),
            removed: AddressSet::new(vbase, vlimit),
        }
    }

    /// Move the marks other plugins left on the state into `removed`.
    fn collect_removed(&mut self, state: &mut ValidatorState) {
        for addr in state.take_removed_marks() {
            self.removed.insert(addr);
        }
    }

    fn remember(&mut self, state: &mut ValidatorState, inst: &DecodedInstruction) {
        if self.possible.in_range(inst.vpc) {
            self.possible.insert(inst.vpc);
        } else {
            state.inst_message(LogLevel::Error, inst, "Instruction pc out of range");
        }
    }

    fn add_direct_target(&mut self, state: &mut ValidatorState, inst: &DecodedInstruction, target: u64) {
        if self.actual.in_range(target) {
            self.actual.insert(target);
            return;
        }
        // Outside the segment only bundle starts below 4GiB are allowed.
        let aligned = target & state.alignment_mask() == 0 && target >> 32 == 0;
        if !aligned {
            state.inst_message(LogLevel::Error, inst, "Instruction jumps to bad address");
        }
    }

    fn add_expr_jump_targets(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let exprs = &inst.exprs;
        for (i, node) in exprs.iter().enumerate() {
            if !node.has(ExprFlags::JUMP_TARGET) {
                continue;
            }
            match node.kind {
                ExprKind::Register => {
                    if !is_masked_indirect_jump(state, iter, node) {
                        state.inst_message(LogLevel::Error, inst, "Invalid indirect jump");
                    }
                }
                ExprKind::Constant | ExprKind::Constant64 => {
                    let Some(target) = exprs.constant(i) else {
                        continue;
                    };
                    // `call 0` is used to get the current address.
                    if target == 0 && inst.mnemonic() == Mnemonic::Call {
                        continue;
                    }
                    self.add_direct_target(state, inst, target);
                }
                _ => {
                    state.inst_message(LogLevel::Error, inst, "Jump not native client compliant");
                }
            }
        }
    }

    /// Return addresses are never checked as targets, so they must start a
    /// bundle.
    fn check_call_alignment(&self, state: &mut ValidatorState, inst: &DecodedInstruction) {
        let next_pc = inst.next_pc();
        if next_pc & state.alignment_mask() != 0 {
            state.inst_message(
                LogLevel::Error,
                inst,
                &format!("Bad call alignment, return pc = {:x}", next_pc),
            );
        }
    }

    fn is_reachable(&self, addr: u64) -> bool {
        self.possible.contains(addr) && !self.removed.contains(addr)
    }
}

/// Recognize
///
/// ```text
/// and reg32, MASK
/// lea target, [base + reg64*1]      or      add reg64, base
/// jmp target                                jmp reg64
/// ```
///
/// where MASK clears the bundle offset bits. On a match the lea/add and the
/// jump are marked as atomic.
fn is_masked_indirect_jump(state: &mut ValidatorState, iter: &InstIter<'_>, target: &ExprNode) -> bool {
    let jump_reg = target.register();
    let Some(and) = iter.try_lookback(2) else {
        return false;
    };
    if and.num_opcode_bytes == 0 || and.opcode_byte() != AND_IMM8_OPCODE || and.mnemonic() != Mnemonic::And {
        return false;
    }
    let Some((dest, mask_index)) = binary_operand_roots(and) else {
        return false;
    };
    if and.exprs[dest].kind != ExprKind::Register {
        return false;
    }
    let Some(and_64_reg) = reg64_for_32(and.exprs[dest].register()) else {
        return false;
    };
    let mask = if state.config().identity_mask {
        0xff
    } else {
        !(state.alignment_mask() as u8)
    };
    let mask_node = &and.exprs[mask_index];
    if mask_node.kind != ExprKind::Constant || mask_node.value != mask as u64 {
        return false;
    }

    let middle = iter.lookback(1);
    let Some((dest, src)) = binary_operand_roots(middle) else {
        return false;
    };
    if middle.exprs[dest].kind != ExprKind::Register || middle.exprs[dest].register() != jump_reg {
        return false;
    }
    let base = state.base_register();
    let matched = match middle.mnemonic() {
        Mnemonic::Lea => {
            middle.exprs[src].kind == ExprKind::MemOffset
                && mem_offset_matches_base_index(&middle.exprs, src, base, and_64_reg)
        }
        Mnemonic::Add => jump_reg == and_64_reg && middle.exprs.register(src) == base,
        _ => false,
    };
    if matched {
        state.mark_jump_illegal(middle);
        state.mark_jump_illegal(iter.current());
    }
    matched
}

impl InstructionValidator for JumpValidator {
    fn name(&self) -> &'static str {
        "jumps"
    }

    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        self.remember(state, inst);
        if inst.pattern.is_jump() || inst.pattern.is_cond_jump() {
            self.add_expr_jump_targets(state, iter);
            if inst.mnemonic() == Mnemonic::Call {
                self.check_call_alignment(state, inst);
            }
        }
        self.collect_removed(state);
    }

    fn remember_ip(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        self.remember(state, iter.current());
    }

    fn post_validate(&mut self, state: &mut ValidatorState) {
        self.collect_removed(state);
        let (vbase, vlimit) = (state.vbase(), state.vlimit());

        state.message(
            LogLevel::Info,
            &format!("Checking jump targets: {:x} to {:x}", vbase, vlimit),
        );
        for addr in AddressSet::bad_targets(&self.actual, &self.possible, &self.removed) {
            state.address_message(LogLevel::Error, addr, "Bad jump target");
        }

        state.message(LogLevel::Info, "Checking that basic blocks are aligned");
        if vbase & state.alignment_mask() != 0 {
            state.message(
                LogLevel::Error,
                &format!("Code segment starts at 0x{:x}, which isn't aligned properly.", vbase),
            );
            return;
        }
        for addr in (vbase..vlimit).step_by(state.alignment() as usize) {
            if !self.is_reachable(addr) {
                state.address_message(LogLevel::Error, addr, "Bad basic block alignment.");
            }
        }
    }
}
