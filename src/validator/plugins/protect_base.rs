//! Protection of the sandbox base, stack and frame registers.
//!
//! RSP and RBP must always hold the base register's upper half above an
//! arbitrary 32-bit offset. They may only change through short idioms that
//! keep this true, and the base register may not change at all. A 32-bit
//! write to ESP or EBP is only legal if the very next instruction rebuilds
//! the full register, so it is held for one instruction before being
//! reported.

use iced_x86::{Mnemonic, Register};

use crate::core::expr::{ExprFlags, ExprKind};
use crate::core::instruction::DecodedInstruction;
use crate::core::register::{is_subregister_of, reg32_for_64, register_name};
use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::utils::{
    assigns_register_with_zero_extends, is_add_or_sub_bounded_const_from_esp,
    is_binary_set_using_registers, is_mov_using_registers, mem_offset_matches_base_index,
    operand_one_is_register_set,
};
use crate::validator::ValidatorState;

const BUFFER_SIZE: usize = 2;

/// Pending 32-bit stack/frame writes of one instruction.
#[derive(Debug, Default)]
struct RegisterLocals {
    esp_set: Option<Box<DecodedInstruction>>,
    ebp_set: Option<Box<DecodedInstruction>>,
}

#[derive(Debug)]
pub struct BaseRegisterValidator {
    buffer: [RegisterLocals; BUFFER_SIZE],
    previous: usize,
    current: usize,
}

impl Default for BaseRegisterValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseRegisterValidator {
    pub fn new() -> Self {
        Self {
            buffer: Default::default(),
            previous: 0,
            current: 1,
        }
    }

    /// Report writes of the previous instruction nothing repaired, then
    /// rotate.
    fn report_previous_bad(&mut self, state: &mut ValidatorState) {
        let previous = &mut self.buffer[self.previous];
        if let Some(inst) = previous.esp_set.take() {
            state.inst_message(LogLevel::Error, &inst, "Illegal assignment to ESP");
        }
        if let Some(inst) = previous.ebp_set.take() {
            state.inst_message(LogLevel::Error, &inst, "Illegal assignment to EBP");
        }
        self.previous = self.current;
        self.current = (self.current + 1) % BUFFER_SIZE;
    }

    fn check_rsp(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>, index: usize) {
        let inst = iter.current();
        let base = state.base_register();
        let name = inst.mnemonic();
        match name {
            // The stack operand of push and pop.
            Mnemonic::Push | Mnemonic::Pop if index == 1 => return,
            // After the implicit RIP.
            Mnemonic::Call if index == 3 => return,
            Mnemonic::Or | Mnemonic::Add => {
                if is_binary_set_using_registers(inst, name, Register::RSP, base) {
                    if let Some(prev) = iter.try_lookback(1) {
                        if assigns_register_with_zero_extends(prev, Register::ESP)
                            || (name == Mnemonic::Add && is_add_or_sub_bounded_const_from_esp(prev))
                        {
                            state.mark_jump_illegal(inst);
                            self.buffer[self.previous].esp_set = None;
                            return;
                        }
                    }
                }
            }
            Mnemonic::Lea => {
                if accept_reg_move_lea_32_to_64(state, iter, Register::RSP) {
                    self.buffer[self.previous].esp_set = None;
                    return;
                }
            }
            _ => {
                // and rsp, imm8 with a negative imm8 realigns the stack.
                let realign = name == Mnemonic::And
                    && inst.length == 4
                    && inst.bytes()[..3] == [0x48, 0x83, 0xe4]
                    && inst.byte(3) & 0x80 != 0;
                if realign || is_mov_using_registers(inst, Register::RSP, Register::RBP) {
                    return;
                }
            }
        }
        state.inst_message(LogLevel::Error, inst, "Illegal assignment to RSP");
    }

    fn check_rbp(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let base = state.base_register();
        match inst.mnemonic() {
            Mnemonic::Add => {
                if let Some(prev) = iter.try_lookback(1) {
                    if is_binary_set_using_registers(inst, Mnemonic::Add, Register::RBP, base)
                        && assigns_register_with_zero_extends(prev, Register::EBP)
                    {
                        state.mark_jump_illegal(inst);
                        self.buffer[self.previous].ebp_set = None;
                        return;
                    }
                }
            }
            Mnemonic::Lea => {
                if accept_reg_move_lea_32_to_64(state, iter, Register::RBP) {
                    self.buffer[self.previous].ebp_set = None;
                    return;
                }
            }
            _ => {
                if is_mov_using_registers(inst, Register::RBP, Register::RSP) {
                    return;
                }
            }
        }
        state.inst_message(LogLevel::Error, inst, "Illegal change to register RBP");
    }
}

/// `lea reg, [reg + base*1]` with a 64-bit address.
fn is_lea_address_reg_plus_rbase(state: &ValidatorState, inst: &DecodedInstruction, reg: Register) -> bool {
    if inst.mnemonic() != Mnemonic::Lea || inst.exprs.operand_count() != 2 {
        return false;
    }
    let Some(op2) = inst.operand_root(2) else {
        return false;
    };
    let node = &inst.exprs[op2];
    node.kind == ExprKind::MemOffset
        && node.has(ExprFlags::SIZE64)
        && mem_offset_matches_base_index(&inst.exprs, op2, reg, state.base_register())
}

/// A zero-extending write of the low half of `reg` followed by the lea that
/// restores its upper half. The lea becomes an illegal jump target.
fn accept_reg_move_lea_32_to_64(state: &mut ValidatorState, iter: &InstIter<'_>, reg: Register) -> bool {
    let inst = iter.current();
    if !operand_one_is_register_set(inst, reg) {
        return false;
    }
    let Some(prev) = iter.try_lookback(1) else {
        return false;
    };
    let Some(reg32) = reg32_for_64(reg) else {
        return false;
    };
    if assigns_register_with_zero_extends(prev, reg32) && is_lea_address_reg_plus_rbase(state, inst, reg) {
        state.mark_jump_illegal(inst);
        return true;
    }
    false
}

fn is_segment_register(reg: Register) -> bool {
    matches!(
        reg,
        Register::CS | Register::DS | Register::SS | Register::ES | Register::FS | Register::GS
    )
}

impl InstructionValidator for BaseRegisterValidator {
    fn name(&self) -> &'static str {
        "protect_base"
    }

    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let base = state.base_register();

        for (index, node) in inst.exprs.iter().enumerate() {
            if node.kind != ExprKind::Register || !node.has(ExprFlags::SET) {
                continue;
            }
            let reg = node.register();
            if reg == base {
                state.inst_message(
                    LogLevel::Error,
                    inst,
                    &format!("Illegal to change the value of register {}", register_name(base)),
                );
                continue;
            }
            match reg {
                Register::RSP => self.check_rsp(state, iter, index),
                Register::RBP => self.check_rbp(state, iter),
                Register::ESP => {
                    self.buffer[self.current].esp_set = Some(Box::new(inst.clone()));
                }
                Register::EBP => {
                    self.buffer[self.current].ebp_set = Some(Box::new(inst.clone()));
                }
                reg if is_segment_register(reg) => {
                    state.inst_message(
                        LogLevel::Error,
                        inst,
                        &format!("Illegal assignment to segment register {}", register_name(reg)),
                    );
                }
                reg => {
                    let aliased = [base, Register::RSP, Register::RBP]
                        .into_iter()
                        .find(|full| is_subregister_of(reg, *full));
                    if let Some(full) = aliased {
                        state.inst_message(
                            LogLevel::Error,
                            inst,
                            &format!(
                                "Changing {} changes the value of {}",
                                register_name(reg),
                                register_name(full)
                            ),
                        );
                    }
                }
            }
        }
        self.report_previous_bad(state);
    }

    fn post_validate(&mut self, state: &mut ValidatorState) {
        self.report_previous_bad(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::plugins::test_support::{run, state};
    use crate::validator::report::RecordingReporter;

    fn check(code: &[u8]) -> (ValidatorState, RecordingReporter) {
        let (mut state, reporter) = state(64);
        run(&mut BaseRegisterValidator::new(), &mut state, code);
        (state, reporter)
    }

    fn messages(reporter: &RecordingReporter) -> Vec<String> {
        reporter.errors().into_iter().map(|d| d.message).collect()
    }

    #[test]
    fn unpaired_rsp_change_is_rejected() {
        // add rsp, 0x10
        let (state, reporter) = check(&[0x48, 0x83, 0xc4, 0x10]);
        assert_eq!(messages(&reporter), vec!["Illegal assignment to RSP"]);
        assert!(!state.is_valid());
    }

    #[test]
    fn stack_idioms_are_accepted() {
        let code = [
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
            0x48, 0x89, 0xec, // mov rsp, rbp
            0x48, 0x83, 0xe4, 0xf0, // and rsp, -16
            0x89, 0xc4, // mov esp, eax
            0x4c, 0x01, 0xfc, // add rsp, r15
            0x83, 0xec, 0x08, // sub esp, 8
            0x4c, 0x01, 0xfc, // add rsp, r15
            0x89, 0xdd, // mov ebp, ebx
            0x4c, 0x01, 0xfd, // add rbp, r15
        ];
        let (state, reporter) = check(&code);
        assert!(messages(&reporter).is_empty(), "{:?}", reporter.diagnostics());
        assert!(state.is_valid());
    }

    #[test]
    fn lea_restores_upper_half() {
        let code = [
            0x89, 0xc4, // mov esp, eax
            0x4a, 0x8d, 0x24, 0x3c, // lea rsp, [rsp+r15*1]
        ];
        let (state, reporter) = check(&code);
        assert!(messages(&reporter).is_empty(), "{:?}", reporter.diagnostics());
        assert!(state.is_valid());
    }

    #[test]
    fn esp_write_needs_immediate_repair() {
        let code = [
            0x89, 0xc4, // mov esp, eax
            0x90, // nop
            0x4c, 0x09, 0xfc, // or rsp, r15
        ];
        let (_, reporter) = check(&code);
        assert_eq!(
            messages(&reporter),
            vec!["Illegal assignment to ESP", "Illegal assignment to RSP"]
        );
    }

    #[test]
    fn dangling_esp_write_is_reported_at_end() {
        // mov esp, eax
        let (state, reporter) = check(&[0x89, 0xc4]);
        assert_eq!(messages(&reporter), vec!["Illegal assignment to ESP"]);
        assert!(!state.is_valid());
    }

    #[test]
    fn base_register_is_read_only() {
        // mov r15, rax
        let (_, reporter) = check(&[0x49, 0x89, 0xc7]);
        assert_eq!(messages(&reporter), vec!["Illegal to change the value of register R15"]);

        // mov r15d, eax
        let (_, reporter) = check(&[0x41, 0x89, 0xc7]);
        assert_eq!(messages(&reporter), vec!["Changing R15D changes the value of R15"]);

        // mov sp, ax
        let (_, reporter) = check(&[0x66, 0x89, 0xc4]);
        assert_eq!(messages(&reporter), vec!["Changing SP changes the value of RSP"]);
    }

    #[test]
    fn segment_registers_are_read_only() {
        // mov ds, ax
        let (_, reporter) = check(&[0x8e, 0xd8]);
        assert_eq!(messages(&reporter), vec!["Illegal assignment to segment register DS"]);
    }

    #[test]
    fn rbp_change_needs_idiom() {
        // mov rbp, rax
        let (_, reporter) = check(&[0x48, 0x89, 0xc5]);
        assert_eq!(messages(&reporter), vec!["Illegal change to register RBP"]);
    }

    #[test]
    fn paired_instructions_are_marked() {
        let code = [
            0x89, 0xc4, // mov esp, eax
            0x4c, 0x01, 0xfc, // add rsp, r15
        ];
        let (mut state, _) = check(&code);
        assert_eq!(state.take_removed_marks(), vec![2]);
    }
}
