//! Memory references must stay inside the sandbox.
//!
//! A store, and a load when read sandboxing is on, may only address
//! `[base + index*scale + disp]` where base is the sandbox base, RSP, RBP or
//! RIP and any index was zero-extended by the previous instruction. String
//! instructions use an implicit `seg:[rdi]` style operand, which is only
//! allowed right after an lea that computes the pointer register from a
//! valid memory offset.

use iced_x86::{Mnemonic, Register};

use crate::core::expr::{ExprFlags, ExprKind, ExprNode, ExprVector};
use crate::core::instruction::DecodedInstruction;
use crate::core::register::reg32_for_64;
use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::utils::assigns_register_with_zero_extends;
use crate::validator::ValidatorState;

fn is_possible_sandboxing_node(state: &ValidatorState, node: &ExprNode) -> bool {
    node.has(ExprFlags::SET) || (state.config().read_sandbox && node.has(ExprFlags::USED))
}

/// Check the memory offset at `node_index` of `inst`, which is the
/// instruction `lookback` positions behind the iterator.
fn is_valid_mem_offset(
    state: &mut ValidatorState,
    iter: &InstIter<'_>,
    lookback: usize,
    inst: &DecodedInstruction,
    node_index: usize,
    print: bool,
) -> bool {
    let exprs = &inst.exprs;
    let node = &exprs[node_index];
    if node.kind != ExprKind::MemOffset {
        return false;
    }

    let reject = |state: &mut ValidatorState, message: &str| {
        if print {
            state.inst_message(LogLevel::Error, inst, message);
        }
        false
    };

    if !node.has(ExprFlags::SIZE64) {
        return reject(state, "Assignment to non-64 bit memory address");
    }

    let base_index = node_index + 1;
    let base = exprs.register(base_index);
    if ![state.base_register(), Register::RSP, Register::RBP, Register::RIP].contains(&base) {
        let message = if base == Register::None {
            "No base register specified in memory offset"
        } else {
            "Invalid base register in memory offset"
        };
        return reject(state, message);
    }

    let index_index = base_index + exprs.width(base_index);
    let index_node = &exprs[index_index];
    let index = index_node.register();
    if index != Register::None {
        let zero_extended = base != Register::RIP
            && index_node.has(ExprFlags::SIZE64)
            && iter.try_lookback(lookback + 1).is_some_and(|prev| {
                reg32_for_64(index).is_some_and(|r32| assigns_register_with_zero_extends(prev, r32))
            });
        if !zero_extended {
            return reject(state, "Invalid index register in memory offset");
        }
        state.mark_jump_illegal(inst);
    }

    let scale_index = index_index + exprs.width(index_index);
    let disp_index = scale_index + exprs.width(scale_index);
    let disp_kind = exprs.nodes().get(disp_index).map(|n| n.kind);
    if disp_kind != Some(ExprKind::Constant)
        && (base != Register::RIP || disp_kind == Some(ExprKind::Constant64))
    {
        return reject(state, "Invalid displacement in memory offset");
    }
    true
}

/// `seg:[reg]` directly after `lea reg, [valid offset]`.
fn is_lea_computed_segment_address(
    state: &mut ValidatorState,
    iter: &InstIter<'_>,
    exprs: &ExprVector,
    node_index: usize,
) -> bool {
    let seg = exprs.register(exprs.kid_index(node_index, 0));
    if !matches!(seg, Register::CS | Register::DS | Register::ES | Register::SS) {
        return false;
    }
    let Some(prev) = iter.try_lookback(1) else {
        return false;
    };
    if prev.mnemonic() != Mnemonic::Lea {
        return false;
    }
    let reg_index = exprs.kid_index(node_index, 1);
    if reg_index >= exprs.len() {
        return false;
    }
    // The destination of lea is always node 1.
    if prev.exprs.len() < 2 || prev.exprs.register(1) != exprs.register(reg_index) {
        return false;
    }
    let Some(offset_index) = prev.operand_root(2) else {
        return false;
    };
    is_valid_mem_offset(state, iter, 1, prev, offset_index, false)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryValidator;

impl InstructionValidator for MemoryValidator {
    fn name(&self) -> &'static str {
        "memory_protect"
    }

    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let exprs = &inst.exprs;

        for (i, node) in exprs.iter().enumerate() {
            if state.should_quit() {
                break;
            }
            if !is_possible_sandboxing_node(state, node) {
                continue;
            }
            if is_valid_mem_offset(state, iter, 0, inst, i, true) {
                continue;
            }
            match node.kind {
                ExprKind::SegmentAddress => {
                    if !node.has(ExprFlags::SIZE64) {
                        state.inst_message(
                            LogLevel::Error,
                            inst,
                            "Assignment to non-64 bit segment address",
                        );
                    } else if is_lea_computed_segment_address(state, iter, exprs, i) {
                        state.mark_jump_illegal(inst);
                    } else {
                        state.inst_message(
                            LogLevel::Error,
                            inst,
                            "Segment memory reference not allowed",
                        );
                    }
                }
                kind if kind == ExprKind::Undefined
                    || (kind == ExprKind::Register && node.register() == Register::None) =>
                {
                    // A memory offset may leave its index register out.
                    let optional_index = exprs
                        .parent_index(i)
                        .is_some_and(|parent| exprs.kid_index(parent, 1) == i);
                    if !optional_index {
                        state.inst_message(
                            LogLevel::Error,
                            inst,
                            "Memory reference not understood, can't verify correctness.",
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use crate::cpu::CpuFeatures;
    use crate::validator::plugins::test_support::{run, state, state_with};
    use crate::validator::report::RecordingReporter;

    fn check(code: &[u8]) -> (ValidatorState, RecordingReporter) {
        let (mut state, reporter) = state(64);
        run(&mut MemoryValidator, &mut state, code);
        (state, reporter)
    }

    fn messages(reporter: &RecordingReporter) -> Vec<String> {
        reporter.errors().into_iter().map(|d| d.message).collect()
    }

    #[test]
    fn based_stores_are_allowed() {
        let code = [
            0x41, 0x89, 0x07, // mov [r15], eax
            0x48, 0x89, 0x44, 0x24, 0x08, // mov [rsp+8], rax
            0x89, 0x45, 0xf8, // mov [rbp-8], eax
            0x89, 0x05, 0x00, 0x01, 0x00, 0x00, // mov [rip+0x100], eax
        ];
        let (state, reporter) = check(&code);
        assert!(messages(&reporter).is_empty(), "{:?}", reporter.diagnostics());
        assert!(state.is_valid());
    }

    #[test]
    fn unbased_store_is_rejected() {
        // mov [rax], eax
        let (_, reporter) = check(&[0x89, 0x00]);
        assert_eq!(messages(&reporter), vec!["Invalid base register in memory offset"]);
    }

    #[test]
    fn absolute_store_has_no_base() {
        // mov [0x1000], eax
        let (_, reporter) = check(&[0x89, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(messages(&reporter), vec!["No base register specified in memory offset"]);
    }

    #[test]
    fn index_must_be_zero_extended() {
        // mov [r15+rax*1], ecx
        let store = [0x41, 0x89, 0x0c, 0x07];
        let (_, reporter) = check(&store);
        assert_eq!(messages(&reporter), vec!["Invalid index register in memory offset"]);

        // mov eax, eax first
        let mut code = vec![0x89, 0xc0];
        code.extend_from_slice(&store);
        let (mut state, reporter) = check(&code);
        assert!(messages(&reporter).is_empty(), "{:?}", reporter.diagnostics());
        assert_eq!(state.take_removed_marks(), vec![2]);
    }

    #[test]
    fn loads_need_read_sandbox() {
        // mov eax, [rax]
        let load = [0x8b, 0x00];
        let (state, reporter) = check(&load);
        assert!(!state.is_valid());
        assert_eq!(messages(&reporter), vec!["Invalid base register in memory offset"]);

        let (mut state, reporter) = state_with(
            64,
            ValidatorConfig {
                read_sandbox: false,
                cpu_features: Some(CpuFeatures::all()),
                ..ValidatorConfig::default()
            },
        );
        run(&mut MemoryValidator, &mut state, &load);
        assert!(reporter.errors().is_empty());
    }

    #[test]
    fn string_store_after_lea() {
        let code = [
            0x89, 0xff, // mov edi, edi
            0x49, 0x8d, 0x3c, 0x3f, // lea rdi, [r15+rdi*1]
            0xab, // stosd
        ];
        let (mut state, reporter) = check(&code);
        assert!(messages(&reporter).is_empty(), "{:?}", reporter.diagnostics());
        assert_eq!(state.take_removed_marks(), vec![2, 6]);
    }

    #[test]
    fn bare_string_store_is_rejected() {
        // stosd
        let (_, reporter) = check(&[0xab]);
        assert_eq!(messages(&reporter), vec!["Segment memory reference not allowed"]);
    }

    #[test]
    fn thirty_two_bit_address_is_rejected() {
        // mov [r15d], eax
        let (_, reporter) = check(&[0x67, 0x41, 0x89, 0x07]);
        assert_eq!(messages(&reporter), vec!["Assignment to non-64 bit memory address"]);
    }
}
