//! Validation of a patched copy of an already validated segment.
//!
//! Both segments are decoded in lockstep. Identical instructions are only
//! recorded as instruction starts. Changed instructions must keep their
//! encoding shape, and may only differ in a call target, a mov immediate or
//! a mov displacement; they are then run through the full plugin set.

use iced_x86::Mnemonic;
use serde::{Deserialize, Serialize};

use super::{registry, segment_slice, ValidatorState};
use crate::core::expr::{ExprFlags, ExprKind};
use crate::core::instruction::DecodedInstruction;
use crate::decoder::InstIter;
use crate::error::{Result, ValidatorError};
use crate::span_trace;
use crate::validator::report::LogLevel;

/// Outcome counters of [`ValidatorState::validate_replacement`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementSummary {
    pub instructions_compared: usize,
    pub instructions_changed: usize,
    /// Instruction boundaries or counts differ, so the walk stopped.
    pub structure_mismatch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Identical,
    Changed,
    /// Changed in a way a patch may not change an instruction.
    Rejected,
    /// Address or length differ.
    Misaligned,
}

/// Raw bytes of one matched pair may differ only where the tree position
/// is a patchable constant.
fn is_patchable_constant(old: &DecodedInstruction, index: usize) -> bool {
    let exprs = &old.exprs;
    let node = &exprs[index];
    if node.kind != ExprKind::Constant {
        return false;
    }
    let Some(parent) = exprs.parent_index(index) else {
        return false;
    };
    let parent_kind = exprs[parent].kind;
    match old.mnemonic() {
        Mnemonic::Call => node.has(ExprFlags::JUMP_TARGET) && parent_kind == ExprKind::OperandReference,
        Mnemonic::Mov => {
            (node.has(ExprFlags::USED) && parent_kind == ExprKind::OperandReference)
                // The displacement is the fourth kid of a memory offset.
                || (parent_kind == ExprKind::MemOffset && index - parent == 4)
        }
        _ => false,
    }
}

fn same_shape(old: &DecodedInstruction, new: &DecodedInstruction) -> bool {
    old.num_prefix_bytes == new.num_prefix_bytes
        && old.num_rex_prefixes == new.num_rex_prefixes
        && old.rex == new.rex
        && old.modrm == new.modrm
        && old.sib == new.sib
        && old.operand_size == new.operand_size
        && old.address_size == new.address_size
        && old.prefix_mask == new.prefix_mask
        && old.pattern.code == new.pattern.code
        && old.exprs.len() == new.exprs.len()
}

fn compare(old: &DecodedInstruction, new: &DecodedInstruction) -> Comparison {
    if old.vpc != new.vpc || old.length != new.length {
        return Comparison::Misaligned;
    }
    let read = old.read_length as usize;
    if old.read_length == new.read_length && old.bytes[..read] == new.bytes[..read] {
        return Comparison::Identical;
    }
    if !same_shape(old, new) {
        return Comparison::Rejected;
    }
    for (i, (a, b)) in old.exprs.iter().zip(new.exprs.iter()).enumerate() {
        if a.kind != b.kind || a.flags != b.flags {
            return Comparison::Rejected;
        }
        if a.value != b.value && !is_patchable_constant(old, i) {
            return Comparison::Rejected;
        }
    }
    Comparison::Changed
}

impl ValidatorState {
    /// Check that `new` may replace the validated segment `old`, both mapped
    /// at `vbase`. In stub-out mode rejected instructions of `new` are
    /// overwritten with halts.
    pub fn validate_replacement(
        &mut self,
        old: &[u8],
        new: &mut [u8],
        vbase: u64,
        size: u64,
    ) -> Result<ReplacementSummary> {
        self.begin_walk(vbase, size)?;
        if (old.len() as u64) < size {
            return Err(ValidatorError::SizeMismatch {
                expected: size,
                actual: old.len() as u64,
            });
        }
        let new = segment_slice(new, size)?;
        let old = &old[..size as usize];
        let span = span_trace!(
            "validate_replacement",
            vbase = %format_args!("{:x}", vbase),
            size
        );
        let _guard = span.enter();

        let mut summary = ReplacementSummary::default();
        let mut validators = registry::build_validators(self);
        {
            let depth = self.config.lookback_depth;
            let mut iter_old = InstIter::new(self.tables, old, vbase, depth);
            let mut iter_new = InstIter::new(self.tables, &new[..], vbase, depth);
            while iter_old.has_next() && iter_new.has_next() {
                let (inst_old, inst_new) = (iter_old.current(), iter_new.current());
                summary.instructions_compared += 1;
                match compare(inst_old, inst_new) {
                    Comparison::Identical => self.remember_ip(&mut validators, &iter_new),
                    Comparison::Misaligned => {
                        summary.structure_mismatch = true;
                        self.two_inst_message(
                            LogLevel::Error,
                            inst_old,
                            inst_new,
                            "Code modification: instructions length/addresses do not match",
                        );
                        break;
                    }
                    outcome => {
                        summary.instructions_changed += 1;
                        if outcome == Comparison::Rejected {
                            self.two_inst_message(
                                LogLevel::Error,
                                inst_old,
                                inst_new,
                                "Code modification: failed to modify instruction",
                            );
                        }
                        self.apply_validators(&mut validators, &iter_new);
                    }
                }
                if self.quit {
                    break;
                }
                iter_old.advance();
                iter_new.advance();
            }
            if !summary.structure_mismatch && (iter_old.has_next() || iter_new.has_next()) && !self.quit {
                summary.structure_mismatch = true;
                self.message(
                    LogLevel::Error,
                    "Code modification: code segments have different number of instructions",
                );
            }
            self.apply_post_validators(&mut validators);
            self.print_stats(&validators);
        }
        self.apply_halts(new, vbase);
        self.validator = "";

        tracing::debug!(
            valid = self.validates_ok,
            compared = summary.instructions_compared,
            changed = summary.instructions_changed,
            "replacement validated"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    #[test]
    fn identical_bytes() {
        let a = decode_one(&[0x48, 0x89, 0xc3], 0);
        let b = decode_one(&[0x48, 0x89, 0xc3], 0);
        assert_eq!(compare(&a, &b), Comparison::Identical);
    }

    #[test]
    fn patchable_positions() {
        // call rel32 with a different target
        let a = decode_one(&[0xe8, 0x00, 0x00, 0x00, 0x00], 0);
        let b = decode_one(&[0xe8, 0x20, 0x00, 0x00, 0x00], 0);
        assert_eq!(compare(&a, &b), Comparison::Changed);

        // mov eax, imm32
        let a = decode_one(&[0xb8, 0x01, 0x00, 0x00, 0x00], 0);
        let b = decode_one(&[0xb8, 0xef, 0xbe, 0xad, 0xde], 0);
        assert_eq!(compare(&a, &b), Comparison::Changed);

        // mov eax, [r15+0x10] vs [r15+0x20]
        let a = decode_one(&[0x41, 0x8b, 0x47, 0x10], 0);
        let b = decode_one(&[0x41, 0x8b, 0x47, 0x20], 0);
        assert_eq!(compare(&a, &b), Comparison::Changed);
    }

    #[test]
    fn other_changes_are_rejected() {
        // add eax, 1 vs add eax, 2
        let a = decode_one(&[0x83, 0xc0, 0x01], 0);
        let b = decode_one(&[0x83, 0xc0, 0x02], 0);
        assert_eq!(compare(&a, &b), Comparison::Rejected);

        // mov rbx, rax vs mov rcx, rax
        let a = decode_one(&[0x48, 0x89, 0xc3], 0);
        let b = decode_one(&[0x48, 0x89, 0xc1], 0);
        assert_eq!(compare(&a, &b), Comparison::Rejected);

        // jmp rel32 targets may not move
        let a = decode_one(&[0xe9, 0x00, 0x00, 0x00, 0x00], 0);
        let b = decode_one(&[0xe9, 0x20, 0x00, 0x00, 0x00], 0);
        assert_eq!(compare(&a, &b), Comparison::Rejected);
    }

    #[test]
    fn differing_lengths() {
        let a = decode_one(&[0x90], 0);
        let b = decode_one(&[0x89, 0xc0], 0);
        assert_eq!(compare(&a, &b), Comparison::Misaligned);
    }
}
