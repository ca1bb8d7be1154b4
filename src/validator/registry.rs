//! Validator plugin interface and registration order.

use crate::decoder::InstIter;

use super::plugins::{
    cpu_checks::CpuCheckValidator, histogram::OpcodeHistogram, illegal::IllegalInstValidator,
    jumps::JumpValidator, memory_protect::MemoryValidator, protect_base::BaseRegisterValidator,
    trace::InstTracer,
};
use super::ValidatorState;

/// A check applied to every instruction of a segment.
///
/// A fresh instance is built for each run, so per-run data lives in the
/// implementing struct.
pub trait InstructionValidator {
    fn name(&self) -> &'static str;

    /// Check the current instruction of `iter`.
    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>);

    /// Checks that need the whole segment. Skipped when the run quit early.
    fn post_validate(&mut self, _state: &mut ValidatorState) {}

    /// Note the current instruction without checking it. Used for
    /// instructions a replacement leaves unchanged.
    fn remember_ip(&mut self, _state: &mut ValidatorState, _iter: &InstIter<'_>) {}

    fn print_stats(&self, _state: &mut ValidatorState) {}
}

/// Plugins for a run over `state`, in application order.
pub fn build_validators(state: &ValidatorState) -> Vec<Box<dyn InstructionValidator>> {
    let config = state.config();
    let mut validators: Vec<Box<dyn InstructionValidator>> = Vec::new();
    if config.tracing_enabled() {
        validators.push(Box::new(InstTracer::new(
            config.trace_instructions,
            config.trace_inst_internals,
        )));
    }
    validators.push(Box::new(CpuCheckValidator::new()));
    validators.push(Box::new(IllegalInstValidator));
    validators.push(Box::new(BaseRegisterValidator::new()));
    validators.push(Box::new(MemoryValidator));
    validators.push(Box::new(JumpValidator::new(state.vbase(), state.vlimit())));
    if config.opcode_histogram {
        validators.push(Box::new(OpcodeHistogram::new()));
    }
    let names: Vec<&str> = validators.iter().map(|v| v.name()).collect();
    tracing::trace!(plugins = ?names, "validators registered");
    validators
}
