//! Instruction tracing for debugging the validator itself.
//!
//! Output goes to `tracing` under the `sfi_validator::trace` target, so it
//! can be enabled with `RUST_LOG=sfi_validator::trace=info`.

use crate::core::instruction::DecodedInstruction;
use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::ValidatorState;

#[derive(Debug, Default, Clone, Copy)]
pub struct InstTracer {
    instructions: bool,
    internals: bool,
}

impl InstTracer {
    pub fn new(instructions: bool, internals: bool) -> Self {
        Self {
            instructions,
            internals,
        }
    }

    /// Trace lines for `inst`.
    pub fn render(&self, inst: &DecodedInstruction) -> Vec<String> {
        let mut lines = Vec::new();
        if self.instructions {
            lines.push(format!("-> visit: {}", inst));
        }
        if self.internals {
            lines.push(format!("{}", inst.exprs));
        }
        lines
    }
}

impl InstructionValidator for InstTracer {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn validate(&mut self, _state: &mut ValidatorState, iter: &InstIter<'_>) {
        for line in self.render(iter.current()) {
            tracing::info!(target: "sfi_validator::trace", "{}", line);
        }
    }

    fn post_validate(&mut self, _state: &mut ValidatorState) {
        tracing::info!(target: "sfi_validator::trace", "<- visit");
    }
}
