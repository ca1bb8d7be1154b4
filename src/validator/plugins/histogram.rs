//! Histogram of the first opcode byte of every valid instruction.

use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::ValidatorState;

const ENTRIES_PER_LINE: usize = 4;

#[derive(Debug, Clone)]
pub struct OpcodeHistogram {
    counts: [u32; 256],
}

impl Default for OpcodeHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl OpcodeHistogram {
    pub fn new() -> Self {
        Self { counts: [0; 256] }
    }

    pub fn count(&self, opcode: u8) -> u32 {
        self.counts[opcode as usize]
    }

    /// Report lines, `count\t0xNN\t` per opcode, four opcodes a line.
    pub fn lines(&self) -> Vec<String> {
        let entries: Vec<String> = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(opcode, count)| format!("{}\t0x{:02x}\t", count, opcode))
            .collect();
        entries
            .chunks(ENTRIES_PER_LINE)
            .map(|chunk| chunk.concat())
            .collect()
    }
}

impl InstructionValidator for OpcodeHistogram {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn validate(&mut self, _state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        if inst.is_valid() && inst.num_opcode_bytes > 0 {
            self.counts[inst.opcode_byte() as usize] += 1;
        }
    }

    fn print_stats(&self, state: &mut ValidatorState) {
        state.message(LogLevel::Info, "Opcode Histogram:");
        for line in self.lines() {
            state.message(LogLevel::Info, &line);
        }
    }
}
