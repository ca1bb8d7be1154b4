//! Removes instructions the target CPU does not implement.
//!
//! Such an instruction is replaced by halts rather than rejected, and each
//! missing feature is reported once per run.

use crate::core::pattern::{InstType, PatternFlags};
use crate::cpu::CpuFeatures;
use crate::decoder::InstIter;
use crate::validator::registry::InstructionValidator;
use crate::validator::report::LogLevel;
use crate::validator::ValidatorState;

/// Feature an instruction class needs, for the single-feature classes.
fn required_feature(inst_type: InstType) -> Option<CpuFeatures> {
    let feature = match inst_type {
        InstType::X87 => CpuFeatures::X87,
        InstType::Clflush => CpuFeatures::CLFLUSH,
        InstType::Fxsr => CpuFeatures::FXSR,
        InstType::Cmpxchg8b => CpuFeatures::CX8,
        InstType::Cmpxchg16b => CpuFeatures::CX16,
        InstType::Cmov => CpuFeatures::CMOV,
        InstType::Rdtsc => CpuFeatures::TSC,
        InstType::Mmx => CpuFeatures::MMX,
        InstType::Sse => CpuFeatures::SSE,
        InstType::Sse2 => CpuFeatures::SSE2,
        InstType::Sse3 => CpuFeatures::SSE3,
        InstType::Sse4a => CpuFeatures::SSE4A,
        InstType::Sse41 => CpuFeatures::SSE41,
        InstType::Sse42 => CpuFeatures::SSE42,
        InstType::Movbe => CpuFeatures::MOVBE,
        InstType::Popcnt => CpuFeatures::POPCNT,
        InstType::Lzcnt => CpuFeatures::LZCNT,
        InstType::Ssse3 => CpuFeatures::SSSE3,
        InstType::ThreeDNow => CpuFeatures::THREEDNOW,
        InstType::E3DNow => CpuFeatures::E3DNOW,
        _ => return None,
    };
    Some(feature)
}

#[derive(Debug, Default)]
pub struct CpuCheckValidator {
    /// Features already reported missing.
    warned: CpuFeatures,
    warned_cmov_and_x87: bool,
    warned_mmx_or_sse2: bool,
}

impl CpuCheckValidator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstructionValidator for CpuCheckValidator {
    fn name(&self) -> &'static str {
        "cpu_checks"
    }

    fn validate(&mut self, state: &mut ValidatorState, iter: &InstIter<'_>) {
        let inst = iter.current();
        let available = state.cpu_features();
        let mut squash = false;

        let check = |state: &mut ValidatorState, feature: CpuFeatures, warned: &mut CpuFeatures| {
            if available.contains(feature) {
                return false;
            }
            if !warned.contains(feature) {
                state.inst_message(
                    LogLevel::Warning,
                    inst,
                    &format!("Does not support {} feature, removing usage(s).", feature.name()),
                );
                warned.insert(feature);
            }
            true
        };

        match inst.pattern.inst_type {
            InstType::Fcmov => {
                if !available.contains(CpuFeatures::CMOV | CpuFeatures::X87) {
                    if !self.warned_cmov_and_x87 {
                        state.inst_message(
                            LogLevel::Warning,
                            inst,
                            "Does not support CMOV and x87 features, removing corresponding CMOV usage(s).",
                        );
                        self.warned_cmov_and_x87 = true;
                    }
                    squash = true;
                }
            }
            InstType::MmxSse2 => {
                if !available.intersects(CpuFeatures::MMX | CpuFeatures::SSE2) {
                    if !self.warned_mmx_or_sse2 {
                        state.inst_message(
                            LogLevel::Warning,
                            inst,
                            "Does not support MMX or SSE2 features, removing corresponding usage(s).",
                        );
                        self.warned_mmx_or_sse2 = true;
                    }
                    squash = true;
                }
            }
            other => {
                if let Some(feature) = required_feature(other) {
                    squash |= check(state, feature, &mut self.warned);
                }
            }
        }
        if inst.pattern.flags.contains(PatternFlags::LONG_MODE) {
            squash |= check(state, CpuFeatures::LM, &mut self.warned);
        }

        if squash {
            state.squash(inst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use crate::validator::plugins::test_support::{run, state_with};

    fn config(features: CpuFeatures) -> ValidatorConfig {
        ValidatorConfig {
            cpu_features: Some(features),
            ..ValidatorConfig::default()
        }
    }

    // popcnt rax, rbx
    const POPCNT: [u8; 5] = [0xf3, 0x48, 0x0f, 0xb8, 0xc3];

    #[test]
    fn missing_feature_warns_once_and_squashes_all() {
        let code: Vec<u8> = POPCNT.iter().copied().cycle().take(25).collect();
        let (mut state, reporter) = state_with(32, config(CpuFeatures::all() - CpuFeatures::POPCNT));
        let mut validator = CpuCheckValidator::new();
        run(&mut validator, &mut state, &code);

        assert_eq!(
            reporter.count_containing("Does not support POPCNT feature, removing usage(s)."),
            1
        );
        assert_eq!(state.pending_halts().len(), 5);
        assert!(state.is_valid());
    }

    #[test]
    fn present_feature_is_untouched() {
        let (mut state, reporter) = state_with(32, config(CpuFeatures::all()));
        let mut validator = CpuCheckValidator::new();
        run(&mut validator, &mut state, &POPCNT);
        assert!(reporter.diagnostics().is_empty());
        assert!(state.pending_halts().is_empty());
    }

    #[test]
    fn mmx_or_sse2_needs_either() {
        // paddq mm0, mm1
        let code = [0x0f, 0xd4, 0xc1];
        let (mut state, reporter) = state_with(32, config(CpuFeatures::all() - CpuFeatures::SSE2));
        run(&mut CpuCheckValidator::new(), &mut state, &code);
        assert!(state.pending_halts().is_empty());
        assert!(reporter.diagnostics().is_empty());

        let (mut state, reporter) = state_with(
            32,
            config(CpuFeatures::all() - CpuFeatures::SSE2 - CpuFeatures::MMX),
        );
        run(&mut CpuCheckValidator::new(), &mut state, &code);
        assert_eq!(state.pending_halts().len(), 1);
        assert_eq!(reporter.count_containing("MMX or SSE2"), 1);
    }

    #[test]
    fn ordinary_instructions_pass() {
        let (mut state, reporter) = state_with(32, config(CpuFeatures::LM));
        run(&mut CpuCheckValidator::new(), &mut state, &[0x90, 0x4c, 0x01, 0xfc]);
        assert!(reporter.diagnostics().is_empty());
    }
}
