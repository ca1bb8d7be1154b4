//! Validator state and the per-instruction dispatcher.
//!
//! A [`ValidatorState`] is created for one code segment. A run builds the
//! registered plugins, walks the segment with an [`InstIter`] applying every
//! plugin to every instruction, runs the plugins' end-of-segment checks and
//! prints statistics. Errors mark the segment unsafe; once as many errors as
//! the budget allows have been printed the run stops early.
//!
//! ```text
//! create -> validate_segment -> is_valid
//!              |- halt trim
//!              |- for each instruction: trace, cpu, illegal, base, memory, jumps, histogram
//!              |- end of segment: base, jumps
//!              `- stats: histogram
//! ```

pub mod address_set;
pub mod halt_trim;
pub mod plugins;
pub mod registry;
pub mod replace;
pub mod report;
pub mod utils;

use iced_x86::Register;

use crate::config::ValidatorConfig;
use crate::core::instruction::{DecodedInstruction, HALT_OPCODE};
use crate::core::register::{is_valid_base_register, register_name};
use crate::cpu::CpuFeatures;
use crate::decoder::{DecodeTables, InstIter, X86_64};
use crate::error::{ErrorBudget, Result, ValidatorError};
use crate::span_trace;

pub use registry::InstructionValidator;
pub use replace::ReplacementSummary;
use report::{LogLevel, Reporter, TracingReporter};

/// Everything the validator knows about one segment.
pub struct ValidatorState {
    config: ValidatorConfig,
    tables: &'static dyn DecodeTables,
    vbase: u64,
    /// Size given to `create`; `vlimit` may shrink below `vbase + size`.
    size: u64,
    vlimit: u64,
    alignment: u8,
    alignment_mask: u64,
    base_register: Register,
    cpu_features: CpuFeatures,
    validates_ok: bool,
    quit: bool,
    budget: ErrorBudget,
    reporter: Box<dyn Reporter>,
    /// Plugin currently running, for diagnostics.
    validator: &'static str,
    /// Instructions other plugins proved may not be jumped to.
    pending_removed: Vec<u64>,
    /// Byte ranges to overwrite with halts once the walk is done.
    pending_halts: Vec<(u64, usize)>,
}

impl ValidatorState {
    /// Create a state for the segment `[vbase, vbase + size)` with bundles
    /// of `alignment` bytes and `base_register` as the sandbox base.
    pub fn create(
        vbase: u64,
        size: u64,
        alignment: u8,
        base_register: Register,
        config: ValidatorConfig,
    ) -> Result<Self> {
        let vlimit = match vbase.checked_add(size) {
            Some(limit) if size > 0 => limit,
            _ => return Err(ValidatorError::InvalidSegmentSize { vbase, size }),
        };
        if alignment != 16 && alignment != 32 {
            return Err(ValidatorError::UnsupportedAlignment(alignment));
        }
        if !is_valid_base_register(base_register) {
            return Err(ValidatorError::InvalidBaseRegister(register_name(
                base_register,
            )));
        }

        let budget = if config.stub_out {
            ErrorBudget::disabled()
        } else {
            ErrorBudget::new(config.max_reported_errors)
        };
        let cpu_features = config.cpu_features.unwrap_or_else(CpuFeatures::detect);

        tracing::debug!(
            vbase = %format_args!("{:x}", vbase),
            vlimit = %format_args!("{:x}", vlimit),
            alignment,
            base = %register_name(base_register),
            %budget,
            "validator state created"
        );

        Ok(Self {
            config,
            tables: &X86_64,
            vbase,
            size,
            vlimit,
            alignment,
            alignment_mask: alignment as u64 - 1,
            base_register,
            cpu_features,
            validates_ok: true,
            quit: false,
            budget,
            reporter: Box::new(TracingReporter),
            validator: "",
            pending_removed: Vec::new(),
            pending_halts: Vec::new(),
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn vbase(&self) -> u64 {
        self.vbase
    }

    /// End of the segment; lowered when trailing halts are trimmed.
    pub fn vlimit(&self) -> u64 {
        self.vlimit
    }

    pub fn alignment(&self) -> u8 {
        self.alignment
    }

    pub fn alignment_mask(&self) -> u64 {
        self.alignment_mask
    }

    pub fn base_register(&self) -> Register {
        self.base_register
    }

    pub fn cpu_features(&self) -> CpuFeatures {
        self.cpu_features
    }

    pub fn budget(&self) -> ErrorBudget {
        self.budget
    }

    /// True while no error has been recorded.
    pub fn is_valid(&self) -> bool {
        self.validates_ok
    }

    /// True once the run should stop.
    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }

    /// Turn stub-out mode on or off. Turning it on disables reporting.
    pub fn set_stub_out(&mut self, on: bool) {
        self.config.stub_out = on;
        if on {
            self.budget = ErrorBudget::disabled();
        }
    }

    pub fn set_max_reported_errors(&mut self, limit: i32) {
        self.budget = ErrorBudget::new(limit);
        self.update_quit();
    }

    /// Names of the plugins a run applies, in order.
    pub fn registered_validators(&self) -> Vec<&'static str> {
        registry::build_validators(self)
            .iter()
            .map(|v| v.name())
            .collect()
    }

    /// Validate `size` bytes of `mbase`, mapped at `vbase`. In stub-out mode
    /// offending instructions in `mbase` are overwritten with halts.
    pub fn validate_segment(&mut self, mbase: &mut [u8], vbase: u64, size: u64) -> Result<()> {
        self.begin_walk(vbase, size)?;
        let memory = segment_slice(mbase, size)?;
        let span = span_trace!(
            "validate_segment",
            vbase = %format_args!("{:x}", vbase),
            size
        );
        let _guard = span.enter();

        let (size, vlimit) =
            halt_trim::trim_segment(memory, vbase, self.alignment as u64, self.vlimit);
        self.vlimit = vlimit;

        let mut validators = registry::build_validators(self);
        {
            let mut iter = InstIter::new(
                self.tables,
                &memory[..size as usize],
                vbase,
                self.config.lookback_depth,
            );
            while iter.has_next() {
                self.apply_validators(&mut validators, &iter);
                if self.quit {
                    break;
                }
                iter.advance();
            }
            self.apply_post_validators(&mut validators);
            self.print_stats(&validators);
        }
        self.apply_halts(memory, vbase);
        self.validator = "";

        tracing::debug!(valid = self.validates_ok, "segment validated");
        Ok(())
    }

    pub(crate) fn apply_validators(
        &mut self,
        validators: &mut [Box<dyn InstructionValidator>],
        iter: &InstIter<'_>,
    ) {
        for validator in validators.iter_mut() {
            self.validator = validator.name();
            validator.validate(self, iter);
            if self.quit {
                return;
            }
        }
    }

    pub(crate) fn apply_post_validators(&mut self, validators: &mut [Box<dyn InstructionValidator>]) {
        if self.quit {
            return;
        }
        for validator in validators.iter_mut() {
            self.validator = validator.name();
            validator.post_validate(self);
            if self.quit {
                return;
            }
        }
    }

    pub(crate) fn remember_ip(
        &mut self,
        validators: &mut [Box<dyn InstructionValidator>],
        iter: &InstIter<'_>,
    ) {
        for validator in validators.iter_mut() {
            self.validator = validator.name();
            validator.remember_ip(self, iter);
        }
    }

    pub(crate) fn print_stats(&mut self, validators: &[Box<dyn InstructionValidator>]) {
        for validator in validators {
            self.validator = validator.name();
            validator.print_stats(self);
        }
    }

    pub(crate) fn tables(&self) -> &'static dyn DecodeTables {
        self.tables
    }

    /// Check a run's segment against the one the state was created for and
    /// drop whatever an earlier run left queued.
    fn begin_walk(&mut self, vbase: u64, size: u64) -> Result<()> {
        if vbase != self.vbase {
            return Err(ValidatorError::VbaseMismatch {
                expected: self.vbase,
                actual: vbase,
            });
        }
        if size != self.size {
            return Err(ValidatorError::CodeSizeMismatch {
                expected: self.size,
                actual: size,
            });
        }
        self.vlimit = self.vbase + self.size;
        self.pending_removed.clear();
        self.pending_halts.clear();
        Ok(())
    }

    fn update_quit(&mut self) {
        self.quit = !self.validates_ok && self.budget.is_exhausted();
    }

    fn record_if_error(&mut self, level: LogLevel) {
        if level.is_error() && !self.config.stub_out {
            self.validates_ok = false;
            self.update_quit();
        }
    }

    fn should_print(&self, level: LogLevel) -> bool {
        !self.budget.is_exhausted() && level <= self.config.log_verbosity
    }

    fn record_error_reported(&mut self, level: LogLevel) {
        if level.is_error() && self.budget.remaining() > 0 && !self.config.stub_out {
            let drained = self.budget.consume();
            self.update_quit();
            if drained {
                self.reporter.message(
                    LogLevel::Info,
                    self.validator,
                    "Error limit reached. Validator quitting!",
                );
            }
        }
    }

    /// Report a message not tied to an address.
    pub fn message(&mut self, level: LogLevel, message: &str) {
        self.record_if_error(level);
        if self.should_print(level) {
            self.reporter.message(level, self.validator, message);
            self.record_error_reported(level);
        }
    }

    /// Report a message about `addr`.
    pub fn address_message(&mut self, level: LogLevel, addr: u64, message: &str) {
        self.record_if_error(level);
        if self.should_print(level) {
            self.reporter
                .address_message(level, self.validator, addr, message);
            self.record_error_reported(level);
        }
    }

    /// Report a message about `inst`, stubbing it out in stub-out mode.
    pub fn inst_message(&mut self, level: LogLevel, inst: &DecodedInstruction, message: &str) {
        self.record_if_error(level);
        if self.should_print(level) {
            self.reporter
                .inst_message(level, self.validator, inst, message);
            self.record_error_reported(level);
        }
        if self.config.stub_out && level.is_error() {
            self.queue_halts(inst);
        }
    }

    /// Report a message about a pair of instructions. In stub-out mode the
    /// second one is stubbed out.
    pub fn two_inst_message(
        &mut self,
        level: LogLevel,
        inst1: &DecodedInstruction,
        inst2: &DecodedInstruction,
        message: &str,
    ) {
        self.record_if_error(level);
        if self.should_print(level) {
            self.reporter
                .two_inst_message(level, self.validator, inst1, inst2, message);
            self.record_error_reported(level);
        }
        if self.config.stub_out && level.is_error() {
            self.queue_halts(inst2);
        }
    }

    /// Overwrite the in-segment bytes of `inst` with halts once the walk ends.
    pub fn squash(&mut self, inst: &DecodedInstruction) {
        self.queue_halts(inst);
    }

    /// Record that `inst` can't be the target of a jump.
    pub fn mark_jump_illegal(&mut self, inst: &DecodedInstruction) {
        self.pending_removed.push(inst.vpc);
    }

    pub(crate) fn take_removed_marks(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_removed)
    }

    /// Byte ranges, as (address, length), queued for halt fill.
    pub(crate) fn pending_halts(&self) -> &[(u64, usize)] {
        &self.pending_halts
    }

    fn queue_halts(&mut self, inst: &DecodedInstruction) {
        self.pending_halts.push((inst.vpc, inst.read_length as usize));
    }

    fn apply_halts(&mut self, memory: &mut [u8], vbase: u64) {
        for (vpc, len) in self.pending_halts.drain(..) {
            let Some(start) = vpc.checked_sub(vbase).map(|s| s as usize) else {
                continue;
            };
            let end = (start + len).min(memory.len());
            if start < end {
                memory[start..end].fill(HALT_OPCODE);
            }
        }
    }
}

fn segment_slice(mbase: &mut [u8], size: u64) -> Result<&mut [u8]> {
    let len = mbase.len() as u64;
    if size > len {
        return Err(ValidatorError::SizeMismatch {
            expected: size,
            actual: len,
        });
    }
    Ok(&mut mbase[..size as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::decoder::decode_one;
    use crate::validator::report::RecordingReporter;

    fn config() -> ValidatorConfig {
        ValidatorConfig {
            cpu_features: Some(CpuFeatures::all()),
            ..ValidatorConfig::default()
        }
    }

    fn state(size: u64) -> (ValidatorState, RecordingReporter) {
        let mut state =
            ValidatorState::create(0, size, 32, Register::R15, config()).expect("state");
        let reporter = RecordingReporter::new();
        state.set_reporter(Box::new(reporter.clone()));
        (state, reporter)
    }

    #[test]
    fn create_rejects_bad_parameters() {
        assert!(matches!(
            ValidatorState::create(0x1000, 0, 32, Register::R15, config()),
            Err(ValidatorError::InvalidSegmentSize { .. })
        ));
        assert!(matches!(
            ValidatorState::create(u64::MAX, 2, 32, Register::R15, config()),
            Err(ValidatorError::InvalidSegmentSize { .. })
        ));
        assert!(matches!(
            ValidatorState::create(0, 64, 8, Register::R15, config()),
            Err(ValidatorError::UnsupportedAlignment(8))
        ));
        assert!(matches!(
            ValidatorState::create(0, 64, 32, Register::RSP, config()),
            Err(ValidatorError::InvalidBaseRegister(_))
        ));
    }

    #[test]
    fn create_sets_fields() {
        let (state, _) = state(64);
        assert_eq!(state.vlimit(), 64);
        assert_eq!(state.alignment_mask(), 31);
        assert!(state.is_valid());
        assert!(!state.should_quit());
        assert_eq!(state.budget().remaining(), 100);
    }

    #[test]
    fn error_budget_stops_the_run() {
        let (mut state, reporter) = state(64);
        state.set_max_reported_errors(2);
        state.message(LogLevel::Error, "first");
        assert!(!state.should_quit());
        state.message(LogLevel::Error, "second");
        assert!(state.should_quit());
        state.message(LogLevel::Error, "third");
        assert!(!state.is_valid());
        assert_eq!(reporter.errors().len(), 2);
        assert_eq!(reporter.count_containing("Error limit reached"), 1);
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let (mut state, reporter) = state(64);
        state.message(LogLevel::Warning, "careful");
        assert!(state.is_valid());
        assert_eq!(reporter.diagnostics().len(), 1);
    }

    #[test]
    fn verbosity_filters_messages() {
        let (mut state, reporter) = state(64);
        state.config.log_verbosity = LogLevel::Error;
        state.message(LogLevel::Info, "chatty");
        state.message(LogLevel::Error, "bad");
        assert_eq!(reporter.diagnostics().len(), 1);
    }

    #[test]
    fn stub_out_keeps_segment_valid() {
        let (mut state, reporter) = state(64);
        state.set_stub_out(true);
        assert!(state.budget().is_exhausted());
        state.message(LogLevel::Error, "fixed");
        assert!(state.is_valid());
        assert!(!state.should_quit());
        assert!(reporter.diagnostics().is_empty());
    }

    #[test]
    fn short_memory_is_rejected() {
        let (mut state, _) = state(64);
        let mut memory = vec![0x90u8; 32];
        assert!(matches!(
            state.validate_segment(&mut memory, 0, 64),
            Err(ValidatorError::SizeMismatch { .. })
        ));
    }

    struct LateFailure;

    impl InstructionValidator for LateFailure {
        fn name(&self) -> &'static str {
            "late_failure"
        }

        fn validate(&mut self, _state: &mut ValidatorState, _iter: &InstIter<'_>) {}

        fn post_validate(&mut self, state: &mut ValidatorState) {
            state.message(LogLevel::Error, "end of segment failure");
        }
    }

    struct Witness(Rc<Cell<bool>>);

    impl InstructionValidator for Witness {
        fn name(&self) -> &'static str {
            "witness"
        }

        fn validate(&mut self, _state: &mut ValidatorState, _iter: &InstIter<'_>) {}

        fn post_validate(&mut self, _state: &mut ValidatorState) {
            self.0.set(true);
        }
    }

    #[test]
    fn post_validation_stops_once_quitting() {
        let (mut state, _) = state(64);
        state.set_max_reported_errors(1);
        let ran = Rc::new(Cell::new(false));
        let mut validators: Vec<Box<dyn InstructionValidator>> =
            vec![Box::new(LateFailure), Box::new(Witness(ran.clone()))];
        state.apply_post_validators(&mut validators);
        assert!(state.should_quit());
        assert!(!ran.get());
    }

    #[test]
    fn run_must_match_created_segment() {
        let (mut state, _) = state(64);
        let mut memory = vec![0x90u8; 64];
        assert!(matches!(
            state.validate_segment(&mut memory, 0x20, 64),
            Err(ValidatorError::VbaseMismatch {
                expected: 0,
                actual: 0x20
            })
        ));
        assert!(matches!(
            state.validate_segment(&mut memory, 0, 32),
            Err(ValidatorError::CodeSizeMismatch {
                expected: 64,
                actual: 32
            })
        ));
        assert!(state.is_valid());
    }

    #[test]
    fn queued_work_does_not_carry_into_a_run() {
        let (mut state, reporter) = state(64);
        state.squash(&decode_one(&[0x90], 0));
        state.mark_jump_illegal(&decode_one(&[0x90], 32));
        let mut memory = vec![0x90u8; 64];
        state.validate_segment(&mut memory, 0, 64).expect("run");
        assert!(state.is_valid(), "{:?}", reporter.diagnostics());
        assert_eq!(memory[0], 0x90);
        assert!(state.pending_halts().is_empty());
    }

    #[test]
    fn default_registration_order() {
        let (state, _) = state(64);
        assert_eq!(
            state.registered_validators(),
            vec!["cpu_checks", "illegal", "protect_base", "memory_protect", "jumps"]
        );
    }
}
