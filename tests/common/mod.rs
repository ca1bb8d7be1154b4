//! Shared helpers for the integration tests.

#![allow(dead_code)]

use iced_x86::Register;
use sfi_validator::{CpuFeatures, RecordingReporter, ValidatorConfig, ValidatorState};

/// Default segment base used by the tests.
pub const VBASE: u64 = 0x2_0000;

/// Bundle size used by the tests.
pub const ALIGNMENT: u8 = 32;

pub const NOP: u8 = 0x90;
pub const HLT: u8 = 0xf4;

/// Configuration with every CPU feature enabled, so results don't depend
/// on the host.
pub fn config() -> ValidatorConfig {
    ValidatorConfig {
        cpu_features: Some(CpuFeatures::all()),
        ..ValidatorConfig::default()
    }
}

/// `code` followed by `fill` bytes up to `size`.
pub fn segment(code: &[u8], size: usize, fill: u8) -> Vec<u8> {
    assert!(code.len() <= size, "code does not fit the segment");
    let mut bytes = code.to_vec();
    bytes.resize(size, fill);
    bytes
}

/// State over `[VBASE, VBASE + size)` reporting into the returned recorder.
pub fn state_with(size: u64, config: ValidatorConfig) -> (ValidatorState, RecordingReporter) {
    let mut state = ValidatorState::create(VBASE, size, ALIGNMENT, Register::R15, config)
        .expect("validator state");
    let reporter = RecordingReporter::new();
    state.set_reporter(Box::new(reporter.clone()));
    (state, reporter)
}

/// Validate `memory` as a whole segment at `VBASE`.
pub fn validate(memory: &mut [u8], config: ValidatorConfig) -> (ValidatorState, RecordingReporter) {
    let size = memory.len() as u64;
    let (mut state, reporter) = state_with(size, config);
    state
        .validate_segment(memory, VBASE, size)
        .expect("segment validation runs");
    (state, reporter)
}

pub fn error_messages(reporter: &RecordingReporter) -> Vec<String> {
    reporter.errors().into_iter().map(|d| d.message).collect()
}

/// Encoding of the masked indirect jump through r11 for 32-byte bundles.
pub fn masked_jump_r11() -> Vec<u8> {
    vec![
        0x41, 0x83, 0xe3, 0xe0, // and r11d, 0xe0
        0x4f, 0x8d, 0x1c, 0x1f, // lea r11, [r15+r11*1]
        0x41, 0xff, 0xe3, // jmp r11
    ]
}
