//! CPU feature sets.
//!
//! The CPU check removes instructions the executing processor does not
//! implement. The feature set either comes from the configuration or is
//! probed from the host with CPUID.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Instruction set extensions known to the CPU check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CpuFeatures: u32 {
        const X87 = 1 << 0;
        const CMOV = 1 << 1;
        const MMX = 1 << 2;
        const SSE = 1 << 3;
        const SSE2 = 1 << 4;
        const SSE3 = 1 << 5;
        const SSSE3 = 1 << 6;
        const SSE41 = 1 << 7;
        const SSE42 = 1 << 8;
        const SSE4A = 1 << 9;
        const MOVBE = 1 << 10;
        const POPCNT = 1 << 11;
        const LZCNT = 1 << 12;
        const CX8 = 1 << 13;
        const CX16 = 1 << 14;
        const TSC = 1 << 15;
        const CLFLUSH = 1 << 16;
        const FXSR = 1 << 17;
        const THREEDNOW = 1 << 18;
        const E3DNOW = 1 << 19;
        /// Long mode.
        const LM = 1 << 20;
    }
}

const FEATURE_NAMES: [(CpuFeatures, &str); 21] = [
    (CpuFeatures::X87, "x87"),
    (CpuFeatures::CMOV, "CMOV"),
    (CpuFeatures::MMX, "MMX"),
    (CpuFeatures::SSE, "SSE"),
    (CpuFeatures::SSE2, "SSE2"),
    (CpuFeatures::SSE3, "SSE3"),
    (CpuFeatures::SSSE3, "SSSE3"),
    (CpuFeatures::SSE41, "SSE41"),
    (CpuFeatures::SSE42, "SSE42"),
    (CpuFeatures::SSE4A, "SSE4A"),
    (CpuFeatures::MOVBE, "MOVBE"),
    (CpuFeatures::POPCNT, "POPCNT"),
    (CpuFeatures::LZCNT, "LZCNT"),
    (CpuFeatures::CX8, "CX8"),
    (CpuFeatures::CX16, "CX16"),
    (CpuFeatures::TSC, "TSC"),
    (CpuFeatures::CLFLUSH, "CLFLUSH"),
    (CpuFeatures::FXSR, "FXSR"),
    (CpuFeatures::THREEDNOW, "3DNOW"),
    (CpuFeatures::E3DNOW, "E3DNOW"),
    (CpuFeatures::LM, "LM"),
];

impl CpuFeatures {
    /// Feature name as printed in diagnostics.
    pub fn name(self) -> &'static str {
        FEATURE_NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map_or("unknown", |(_, name)| *name)
    }

    /// Features of the host processor.
    pub fn detect() -> CpuFeatures {
        detect_host()
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_host() -> CpuFeatures {
    use std::arch::x86_64::__cpuid;

    let mut features = CpuFeatures::empty();
    let bit = |reg: u32, n: u32| reg & (1 << n) != 0;

    let leaf1 = unsafe { __cpuid(1) };
    for (n, flag) in [
        (0, CpuFeatures::X87),
        (4, CpuFeatures::TSC),
        (8, CpuFeatures::CX8),
        (15, CpuFeatures::CMOV),
        (19, CpuFeatures::CLFLUSH),
        (23, CpuFeatures::MMX),
        (24, CpuFeatures::FXSR),
        (25, CpuFeatures::SSE),
        (26, CpuFeatures::SSE2),
    ] {
        if bit(leaf1.edx, n) {
            features |= flag;
        }
    }
    for (n, flag) in [
        (0, CpuFeatures::SSE3),
        (9, CpuFeatures::SSSE3),
        (13, CpuFeatures::CX16),
        (19, CpuFeatures::SSE41),
        (20, CpuFeatures::SSE42),
        (22, CpuFeatures::MOVBE),
        (23, CpuFeatures::POPCNT),
    ] {
        if bit(leaf1.ecx, n) {
            features |= flag;
        }
    }

    let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_extended >= 0x8000_0001 {
        let ext = unsafe { __cpuid(0x8000_0001) };
        for (n, flag) in [
            (29, CpuFeatures::LM),
            (30, CpuFeatures::E3DNOW),
            (31, CpuFeatures::THREEDNOW),
        ] {
            if bit(ext.edx, n) {
                features |= flag;
            }
        }
        for (n, flag) in [(5, CpuFeatures::LZCNT), (6, CpuFeatures::SSE4A)] {
            if bit(ext.ecx, n) {
                features |= flag;
            }
        }
    }
    features
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_host() -> CpuFeatures {
    CpuFeatures::empty()
}
