//! Register helpers on top of iced-x86's register enumeration.
//!
//! Expression nodes store registers as plain integers; these helpers map
//! them back and relate the 32-bit and 64-bit views of a general purpose
//! register.

use iced_x86::Register;
use once_cell::sync::Lazy;

static REGISTERS: Lazy<Vec<Register>> = Lazy::new(|| Register::values().collect());

const GPR32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// Integer encoding of a register inside an expression node.
pub fn register_value(reg: Register) -> u64 {
    reg as u64
}

/// Inverse of [`register_value`]. Unknown values map to `Register::None`.
pub fn register_from_value(value: u64) -> Register {
    REGISTERS
        .get(value as usize)
        .copied()
        .unwrap_or(Register::None)
}

/// The 64-bit register whose low half is `reg`, if `reg` is a 32-bit GPR.
pub fn reg64_for_32(reg: Register) -> Option<Register> {
    GPR32.iter().position(|r| *r == reg).map(|i| GPR64[i])
}

/// The 32-bit low half of a 64-bit GPR.
pub fn reg32_for_64(reg: Register) -> Option<Register> {
    GPR64.iter().position(|r| *r == reg).map(|i| GPR32[i])
}

/// True for the registers usable as the sandbox base.
pub fn is_valid_base_register(reg: Register) -> bool {
    reg != Register::RSP && reg != Register::RBP && GPR64.contains(&reg)
}

/// True when `reg` is a strict part of the 64-bit register `full`.
pub fn is_subregister_of(reg: Register, full: Register) -> bool {
    reg != full && reg != Register::None && reg.full_register() == full
}

/// Upper-case register name used in diagnostics.
pub fn register_name(reg: Register) -> String {
    format!("{:?}", reg).to_ascii_uppercase()
}

/// Parse a register name such as `"r15"`.
pub fn parse_register(name: &str) -> Option<Register> {
    let wanted = name.trim().to_ascii_uppercase();
    REGISTERS
        .iter()
        .copied()
        .find(|r| *r != Register::None && register_name(*r) == wanted)
}
