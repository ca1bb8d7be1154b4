//! Validator plugins, in the order a run applies them.

pub mod cpu_checks;
pub mod histogram;
pub mod illegal;
pub mod jumps;
pub mod memory_protect;
pub mod protect_base;
pub mod trace;
