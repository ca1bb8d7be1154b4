//! Core data types for the validator: decoded instructions, operand
//! expression trees, the opcode pattern table and register helpers.

pub mod expr;
pub mod instruction;
pub mod pattern;
pub mod register;

pub use expr::{ExprFlags, ExprKind, ExprNode, ExprVector};
pub use instruction::{DecodedInstruction, PrefixMask};
pub use pattern::{InstType, Pattern, PatternFlags};
