//! Operand expression trees.
//!
//! The operands of a decoded instruction are a forest of small trees stored
//! flattened in preorder. Each node kind has a fixed number of kids, so the
//! structure (parents, kid positions, subtree widths) is recovered from the
//! kinds alone and the vector needs no child pointers.
//!
//! ```text
//! mov [r15+rax*1+0x10], ecx
//!
//! [0] OperandReference           [1] MemOffset
//! [2]   Register R15             [3]   Register RAX
//! [4]   Constant 1               [5]   Constant 0x10
//! [6] OperandReference           [7] Register ECX
//! ```

use std::fmt;

use bitflags::bitflags;
use iced_x86::Register;
use serde::{Deserialize, Serialize};

use super::register::{register_from_value, register_name, register_value};

/// Node capacity of one instruction's expression vector.
pub const MAX_EXPR_NODES: usize = 30;

/// Kind of an expression node. The kind fixes the number of kids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExprKind {
    /// Root of one operand; one kid.
    OperandReference,
    /// Register leaf.
    Register,
    /// 32-bit constant leaf.
    Constant,
    /// 64-bit constant as (low, high) 32-bit constant kids.
    Constant64,
    /// `base + index*scale + disp` with four kids in that order.
    MemOffset,
    /// Segment register kid and an address kid.
    SegmentAddress,
    /// Operand form the decoder cannot describe; leaf.
    Undefined,
}

impl ExprKind {
    /// Number of kids a node of this kind owns.
    pub fn rank(self) -> usize {
        match self {
            ExprKind::OperandReference => 1,
            ExprKind::Constant64 | ExprKind::SegmentAddress => 2,
            ExprKind::MemOffset => 4,
            ExprKind::Register | ExprKind::Constant | ExprKind::Undefined => 0,
        }
    }
}

bitflags! {
    /// Annotations attached to an expression node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ExprFlags: u16 {
        /// Value is written.
        const SET = 1 << 0;
        /// Value is read.
        const USED = 1 << 1;
        /// Memory operand whose address is computed but not dereferenced.
        const ADDRESS = 1 << 2;
        /// Value is a control flow target.
        const JUMP_TARGET = 1 << 3;
        /// Operand not written in the instruction text.
        const IMPLICIT = 1 << 4;
        const SIZE8 = 1 << 5;
        const SIZE16 = 1 << 6;
        const SIZE32 = 1 << 7;
        const SIZE64 = 1 << 8;
    }
}

impl ExprFlags {
    /// Size flag for a width in bytes; no flag for other widths.
    pub fn for_size(bytes: usize) -> ExprFlags {
        match bytes {
            1 => ExprFlags::SIZE8,
            2 => ExprFlags::SIZE16,
            4 => ExprFlags::SIZE32,
            8 => ExprFlags::SIZE64,
            _ => ExprFlags::empty(),
        }
    }
}

/// One node of an expression vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub value: u64,
    pub flags: ExprFlags,
}

impl ExprNode {
    pub const EMPTY: ExprNode = ExprNode {
        kind: ExprKind::Undefined,
        value: 0,
        flags: ExprFlags::empty(),
    };

    pub fn new(kind: ExprKind, value: u64, flags: ExprFlags) -> Self {
        Self { kind, value, flags }
    }

    /// The register a `Register` node names, `Register::None` otherwise.
    pub fn register(&self) -> Register {
        if self.kind == ExprKind::Register {
            register_from_value(self.value)
        } else {
            Register::None
        }
    }

    pub fn is_register(&self, reg: Register) -> bool {
        self.kind == ExprKind::Register && self.register() == reg
    }

    pub fn has(&self, flags: ExprFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// The expression vector was full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprOverflow;

/// Fixed-capacity preorder vector of expression nodes.
#[derive(Clone, PartialEq, Eq)]
pub struct ExprVector {
    nodes: [ExprNode; MAX_EXPR_NODES],
    len: usize,
}

impl Default for ExprVector {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprVector {
    pub fn new() -> Self {
        Self {
            nodes: [ExprNode::EMPTY; MAX_EXPR_NODES],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nodes(&self) -> &[ExprNode] {
        &self.nodes[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExprNode> {
        self.nodes().iter()
    }

    /// Append a node, returning its index.
    pub fn push(
        &mut self,
        kind: ExprKind,
        value: u64,
        flags: ExprFlags,
    ) -> Result<usize, ExprOverflow> {
        if self.len == MAX_EXPR_NODES {
            return Err(ExprOverflow);
        }
        self.nodes[self.len] = ExprNode::new(kind, value, flags);
        self.len += 1;
        Ok(self.len - 1)
    }

    pub fn push_register(&mut self, reg: Register, flags: ExprFlags) -> Result<usize, ExprOverflow> {
        self.push(ExprKind::Register, register_value(reg), flags)
    }

    /// Append a constant, split into a `Constant64` subtree when it does not
    /// fit in 32 bits.
    pub fn push_constant(&mut self, value: u64, flags: ExprFlags) -> Result<usize, ExprOverflow> {
        if value <= u32::MAX as u64 {
            return self.push(ExprKind::Constant, value, flags);
        }
        let index = self.push(ExprKind::Constant64, value, flags)?;
        self.push(ExprKind::Constant, value & 0xffff_ffff, ExprFlags::empty())?;
        self.push(ExprKind::Constant, value >> 32, ExprFlags::empty())?;
        Ok(index)
    }

    pub fn add_flags(&mut self, index: usize, flags: ExprFlags) {
        if index < self.len {
            self.nodes[index].flags |= flags;
        }
    }

    /// Drop every node from `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Number of nodes in the subtree rooted at `index`.
    pub fn width(&self, index: usize) -> usize {
        let mut count = 1;
        let mut next = index + 1;
        for _ in 0..self[index].kind.rank() {
            let w = self.width(next);
            count += w;
            next += w;
        }
        count
    }

    /// Index of kid `n` of the node at `index`.
    pub fn kid_index(&self, index: usize, n: usize) -> usize {
        let mut next = index + 1;
        for _ in 0..n {
            next += self.width(next);
        }
        next
    }

    /// Position of the node at `index` among its parent's kids.
    pub fn kid_position(&self, index: usize) -> Option<usize> {
        let parent = self.parent_index(index)?;
        (0..self[parent].kind.rank()).find(|n| self.kid_index(parent, *n) == index)
    }

    /// Index of the parent of `index`, `None` for roots.
    pub fn parent_index(&self, index: usize) -> Option<usize> {
        (0..index)
            .rev()
            .find(|&j| self[j].kind.rank() > 0 && j + self.width(j) > index)
    }

    /// Index of the `n`-th (1-based) node of `kind`, or `len()` if there is
    /// no such node.
    pub fn nth_kind(&self, kind: ExprKind, n: usize) -> usize {
        let mut seen = 0;
        for (i, node) in self.iter().enumerate() {
            if node.kind == kind {
                seen += 1;
                if seen == n {
                    return i;
                }
            }
        }
        self.len
    }

    /// Count of operand roots.
    pub fn operand_count(&self) -> usize {
        self.iter()
            .filter(|n| n.kind == ExprKind::OperandReference)
            .count()
    }

    /// The register at `index`, `Register::None` if the node is not a register.
    pub fn register(&self, index: usize) -> Register {
        self.nodes().get(index).map_or(Register::None, |n| n.register())
    }

    /// Value of a `Constant` or `Constant64` node.
    pub fn constant(&self, index: usize) -> Option<u64> {
        let node = self.nodes().get(index)?;
        match node.kind {
            ExprKind::Constant => Some(node.value),
            ExprKind::Constant64 => {
                let lo = self.nodes().get(index + 1)?.value;
                let hi = self.nodes().get(index + 2)?.value;
                Some(lo | (hi << 32))
            }
            _ => None,
        }
    }
}

impl std::ops::Index<usize> for ExprVector {
    type Output = ExprNode;

    fn index(&self, index: usize) -> &ExprNode {
        &self.nodes()[index]
    }
}

impl fmt::Debug for ExprVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl fmt::Display for ExprVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.iter().enumerate() {
            let depth = std::iter::successors(self.parent_index(i), |p| self.parent_index(*p)).count();
            write!(f, "{:2}: {:indent$}{:?}", i, "", node.kind, indent = depth * 2)?;
            match node.kind {
                ExprKind::Register => write!(f, " {}", register_name(node.register()))?,
                ExprKind::Constant | ExprKind::Constant64 => write!(f, " {:#x}", node.value)?,
                _ => {}
            }
            if !node.flags.is_empty() {
                write!(f, " {:?}", node.flags)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
