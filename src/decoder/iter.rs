//! Lazy instruction iterator with bounded lookback.
//!
//! The iterator walks a segment one instruction at a time. It keeps the
//! current instruction plus a fixed number of predecessors in a ring of
//! slots; each slot is decoded on first access and cleared when the ring
//! wraps onto it, so only instructions somebody looks at are decoded.

use std::cell::{Cell, RefCell};

use once_cell::unsync::OnceCell;

use super::{DecodeTables, InstDecoder};
use crate::config::DEFAULT_LOOKBACK_DEPTH;
use crate::core::instruction::DecodedInstruction;

struct Slot {
    offset: usize,
    inst: OnceCell<DecodedInstruction>,
}

impl Slot {
    fn at(offset: usize) -> Self {
        Self {
            offset,
            inst: OnceCell::new(),
        }
    }
}

/// Cursor over the instructions of one segment.
pub struct InstIter<'a> {
    memory: &'a [u8],
    vbase: u64,
    decoder: RefCell<InstDecoder>,
    slots: Vec<Slot>,
    /// Ring position of the current instruction.
    index: usize,
    /// Instructions advanced past so far.
    inst_count: usize,
    lookback_depth: usize,
    decodes: Cell<usize>,
}

impl<'a> InstIter<'a> {
    /// Iterator over `memory` mapped at `vbase`, keeping `lookback_depth`
    /// previous instructions reachable.
    pub fn new(
        tables: &'static dyn DecodeTables,
        memory: &'a [u8],
        vbase: u64,
        lookback_depth: usize,
    ) -> Self {
        let slots = (0..=lookback_depth).map(|_| Slot::at(0)).collect();
        Self {
            memory,
            vbase,
            decoder: RefCell::new(InstDecoder::new(tables)),
            slots,
            index: 0,
            inst_count: 0,
            lookback_depth,
            decodes: Cell::new(0),
        }
    }

    /// Iterator over the default 64-bit tables with the default lookback.
    pub fn x86_64(memory: &'a [u8], vbase: u64) -> Self {
        Self::new(&super::X86_64, memory, vbase, DEFAULT_LOOKBACK_DEPTH)
    }

    pub fn vbase(&self) -> u64 {
        self.vbase
    }

    pub fn memory(&self) -> &'a [u8] {
        self.memory
    }

    pub fn lookback_depth(&self) -> usize {
        self.lookback_depth
    }

    /// Offset of the current instruction from the start of the segment.
    pub fn offset(&self) -> usize {
        self.slots[self.index].offset
    }

    /// Address of the current instruction.
    pub fn vpc(&self) -> u64 {
        self.vbase.wrapping_add(self.offset() as u64)
    }

    /// Instructions advanced past so far.
    pub fn position(&self) -> usize {
        self.inst_count
    }

    /// Number of decodes performed. Each instruction is decoded at most once.
    pub fn decoded_count(&self) -> usize {
        self.decodes.get()
    }

    pub fn has_next(&self) -> bool {
        self.offset() < self.memory.len()
    }

    /// The current instruction.
    ///
    /// # Panics
    ///
    /// If the iterator is exhausted.
    pub fn current(&self) -> &DecodedInstruction {
        assert!(self.has_next(), "instruction iterator is exhausted");
        self.slot(self.index)
    }

    /// Move to the next instruction.
    ///
    /// # Panics
    ///
    /// If the iterator is exhausted.
    pub fn advance(&mut self) {
        let next = self.offset() + self.current().length as usize;
        self.inst_count += 1;
        self.index = (self.index + 1) % self.slots.len();
        self.slots[self.index] = Slot::at(next);
    }

    /// True when `distance` instructions back is reachable.
    pub fn has_lookback(&self, distance: usize) -> bool {
        distance <= self.lookback_depth && distance <= self.inst_count
    }

    /// The instruction `distance` positions before the current one.
    /// `lookback(0)` is the current instruction.
    ///
    /// # Panics
    ///
    /// If `distance` is beyond the lookback depth or before the first
    /// instruction; check with [`InstIter::has_lookback`].
    pub fn lookback(&self, distance: usize) -> &DecodedInstruction {
        assert!(
            self.has_lookback(distance),
            "lookback {} out of range (depth {}, position {})",
            distance,
            self.lookback_depth,
            self.inst_count
        );
        if distance == 0 {
            return self.current();
        }
        let len = self.slots.len();
        self.slot((self.index + len - distance) % len)
    }

    pub fn try_lookback(&self, distance: usize) -> Option<&DecodedInstruction> {
        self.has_lookback(distance).then(|| self.lookback(distance))
    }

    fn slot(&self, index: usize) -> &DecodedInstruction {
        let slot = &self.slots[index];
        slot.inst.get_or_init(|| {
            self.decodes.set(self.decodes.get() + 1);
            self.decoder
                .borrow_mut()
                .decode(self.memory, slot.offset, self.vbase)
        })
    }
}
