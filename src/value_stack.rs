//! The runtime value-location tracker: a model of the Wasm operand stack
//! during code generation. Shared, unmodified, between the AMD64 and
//! ARM64 lowering layers (the dynamic-dispatch design note in
//! `SPEC_FULL.md` — only the `isa::Assembler` implementation varies).

use crate::types::{CondFlag, PhysicalRegister, RegisterClass, RuntimeValueType};
use smallvec::SmallVec;
use std::collections::HashSet;

/// A single Wasm operand-stack slot.
///
/// Invariant: at most one of `register`/`cond_flag` is `Some`. If both are
/// `None` the value lives at `stack_pointer` in the VM stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLocation {
    pub value_type: RuntimeValueType,
    /// Index into the virtual VM stack; doubles as the slot's logical depth
    /// from the bottom of the function's operand stack.
    pub stack_pointer: u64,
    pub register: Option<PhysicalRegister>,
    pub cond_flag: Option<CondFlag>,
}

impl ValueLocation {
    /// `true` if the value currently has no physical representation and
    /// must be read from/written to the VM stack at `stack_pointer`.
    pub fn is_on_memory_stack(&self) -> bool {
        self.register.is_none() && self.cond_flag.is_none()
    }
}

/// Tracks, for a single function compilation, the logical Wasm operand
/// stack: per-entry physical placement, the set of registers currently in
/// use, and the high-water mark that drives the prologue's stack-growth
/// check.
#[derive(Debug, Default)]
pub struct ValueLocationStack {
    slots: Vec<ValueLocation>,
    used_registers: HashSet<PhysicalRegister>,
    stack_pointer_ceil: u64,
    has_cond_flag: bool,
}

impl ValueLocationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical depth (number of live slots).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The watermark driving the epilogue's stack-growth check. Monotone
    /// non-decreasing across the function's compilation (spec invariant 4).
    pub fn stack_pointer_ceil(&self) -> u64 {
        self.stack_pointer_ceil
    }

    pub fn used_registers(&self) -> impl Iterator<Item = &PhysicalRegister> {
        self.used_registers.iter()
    }

    fn next_stack_pointer(&self) -> u64 {
        self.slots
            .last()
            .map(|s| s.stack_pointer + 1)
            .unwrap_or(0)
    }

    fn raise_ceil(&mut self) {
        let depth = self.slots.len() as u64;
        if depth > self.stack_pointer_ceil {
            self.stack_pointer_ceil = depth;
        }
    }

    /// Record a new slot held in `reg`. Panics if `reg` is already in use —
    /// that is a lowering-layer bug, not a recoverable condition.
    pub fn push_on_register(&mut self, reg: PhysicalRegister, value_type: RuntimeValueType) {
        assert!(
            self.used_registers.insert(reg),
            "register {reg:?} pushed while already in use"
        );
        let stack_pointer = self.next_stack_pointer();
        self.slots.push(ValueLocation {
            value_type,
            stack_pointer,
            register: Some(reg),
            cond_flag: None,
        });
        self.raise_ceil();
    }

    /// Record a new slot with no physical representation; it is live on the
    /// memory stack. No register state changes.
    pub fn push_on_stack(&mut self, value_type: RuntimeValueType) {
        let stack_pointer = self.next_stack_pointer();
        self.slots.push(ValueLocation {
            value_type,
            stack_pointer,
            register: None,
            cond_flag: None,
        });
        self.raise_ceil();
    }

    /// Record a new I32 slot represented only by CPU flags. The caller must
    /// have already materialized any prior cond-flag slot (invariant 3);
    /// this is asserted here rather than silently overwritten.
    pub fn push_on_cond_flag(&mut self, flag: CondFlag) {
        assert!(
            !self.has_cond_flag,
            "a prior cond-flag slot was not materialized before pushing another"
        );
        let stack_pointer = self.next_stack_pointer();
        self.slots.push(ValueLocation {
            value_type: RuntimeValueType::I32,
            stack_pointer,
            register: None,
            cond_flag: Some(flag),
        });
        self.has_cond_flag = true;
        self.raise_ceil();
    }

    /// Remove and return the top slot. Does *not* alter register usage —
    /// the caller decides whether to free the register or reuse it for the
    /// slot it's about to push.
    pub fn pop(&mut self) -> ValueLocation {
        let loc = self.slots.pop().expect("pop from empty value stack");
        if loc.cond_flag.is_some() {
            self.has_cond_flag = false;
        }
        loc
    }

    pub fn peek(&self) -> &ValueLocation {
        self.slots.last().expect("peek on empty value stack")
    }

    /// `depth` is measured from the top: 0 is the top-of-stack slot.
    pub fn peek_at(&self, depth: usize) -> &ValueLocation {
        let idx = self
            .slots
            .len()
            .checked_sub(depth + 1)
            .expect("peek_at depth beyond stack bottom");
        &self.slots[idx]
    }

    fn peek_at_mut(&mut self, depth: usize) -> &mut ValueLocation {
        let idx = self
            .slots
            .len()
            .checked_sub(depth + 1)
            .expect("peek_at depth beyond stack bottom");
        &mut self.slots[idx]
    }

    /// Mark the slot's register as free and clear both placement fields;
    /// the value becomes "on stack". Caller must have already emitted the
    /// store to memory that makes this true.
    pub fn release_register(&mut self, depth: usize) {
        let slot = self.peek_at_mut(depth);
        if let Some(reg) = slot.register.take() {
            self.used_registers.remove(&reg);
        }
        slot.cond_flag = None;
        if depth == 0 {
            // nothing further; `has_cond_flag` tracked per-pop/push only
            // matters for the top-of-stack convention used by push_on_cond_flag.
        }
    }

    /// Release a register that was allocated as a scratch value and never
    /// associated with any stack slot (e.g. a bounds-check temporary living
    /// only inside one lowering routine).
    pub fn free_scratch_register(&mut self, reg: PhysicalRegister) {
        self.used_registers.remove(&reg);
    }

    /// Return a register of `class` that is neither reserved (the caller
    /// passes only the architecture's unreserved candidate list) nor
    /// currently in `used_registers`. Scans `candidates` in the given
    /// priority order.
    pub fn take_free(&self, candidates: &[PhysicalRegister]) -> Option<PhysicalRegister> {
        candidates
            .iter()
            .copied()
            .find(|r| !self.used_registers.contains(r))
    }

    /// If no free register of `class` exists, choose the slot with the
    /// lowest logical depth (closest to the bottom of the function's
    /// operand stack — the oldest, most likely-stable value) that
    /// currently owns a register of `class`, and return its depth from the
    /// top together with its location. The caller must emit the spill
    /// store and then call [`Self::release_register`].
    pub fn steal(&self, class: RegisterClass) -> Option<(usize, ValueLocation)> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, slot)| {
                slot.register
                    .map(|r| self.class_hint(r) == class)
                    .unwrap_or(false)
            })
            .map(|(idx, slot)| (self.slots.len() - 1 - idx, *slot))
    }

    /// `steal` needs to know a candidate register's class without depending
    /// on an `isa` module (kept architecture-agnostic); callers that need
    /// precise class discipline should filter `steal`'s candidates
    /// themselves via [`crate::isa::Assembler::register_class`]. This hint
    /// assumes vector-class physical ids only ever appear on slots whose
    /// `value_type` already says so, which holds for every push_* path in
    /// this module.
    fn class_hint(&self, reg: PhysicalRegister) -> RegisterClass {
        // Find which slot owns `reg` and trust its value_type.
        self.slots
            .iter()
            .find(|s| s.register == Some(reg))
            .map(|s| s.value_type.register_class())
            .unwrap_or(RegisterClass::GeneralPurpose)
    }

    /// Duplicate the value at `depth` onto the top of the stack. Used by
    /// `Pick`. For V128, the caller must invoke this twice (lo then hi).
    pub fn duplicate_slot_type(&self, depth: usize) -> RuntimeValueType {
        self.peek_at(depth).value_type
    }

    /// Remove the inclusive range `[start, end]` (measured from the top) of
    /// slots, compacting the slots above the range down into the vacated
    /// positions. Returns the removed slots (for the caller to release any
    /// registers they held, when the range abuts the top) along with the
    /// slots that were shifted (for the caller to re-emit their stack
    /// placement if they were memory-resident).
    pub fn drop_range(&mut self, start: usize, end: usize) -> SmallVec<[ValueLocation; 4]> {
        assert!(start <= end, "drop range start must not exceed end");
        let len = self.slots.len();
        let hi = len - 1 - start; // index of the slot closest to the top
        let lo = len - 1 - end; // index of the slot closest to the bottom
        let removed: SmallVec<[ValueLocation; 4]> = self.slots[lo..=hi]
            .iter()
            .copied()
            .inspect(|slot| {
                if let Some(reg) = slot.register {
                    self.used_registers.remove(&reg);
                }
            })
            .collect();
        self.slots.drain(lo..=hi);
        // Renumber stack_pointer for everything above the removed range so
        // it again matches each slot's index.
        for (i, slot) in self.slots.iter_mut().enumerate().skip(lo) {
            slot.stack_pointer = i as u64;
        }
        removed
    }

    /// Overwrite the slot at `depth` with the current top value, then pop
    /// the top. Used by `local.set`/Swap lowering (the caller decides
    /// whether to also push the old value back for a Swap).
    pub fn set(&mut self, depth: usize) -> ValueLocation {
        let top = self.pop();
        let idx = self
            .slots
            .len()
            .checked_sub(depth + 1)
            .expect("set depth beyond stack bottom");
        let old = self.slots[idx];
        if let Some(reg) = old.register {
            self.used_registers.remove(&reg);
        }
        let stack_pointer = self.slots[idx].stack_pointer;
        self.slots[idx] = ValueLocation {
            stack_pointer,
            ..top
        };
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuntimeValueType::*;

    #[test]
    fn push_pop_roundtrip() {
        let mut s = ValueLocationStack::new();
        s.push_on_register(PhysicalRegister::new(2), I32);
        s.push_on_stack(I64);
        assert_eq!(s.len(), 2);
        let top = s.pop();
        assert_eq!(top.value_type, I64);
        assert!(top.is_on_memory_stack());
        assert_eq!(s.len(), 1);
    }

    #[test]
    #[should_panic]
    fn double_push_same_register_panics() {
        let mut s = ValueLocationStack::new();
        s.push_on_register(PhysicalRegister::new(0), I32);
        s.push_on_register(PhysicalRegister::new(0), I32);
    }

    #[test]
    fn ceil_is_monotone() {
        let mut s = ValueLocationStack::new();
        s.push_on_stack(I32);
        s.push_on_stack(I32);
        assert_eq!(s.stack_pointer_ceil(), 2);
        s.pop();
        s.pop();
        assert_eq!(s.stack_pointer_ceil(), 2, "ceil must not decrease on pop");
        s.push_on_stack(I32);
        assert_eq!(s.stack_pointer_ceil(), 2);
    }

    #[test]
    fn take_free_respects_used_set() {
        let mut s = ValueLocationStack::new();
        let candidates = [
            PhysicalRegister::new(0),
            PhysicalRegister::new(1),
            PhysicalRegister::new(2),
        ];
        s.push_on_register(PhysicalRegister::new(0), I32);
        assert_eq!(s.take_free(&candidates), Some(PhysicalRegister::new(1)));
    }

    #[test]
    fn steal_picks_lowest_depth_slot() {
        let mut s = ValueLocationStack::new();
        s.push_on_register(PhysicalRegister::new(0), I32); // bottom
        s.push_on_stack(I32);
        s.push_on_register(PhysicalRegister::new(1), I32); // top
        let (depth, loc) = s.steal(RegisterClass::GeneralPurpose).unwrap();
        assert_eq!(loc.register, Some(PhysicalRegister::new(0)));
        assert_eq!(depth, 2, "bottom slot is depth 2 from the top in a 3-deep stack");
    }

    #[test]
    fn cond_flag_then_materialize_allows_another() {
        let mut s = ValueLocationStack::new();
        s.push_on_cond_flag(CondFlag::Eq);
        let top = s.pop();
        assert_eq!(top.cond_flag, Some(CondFlag::Eq));
        s.push_on_cond_flag(CondFlag::Ne);
    }

    #[test]
    #[should_panic]
    fn double_cond_flag_without_materializing_panics() {
        let mut s = ValueLocationStack::new();
        s.push_on_cond_flag(CondFlag::Eq);
        s.push_on_cond_flag(CondFlag::Ne);
    }

    #[test]
    fn drop_range_compacts_and_renumbers() {
        let mut s = ValueLocationStack::new();
        s.push_on_stack(I32); // depth 3 -> idx 0
        s.push_on_register(PhysicalRegister::new(0), I32); // depth 2 -> idx 1
        s.push_on_stack(I32); // depth 1 -> idx 2
        s.push_on_stack(I32); // depth 0 (top) -> idx 3
        let removed = s.drop_range(1, 2);
        assert_eq!(removed.len(), 2);
        assert_eq!(s.len(), 2);
        assert_eq!(s.peek_at(0).stack_pointer, 1);
        assert!(!s.used_registers().any(|r| *r == PhysicalRegister::new(0)));
    }
}
