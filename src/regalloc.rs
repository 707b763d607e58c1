//! Register-allocator policy (spec §4.2).
//!
//! The allocator has no state of its own — [`ValueLocationStack`] already
//! owns the one piece of state a policy needs (which physical registers are
//! free) — so this module is a named home for the *policy* the lowering
//! layer's `allocate_register` follows, kept separate from the mechanical
//! free-list/spill bookkeeping in [`crate::value_stack`]. Mirrors how
//! `cranelift-codegen`'s smaller allocator submodules each hold one policy
//! concern rather than a single monolithic allocator type.

use crate::types::RegisterClass;
use crate::value_stack::{ValueLocation, ValueLocationStack};

/// Stateless policy object: given the current stack, decide which register
/// a request for `class` should get, preferring a genuinely free register
/// and falling back to a spill victim.
pub struct RegisterAllocator;

/// The outcome of a register request: either a register that was already
/// free, or a slot that must be spilled to the VM stack before its register
/// can be reused.
pub enum Allocation {
    Free(crate::types::PhysicalRegister),
    Spill { depth: usize, victim: ValueLocation },
}

impl RegisterAllocator {
    /// Free-list-first, lowest-depth-spill-second: the baseline-compiler
    /// policy used throughout `lower/`. Lowest depth is preferred as the
    /// spill victim because it was pushed earliest and is least likely to
    /// be read again before the next branch forces a full reconciliation
    /// anyway (spec §4.2).
    pub fn choose(
        stack: &ValueLocationStack,
        class: RegisterClass,
        candidates: &'static [crate::types::PhysicalRegister],
    ) -> Option<Allocation> {
        if let Some(reg) = stack.take_free(candidates) {
            return Some(Allocation::Free(reg));
        }
        stack
            .steal(class)
            .map(|(depth, victim)| Allocation::Spill { depth, victim })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;
    use crate::isa::Assembler;
    use crate::types::RuntimeValueType;

    #[test]
    fn prefers_free_register_over_spill() {
        let mut stack = ValueLocationStack::new();
        stack.push_on_register(crate::types::PhysicalRegister::new(0), RuntimeValueType::I32);
        let candidates = Amd64Assembler::unreserved_registers(RegisterClass::GeneralPurpose);
        match RegisterAllocator::choose(&stack, RegisterClass::GeneralPurpose, candidates) {
            Some(Allocation::Free(_)) => {}
            _ => panic!("expected a free register"),
        }
    }
}
