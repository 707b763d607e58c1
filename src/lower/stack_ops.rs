//! §4.3.3 Pure stack-shape operations: `Pick`, `Drop`, `Select`, `Set`,
//! `Swap`. None of these touch the memory stack directly except through
//! the register materialization `ensure_on_register` already performs.

use super::CodeGen;
use crate::error::CompileError;
use crate::isa::{Assembler, OperandSize};
use crate::value_stack::ValueLocation;

impl<A: Assembler> CodeGen<A> {
    /// `Pick`: duplicate the slot at `depth` onto the top. `is_v128` picks
    /// both halves (hi then lo, preserving the lo-first-on-stack
    /// convention) so the duplicated pair lands adjacent on top.
    pub fn lower_pick(&mut self, depth: u32, is_v128: bool) -> Result<(), CompileError> {
        if is_v128 {
            // The source pair sits at (depth, depth+1) as (hi, lo) reading
            // top-down from `peek_at`, so duplicate lo first to preserve
            // ordering once both are pushed.
            self.duplicate_one(depth as usize + 1)?;
            self.duplicate_one(depth as usize + 1)?;
        } else {
            self.duplicate_one(depth as usize)?;
        }
        Ok(())
    }

    fn duplicate_one(&mut self, depth: usize) -> Result<(), CompileError> {
        let reg = self.ensure_on_register(depth)?;
        let ty = self.stack.peek_at(depth).value_type;
        let class = ty.register_class();
        let dst = self.allocate_register(class)?;
        self.asm.mov_reg(dst, reg, OperandSize::S64);
        self.stack.push_on_register(dst, ty);
        Ok(())
    }

    /// `Drop { start, end }`: remove the inclusive depth range, releasing
    /// any registers the dropped slots held. Slots above the range keep
    /// their placement; `drop_range` already renumbers their
    /// `stack_pointer`s.
    pub fn lower_drop(&mut self, start: u32, end: u32) -> Result<(), CompileError> {
        self.stack.drop_range(start as usize, end as usize);
        Ok(())
    }

    /// `Select`: materialize the condition, then conditionally move the
    /// second operand into the first's register (or vice versa) — here
    /// modeled as a compare-and-branch since the `Assembler` trait doesn't
    /// expose a dedicated conditional-move primitive.
    pub fn lower_select(&mut self) -> Result<(), CompileError> {
        let cond_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.release_on_use(cond_reg);

        let b_reg = self.ensure_on_register(0)?;
        let a_reg = self.ensure_on_register(1)?;
        let a_loc = *self.stack.peek_at(1);
        self.stack.pop();
        self.stack.pop();

        self.asm.cmp_zero(cond_reg, OperandSize::S32);
        let take_b = self.asm.new_label();
        let done = self.asm.new_label();
        self.asm.jump_if(crate::types::CondFlag::Eq, take_b);
        self.asm.mov_reg(a_reg, a_reg, OperandSize::S64);
        self.asm.jump(done);
        self.asm.bind_label(take_b);
        self.asm.mov_reg(a_reg, b_reg, OperandSize::S64);
        self.asm.bind_label(done);

        self.release_on_use(b_reg);
        self.stack.push_on_register(a_reg, a_loc.value_type);
        Ok(())
    }

    /// `Set { depth, is_v128 }`: `local.set`-style overwrite of the slot at
    /// `depth` with the current top, consuming the top. `depth` is counted
    /// among the slots *below* the value being written — 0 is the slot
    /// immediately under the top, matching [`ValueLocationStack::set`]'s
    /// own convention.
    pub fn lower_set(&mut self, depth: u32, is_v128: bool) -> Result<(), CompileError> {
        if is_v128 {
            // Each inner `set` call pops its own top and indexes the
            // resulting (shorter) array, so reusing the same `depth` for
            // both halves is what lands them on two adjacent slots — the
            // first call targets the pair's hi slot, the second (now that
            // the hi half has been consumed off the top) its lo slot.
            self.stack.set(depth as usize);
            self.stack.set(depth as usize);
        } else {
            self.stack.set(depth as usize);
        }
        Ok(())
    }

    /// `Swap { depth, is_v128 }`: like `Set`, but the old value at `depth`
    /// is pushed back on top instead of discarded.
    pub fn lower_swap(&mut self, depth: u32, is_v128: bool) -> Result<(), CompileError> {
        let widths = if is_v128 { 2 } else { 1 };
        let mut olds = Vec::with_capacity(widths);
        for _ in 0..widths {
            let old: ValueLocation = self.stack.set(depth as usize);
            olds.push(old);
        }
        for old in olds.into_iter().rev() {
            self.push_existing(old);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;
    use crate::types::RuntimeValueType::*;

    #[test]
    fn pick_duplicates_onto_top() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(I32, 7).unwrap();
        cg.lower_pick(0, false).unwrap();
        assert_eq!(cg.stack.len(), 2);
    }

    #[test]
    fn drop_range_shrinks_stack() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(I32, 1).unwrap();
        cg.lower_const(I32, 2).unwrap();
        cg.lower_drop(0, 0).unwrap();
        assert_eq!(cg.stack.len(), 1);
    }

    #[test]
    fn swap_restores_old_value_on_top() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(I32, 1).unwrap();
        cg.lower_const(I32, 2).unwrap();
        cg.lower_const(I32, 3).unwrap();
        cg.lower_swap(1, false).unwrap();
        assert_eq!(cg.stack.len(), 3);
    }
}
