//! §4.3.5 Structured control flow: labels, branches, calls, and the
//! prologue/epilogue halves of the cooperative-exit protocol.

use super::CodeGen;
use crate::call_engine::{offsets, NativeCallStatusCode};
use crate::error::CompileError;
use crate::ir::Label;
use crate::isa::{Assembler, OperandSize, RegImm};
use crate::types::{CondFlag, RegisterClass};

impl<A: Assembler> CodeGen<A> {
    /// `Br { target }`: spill every register-resident value so the target
    /// label's expected (memory-resident) stack shape holds, then jump
    /// unconditionally. Returns to the caller whether this makes the
    /// immediately following code dead.
    pub fn lower_br(&mut self, target: Label) -> Result<(), CompileError> {
        self.spill_all_for_branch();
        self.mark_referenced(target);
        let label = self.asm_label_for(target);
        self.asm.jump(label);
        self.note_unconditional_exit();
        Ok(())
    }

    /// `BrIf { then_target, else_target }`: the condition is always
    /// resolved to CPU flags first (if not already there from a prior
    /// `Compare`), then both arms are ordinary jumps — there is no
    /// fallthrough-vs-explicit-target asymmetry at this layer.
    pub fn lower_br_if(&mut self, then_target: Label, else_target: Label) -> Result<(), CompileError> {
        let (cond, materialized_reg) = self.resolve_as_cond_flag()?;
        self.stack.pop();
        if let Some(reg) = materialized_reg {
            self.release_on_use(reg);
        }
        self.spill_all_for_branch();
        self.mark_referenced(then_target);
        self.mark_referenced(else_target);
        let then_label = self.asm_label_for(then_target);
        let else_label = self.asm_label_for(else_target);
        self.asm.jump_if(cond, then_label);
        self.asm.jump(else_label);
        self.note_unconditional_exit();
        Ok(())
    }

    pub fn lower_br_table(&mut self, targets: &[Label], default: Label) -> Result<(), CompileError> {
        let index_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.spill_all_for_branch();
        self.mark_referenced(default);
        for t in targets {
            self.mark_referenced(*t);
        }
        let asm_targets: Vec<_> = targets.iter().map(|t| self.asm_label_for(*t)).collect();
        let default_label = self.asm_label_for(default);
        self.asm.jump_table(index_reg, &asm_targets, default_label);
        self.release_on_use(index_reg);
        self.note_unconditional_exit();
        Ok(())
    }

    /// `Call { func_index }`: direct call through the module's function
    /// table. The callee observes the same `CallEngine` pointer; no extra
    /// argument marshalling happens here because Wasm arguments are
    /// already where the callee's own prologue expects them (the shared
    /// VM stack).
    pub fn lower_call(&mut self, func_index: u32) -> Result<(), CompileError> {
        self.spill_all_for_branch();
        self.asm.call_direct(func_index);
        Ok(())
    }

    /// `CallIndirect { type_index, table_index }`: bounds-check the popped
    /// runtime element index against the table's reference count, load the
    /// callee pointer from that element (each table entry is a
    /// `{function_pointer, type_id}` pair), trap on a null reference, check
    /// its recorded type id against `type_index`, and call through.
    pub fn lower_call_indirect(&mut self, type_index: u32, table_index: u32) -> Result<(), CompileError> {
        let elem_index_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.spill_all_for_branch();

        let table_len_reg = self.allocate_register(RegisterClass::GeneralPurpose)?;
        self.asm.load(
            table_len_reg,
            A::memory_base_register(),
            offsets::TABLES_LENGTH_BASE as i32 + (table_index as i32 * 8),
            OperandSize::S64,
        );
        self.asm.cmp(elem_index_reg, RegImm::Reg(table_len_reg), OperandSize::S64);
        self.stack.free_scratch_register(table_len_reg);
        let in_bounds = self.asm.new_label();
        self.asm.jump_if(CondFlag::Lo, in_bounds);
        self.asm.trap_exit(NativeCallStatusCode::InvalidTableAccess as u32);
        self.asm.bind_label(in_bounds);

        let table_base = self.allocate_register(RegisterClass::GeneralPurpose)?;
        self.asm.load(
            table_base,
            A::memory_base_register(),
            offsets::TABLES_BASE as i32 + (table_index as i32 * 8),
            OperandSize::S64,
        );
        // Scale the runtime index to the entry's byte offset (16 bytes per
        // `{function_pointer, type_id}` pair) and rebase onto it.
        self.asm.mul(elem_index_reg, elem_index_reg, RegImm::Imm(16), OperandSize::S64);
        self.asm.add(table_base, table_base, RegImm::Reg(elem_index_reg), OperandSize::S64);

        let callee = self.allocate_register(RegisterClass::GeneralPurpose)?;
        self.asm.load(callee, table_base, 0, OperandSize::S64);
        self.asm.cmp_zero(callee, OperandSize::S64);
        let not_null = self.asm.new_label();
        self.asm.jump_if(CondFlag::Ne, not_null);
        self.asm.trap_exit(NativeCallStatusCode::InvalidTableAccess as u32);
        self.asm.bind_label(not_null);

        let type_id_reg = self.allocate_register(RegisterClass::GeneralPurpose)?;
        self.asm.load(type_id_reg, table_base, 8, OperandSize::S64);
        self.stack.free_scratch_register(table_base);
        self.asm.cmp(type_id_reg, RegImm::Imm(type_index as i64), OperandSize::S32);
        self.stack.free_scratch_register(type_id_reg);

        let ok = self.asm.new_label();
        self.asm.jump_if(CondFlag::Eq, ok);
        self.asm.trap_exit(NativeCallStatusCode::TypeMismatchOnIndirectCall as u32);
        self.asm.bind_label(ok);

        self.asm.call_indirect(callee);
        self.release_on_use(elem_index_reg);
        self.release_on_use(callee);
        Ok(())
    }

    /// `Return`: spill and jump to the function's implicit return label
    /// (`RETURN_LABEL`), where the shared epilogue lives.
    pub fn lower_return(&mut self) -> Result<(), CompileError> {
        self.spill_all_for_branch();
        let label = self.asm_label_for(crate::ir::RETURN_LABEL);
        self.mark_referenced(crate::ir::RETURN_LABEL);
        self.asm.jump(label);
        self.note_unconditional_exit();
        Ok(())
    }

    /// `Unreachable`: an immediate cooperative trap; nothing above it in
    /// program order is reachable either.
    pub fn lower_unreachable(&mut self) -> Result<(), CompileError> {
        self.asm.trap_exit(NativeCallStatusCode::Unreachable as u32);
        self.note_unconditional_exit();
        Ok(())
    }

    /// Spills every register- and flag-resident slot to the VM stack so a
    /// branch target sees a fully memory-resident operand stack — the
    /// simplest reconciliation strategy for a single-pass compiler with no
    /// cross-block register allocation.
    fn spill_all_for_branch(&mut self) {
        let depths: Vec<usize> = (0..self.stack.len()).collect();
        for depth in depths {
            let loc = *self.stack.peek_at(depth);
            if loc.cond_flag.is_some() {
                let class = RegisterClass::GeneralPurpose;
                if let Ok(reg) = self.allocate_register(class) {
                    self.asm.set_from_cond(reg, loc.cond_flag.unwrap());
                    self.overwrite_slot_register(depth, reg);
                }
            }
        }
        for depth in 0..self.stack.len() {
            let loc = *self.stack.peek_at(depth);
            if let Some(reg) = loc.register {
                let offset = (loc.stack_pointer * 8) as i32;
                self.asm.store(RegImm::Reg(reg), A::stack_base_register(), offset, OperandSize::S64);
                self.stack.release_register(depth);
            }
        }
    }

    /// Resolve the top-of-stack into a `CondFlag` without popping it: emits
    /// `cmp_zero` if the value isn't already flag-resident. Returns the
    /// register that was materialized, if any, so the caller can release
    /// it once the slot itself is popped.
    fn resolve_as_cond_flag(&mut self) -> Result<(CondFlag, Option<crate::types::PhysicalRegister>), CompileError> {
        let loc = *self.stack.peek();
        if let Some(flag) = loc.cond_flag {
            return Ok((flag, None));
        }
        let reg = self.ensure_on_register(0)?;
        self.asm.cmp_zero(reg, OperandSize::S32);
        Ok((CondFlag::Ne, Some(reg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;
    use crate::types::RuntimeValueType;

    #[test]
    fn br_spills_registers_before_jumping() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 5).unwrap();
        assert!(cg.stack.peek().register.is_some());
        cg.lower_br(Label(0)).unwrap();
        assert!(cg.stack.peek().is_on_memory_stack());
    }

    #[test]
    fn unreachable_marks_fallthrough_dead() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_unreachable().unwrap();
        let dead = cg.lower_label(Label(1));
        assert!(dead);
    }

    #[test]
    fn call_indirect_consumes_its_index_operand() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 7).unwrap();
        cg.lower_call_indirect(3, 0).unwrap();
        assert!(cg.stack.is_empty());
        assert!(!cg.asm.finish().is_empty());
    }
}
