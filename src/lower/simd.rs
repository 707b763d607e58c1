//! §4.3.6 Vector (`v128`) operations.
//!
//! A `v128` occupies two consecutive [`crate::value_stack::ValueLocation`]
//! entries on the logical stack (`V128Lo` then `V128Hi`) so the VM-stack
//! spill accounting reserves two 64-bit cells per vector value, matching
//! every other slot's width. The full 128 bits live in a single vector
//! register referenced from the `Lo` half; `Hi` never gets its own
//! register — it is bookkeeping for spill-slot width, not a second live
//! value, so its `push`/`pop` always goes through `push_on_stack`.

use super::CodeGen;
use crate::error::CompileError;
use crate::ir::{ArithOp, CompareOp, UnaryOp};
use crate::isa::{Assembler, OperandSize};
use crate::types::{PhysicalRegister, RegisterClass, RuntimeValueType, Shape};

impl<A: Assembler> CodeGen<A> {
    fn push_v128_register(&mut self, reg: PhysicalRegister) {
        self.stack.push_on_register(reg, RuntimeValueType::V128Lo);
        self.stack.push_on_stack(RuntimeValueType::V128Hi);
    }

    /// Materialize the `v128` at logical `depth` (0 = top pair) into its
    /// register, returning it; `depth` counts whole `v128` values, not
    /// individual halves.
    fn ensure_v128_on_register(&mut self, depth: usize) -> Result<PhysicalRegister, CompileError> {
        self.ensure_on_register(depth * 2 + 1)
    }

    /// Pop one `v128` (both halves) off the logical stack.
    fn pop_v128(&mut self) {
        self.stack.pop(); // Hi
        self.stack.pop(); // Lo
    }

    pub fn lower_v128_const(&mut self, lo: u64, hi: u64) -> Result<(), CompileError> {
        let reg = self.allocate_register(RegisterClass::Vector)?;
        let bytes: [u8; 16] = {
            let mut b = [0u8; 16];
            b[..8].copy_from_slice(&lo.to_le_bytes());
            b[8..].copy_from_slice(&hi.to_le_bytes());
            b
        };
        let const_ref = self.asm.push_constant_bytes(&bytes);
        self.asm.maybe_flush_constants();
        self.asm.load_constant_address(reg, const_ref);
        self.push_v128_register(reg);
        Ok(())
    }

    pub fn lower_v128_binary(&mut self, shape: Shape, op: ArithOp) -> Result<(), CompileError> {
        let rhs = self.ensure_v128_on_register(0)?;
        let lhs = self.ensure_v128_on_register(1)?;
        self.pop_v128();
        self.pop_v128();
        self.asm.vector_binary(lhs, lhs, rhs, shape, op);
        self.release_on_use(rhs);
        self.push_v128_register(lhs);
        Ok(())
    }

    pub fn lower_v128_unary(&mut self, shape: Shape, op: UnaryOp) -> Result<(), CompileError> {
        let reg = self.ensure_v128_on_register(0)?;
        self.pop_v128();
        self.asm.vector_unary(reg, reg, shape, op);
        self.push_v128_register(reg);
        Ok(())
    }

    pub fn lower_v128_compare(&mut self, shape: Shape, op: CompareOp) -> Result<(), CompileError> {
        let rhs = self.ensure_v128_on_register(0)?;
        let lhs = self.ensure_v128_on_register(1)?;
        self.pop_v128();
        self.pop_v128();
        self.asm.vector_compare(lhs, lhs, rhs, shape, op);
        self.release_on_use(rhs);
        self.push_v128_register(lhs);
        Ok(())
    }

    pub fn lower_v128_load(&mut self, arg: crate::ir::MemArg) -> Result<(), CompileError> {
        let addr_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.asm.add(addr_reg, addr_reg, crate::isa::RegImm::Imm(arg.offset as i64), OperandSize::S64);
        let dst = self.allocate_register(RegisterClass::Vector)?;
        self.asm.load_indexed(dst, A::memory_base_register(), addr_reg, OperandSize::S128);
        self.release_on_use(addr_reg);
        self.push_v128_register(dst);
        Ok(())
    }

    pub fn lower_v128_load_splat(
        &mut self,
        width: crate::ir::AtomicWidth,
        arg: crate::ir::MemArg,
    ) -> Result<(), CompileError> {
        let addr_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.asm.add(addr_reg, addr_reg, crate::isa::RegImm::Imm(arg.offset as i64), OperandSize::S64);
        let dst = self.allocate_register(RegisterClass::Vector)?;
        self.asm.vector_load_splat(dst, A::memory_base_register(), addr_reg, width);
        self.release_on_use(addr_reg);
        self.push_v128_register(dst);
        Ok(())
    }

    pub fn lower_v128_load_extend(&mut self, signed: bool, arg: crate::ir::MemArg) -> Result<(), CompileError> {
        let addr_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        self.asm.add(addr_reg, addr_reg, crate::isa::RegImm::Imm(arg.offset as i64), OperandSize::S64);
        let dst = self.allocate_register(RegisterClass::Vector)?;
        self.asm.vector_load_extend(dst, A::memory_base_register(), addr_reg, signed);
        self.release_on_use(addr_reg);
        self.push_v128_register(dst);
        Ok(())
    }

    pub fn lower_v128_store(&mut self, arg: crate::ir::MemArg) -> Result<(), CompileError> {
        let value_reg = self.ensure_v128_on_register(0)?;
        let addr_reg = self.ensure_on_register(2)?;
        self.pop_v128();
        self.stack.pop();
        self.asm.add(addr_reg, addr_reg, crate::isa::RegImm::Imm(arg.offset as i64), OperandSize::S64);
        self.asm.store_indexed(crate::isa::RegImm::Reg(value_reg), A::memory_base_register(), addr_reg, OperandSize::S128);
        self.release_on_use(value_reg);
        self.release_on_use(addr_reg);
        Ok(())
    }

    /// `V128Shuffle`: the 16-byte lane-select mask does not fit in an
    /// immediate, so it is pushed into the constant pool and referenced as
    /// a second operand, forcing a flush when the pool's displacement
    /// limit is close (spec §4.3.6).
    pub fn lower_v128_shuffle(&mut self, lanes: [u8; 16]) -> Result<(), CompileError> {
        let rhs = self.ensure_v128_on_register(0)?;
        let lhs = self.ensure_v128_on_register(1)?;
        self.pop_v128();
        self.pop_v128();

        self.asm.maybe_flush_constants();
        let mask_ref = self.asm.push_constant_bytes(&lanes);
        let mask_reg = self.allocate_register(RegisterClass::Vector)?;
        self.asm.load_constant_address(mask_reg, mask_ref);
        self.asm.vector_shuffle(lhs, lhs, rhs, mask_reg);
        self.release_on_use(rhs);
        self.release_on_use(mask_reg);
        self.push_v128_register(lhs);
        Ok(())
    }

    pub fn lower_v128_swizzle(&mut self) -> Result<(), CompileError> {
        let rhs = self.ensure_v128_on_register(0)?;
        let lhs = self.ensure_v128_on_register(1)?;
        self.pop_v128();
        self.pop_v128();
        self.asm.vector_swizzle(lhs, lhs, rhs);
        self.release_on_use(rhs);
        self.push_v128_register(lhs);
        Ok(())
    }

    /// `V128BitMask`: extract the sign bit of each lane into a scalar GP
    /// register. AMD64 has a direct `pmovmskb`-family instruction; ARM64
    /// has none and must shift-and-compare each lane (spec §4.3.6) — the
    /// choice of technique lives in the `Assembler` impl, this layer only
    /// allocates the destination and releases the source.
    pub fn lower_v128_bitmask(&mut self, shape: Shape) -> Result<(), CompileError> {
        let src = self.ensure_v128_on_register(0)?;
        self.pop_v128();
        let dst = self.allocate_register(RegisterClass::GeneralPurpose)?;
        self.asm.vector_bitmask(dst, src, shape);
        self.release_on_use(src);
        self.stack.push_on_register(dst, RuntimeValueType::I32);
        Ok(())
    }

    pub fn lower_v128_extract_lane(&mut self, shape: Shape, lane: u8, signed: bool) -> Result<(), CompileError> {
        let src = self.ensure_v128_on_register(0)?;
        self.pop_v128();
        let scalar_ty = scalar_type_for_shape(shape);
        let dst = self.allocate_register(scalar_ty.register_class())?;
        self.asm.vector_lane_extract(dst, src, lane, signed);
        self.release_on_use(src);
        self.stack.push_on_register(dst, scalar_ty);
        Ok(())
    }

    pub fn lower_v128_replace_lane(&mut self, shape: Shape, lane: u8) -> Result<(), CompileError> {
        let scalar_ty = scalar_type_for_shape(shape);
        let value_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let vec_reg = self.ensure_v128_on_register(0)?;
        self.pop_v128();
        self.asm.vector_lane_insert(vec_reg, lane, value_reg);
        self.release_on_use(value_reg);
        let _ = scalar_ty;
        self.push_v128_register(vec_reg);
        Ok(())
    }

    pub fn lower_v128_splat(&mut self, shape: Shape) -> Result<(), CompileError> {
        let scalar_ty = scalar_type_for_shape(shape);
        let value_reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let vec_reg = self.allocate_register(RegisterClass::Vector)?;
        self.asm.vector_lane_insert(vec_reg, 0, value_reg);
        self.release_on_use(value_reg);
        let _ = scalar_ty;
        self.push_v128_register(vec_reg);
        Ok(())
    }
}

fn scalar_type_for_shape(shape: Shape) -> RuntimeValueType {
    match shape {
        Shape::I8x16 | Shape::I16x8 | Shape::I32x4 => RuntimeValueType::I32,
        Shape::I64x2 => RuntimeValueType::I64,
        Shape::F32x4 => RuntimeValueType::F32,
        Shape::F64x2 => RuntimeValueType::F64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;

    #[test]
    fn v128_const_occupies_two_slots() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_v128_const(1, 2).unwrap();
        assert_eq!(cg.stack.len(), 2);
        assert_eq!(cg.stack.peek_at(1).value_type, RuntimeValueType::V128Lo);
        assert_eq!(cg.stack.peek().value_type, RuntimeValueType::V128Hi);
    }

    #[test]
    fn v128_binary_consumes_both_operands() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_v128_const(1, 0).unwrap();
        cg.lower_v128_const(2, 0).unwrap();
        cg.lower_v128_binary(Shape::I32x4, ArithOp::Add).unwrap();
        assert_eq!(cg.stack.len(), 2);
    }

    #[test]
    fn extract_lane_produces_scalar_i32() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_v128_const(1, 0).unwrap();
        cg.lower_v128_extract_lane(Shape::I8x16, 3, true).unwrap();
        assert_eq!(cg.stack.len(), 1);
        assert_eq!(cg.stack.peek().value_type, RuntimeValueType::I32);
    }
}
