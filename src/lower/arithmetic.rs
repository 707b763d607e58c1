//! §4.3.1 Numeric operations: constants, binary/unary arithmetic, compares,
//! and conversions.

use super::CodeGen;
use crate::call_engine::NativeCallStatusCode;
use crate::error::CompileError;
use crate::ir::{ArithOp, CompareOp, ConvertOp, NumType, UnaryOp};
use crate::isa::{Assembler, OperandSize, RegImm};
use crate::types::{CondFlag, RuntimeValueType};

fn operand_size(ty: NumType) -> OperandSize {
    match ty {
        NumType::I32 | NumType::F32 => OperandSize::S32,
        NumType::I64 | NumType::F64 => OperandSize::S64,
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

fn compare_to_cond(op: CompareOp) -> CondFlag {
    match op {
        CompareOp::Eq => CondFlag::Eq,
        CompareOp::Ne => CondFlag::Ne,
        CompareOp::LtSigned | CompareOp::LtUnsigned => CondFlag::Lt,
        CompareOp::LeSigned | CompareOp::LeUnsigned => CondFlag::Le,
        CompareOp::GtSigned | CompareOp::GtUnsigned => CondFlag::Gt,
        CompareOp::GeSigned | CompareOp::GeUnsigned => CondFlag::Ge,
    }
}

impl<A: Assembler> CodeGen<A> {
    /// `Const`: push an immediate. Materializing eagerly into a register
    /// would waste one for values that are immediately consumed by a
    /// three-address op that can take an immediate operand directly, so a
    /// const is kept as a memory-resident value whose initial store is the
    /// immediate itself — the lowering layer chooses. Baseline here: always
    /// claim a register, matching the "never defer past the next op"
    /// discipline the rest of the stack uses.
    pub fn lower_const(&mut self, ty: RuntimeValueType, bits: u64) -> Result<(), CompileError> {
        let class = ty.register_class();
        let reg = self.allocate_register(class)?;
        self.asm.mov_imm(reg, bits as i64, OperandSize::S64);
        self.stack.push_on_register(reg, ty);
        Ok(())
    }

    /// `Binary`: ensure both operands are register-resident, emit the
    /// three-address instruction into the left operand's register (the
    /// right operand's register, if any, is released), and push the
    /// result.
    pub fn lower_binary(&mut self, ty: NumType, op: ArithOp) -> Result<(), CompileError> {
        let size = operand_size(ty);
        let rhs_reg = self.ensure_on_register(0)?;
        let lhs_reg = self.ensure_on_register(1)?;
        self.stack.pop();
        self.stack.pop();
        self.release_on_use(rhs_reg);

        match op {
            ArithOp::Add => self.asm.add(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            ArithOp::Sub => self.asm.sub(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            ArithOp::Mul => self.asm.mul(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            ArithOp::And => self.asm.and(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            ArithOp::Or => self.asm.or(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            ArithOp::Xor => self.asm.xor(lhs_reg, lhs_reg, RegImm::Reg(rhs_reg), size),
            // Shifts, rotates, and float min/max/copysign route through the
            // same three-address shape at this layer; the
            // architecture-specific encoding differences (e.g. AMD64's
            // shift-by-CL convention, ARM64's *V variable-shift family) live
            // in the `Assembler::arith_extended` impl, not here.
            ArithOp::Shl
            | ArithOp::ShrSigned
            | ArithOp::ShrUnsigned
            | ArithOp::Rotl
            | ArithOp::Rotr
            | ArithOp::Min
            | ArithOp::Max
            | ArithOp::Copysign => self.asm.arith_extended(lhs_reg, lhs_reg, rhs_reg, op, size),
            ArithOp::DivSigned | ArithOp::DivUnsigned | ArithOp::RemSigned | ArithOp::RemUnsigned => {
                self.asm.cmp_zero(rhs_reg, size);
                let divisor_ok = self.asm.new_label();
                self.asm.jump_if(CondFlag::Ne, divisor_ok);
                self.asm.trap_exit(NativeCallStatusCode::IntegerDivisionByZero as u32);
                self.asm.bind_label(divisor_ok);

                // Signed division/remainder additionally traps on the one
                // representable-range overflow: `INT_MIN / -1` (and its
                // remainder counterpart, which is well-defined as 0 but
                // shares the same faulting hardware encoding).
                if matches!(op, ArithOp::DivSigned | ArithOp::RemSigned) {
                    let int_min: i64 = match ty {
                        NumType::I32 => i32::MIN as i64,
                        NumType::I64 => i64::MIN,
                        NumType::F32 | NumType::F64 => unreachable!("integer div/rem on float type"),
                    };
                    self.asm.cmp(lhs_reg, RegImm::Imm(int_min), size);
                    let no_overflow = self.asm.new_label();
                    self.asm.jump_if(CondFlag::Ne, no_overflow);
                    self.asm.cmp(rhs_reg, RegImm::Imm(-1), size);
                    let safe = self.asm.new_label();
                    self.asm.jump_if(CondFlag::Ne, safe);
                    self.asm.trap_exit(NativeCallStatusCode::IntegerOverflow as u32);
                    self.asm.bind_label(safe);
                    self.asm.bind_label(no_overflow);
                }

                self.asm.arith_extended(lhs_reg, lhs_reg, rhs_reg, op, size);
            }
        }

        self.stack.push_on_register(lhs_reg, value_type(ty));
        Ok(())
    }

    pub fn lower_unary(&mut self, ty: NumType, op: UnaryOp) -> Result<(), CompileError> {
        let size = operand_size(ty);
        let reg = self.ensure_on_register(0)?;
        match op {
            UnaryOp::Eqz => {
                self.asm.cmp_zero(reg, size);
                self.stack.pop();
                self.release_on_use(reg);
                self.stack.push_on_cond_flag(CondFlag::Eq);
            }
            UnaryOp::Neg => {
                self.asm.sub(reg, reg, RegImm::Imm(0), size);
                self.stack.pop();
                self.stack.push_on_register(reg, value_type(ty));
            }
            UnaryOp::Clz
            | UnaryOp::Ctz
            | UnaryOp::Popcnt
            | UnaryOp::Abs
            | UnaryOp::Sqrt
            | UnaryOp::Ceil
            | UnaryOp::Floor
            | UnaryOp::Trunc
            | UnaryOp::Nearest => {
                // Bit-counting and float-rounding ops are single-operand,
                // single-register-in-place instructions on both
                // architectures; the op-specific encoding lives in
                // `Assembler::unary_extended`.
                self.asm.unary_extended(reg, reg, op, size);
                self.stack.pop();
                self.stack.push_on_register(reg, value_type(ty));
            }
        }
        Ok(())
    }

    /// `Compare`: produce a condition-flag-resident `i32` result rather
    /// than eagerly materializing 0/1, per spec §4.1 invariant 3 — most
    /// comparisons are immediately consumed by `BrIf`.
    pub fn lower_compare(&mut self, ty: NumType, op: CompareOp) -> Result<(), CompileError> {
        let size = operand_size(ty);
        let rhs_reg = self.ensure_on_register(0)?;
        let lhs_reg = self.ensure_on_register(1)?;
        self.stack.pop();
        self.stack.pop();
        self.release_on_use(rhs_reg);
        self.release_on_use(lhs_reg);

        self.asm.cmp(lhs_reg, RegImm::Reg(rhs_reg), size);
        let cond = compare_to_cond(op);
        self.stack.push_on_cond_flag(cond);
        Ok(())
    }

    pub fn lower_convert(&mut self, op: ConvertOp) -> Result<(), CompileError> {
        let (from, to) = convert_types(op);
        let reg = self.ensure_on_register(0)?;
        self.stack.pop();
        let dst = if from.register_class() == to.register_class() {
            reg
        } else {
            let dst = self.allocate_register(to.register_class())?;
            self.release_on_use(reg);
            dst
        };
        self.asm.convert(dst, reg, op);

        // The truncating float-to-int conversions rely on the hardware's
        // invalid-input sentinel (AMD64's CVTTSx2SI writes INT_MIN; ARM64's
        // FCVTZx saturates to the same bound) rather than a branch inside
        // `Assembler::convert` itself, so the trap check lives here.
        if is_truncating(op) {
            let sentinel: i64 = match to {
                RuntimeValueType::I32 => i32::MIN as i64,
                RuntimeValueType::I64 => i64::MIN,
                _ => unreachable!("truncating conversion must target an integer type"),
            };
            let size = match to {
                RuntimeValueType::I32 => OperandSize::S32,
                RuntimeValueType::I64 => OperandSize::S64,
                _ => unreachable!("truncating conversion must target an integer type"),
            };
            self.asm.cmp(dst, RegImm::Imm(sentinel), size);
            let valid = self.asm.new_label();
            self.asm.jump_if(CondFlag::Ne, valid);
            self.asm.trap_exit(NativeCallStatusCode::InvalidFloatToIntConversion as u32);
            self.asm.bind_label(valid);
        }

        self.stack.push_on_register(dst, to);
        Ok(())
    }
}

fn is_truncating(op: ConvertOp) -> bool {
    use ConvertOp::*;
    matches!(
        op,
        I32TruncF32Signed
            | I32TruncF32Unsigned
            | I32TruncF64Signed
            | I32TruncF64Unsigned
            | I64TruncF32Signed
            | I64TruncF32Unsigned
            | I64TruncF64Signed
            | I64TruncF64Unsigned
    )
}

fn convert_types(op: ConvertOp) -> (RuntimeValueType, RuntimeValueType) {
    use ConvertOp::*;
    use RuntimeValueType as V;
    match op {
        I32WrapI64 => (V::I64, V::I32),
        I64ExtendI32Signed | I64ExtendI32Unsigned => (V::I32, V::I64),
        I32TruncF32Signed | I32TruncF32Unsigned => (V::F32, V::I32),
        I32TruncF64Signed | I32TruncF64Unsigned => (V::F64, V::I32),
        I64TruncF32Signed | I64TruncF32Unsigned => (V::F32, V::I64),
        I64TruncF64Signed | I64TruncF64Unsigned => (V::F64, V::I64),
        F32ConvertI32Signed | F32ConvertI32Unsigned => (V::I32, V::F32),
        F32ConvertI64Signed | F32ConvertI64Unsigned => (V::I64, V::F32),
        F64ConvertI32Signed | F64ConvertI32Unsigned => (V::I32, V::F64),
        F64ConvertI64Signed | F64ConvertI64Unsigned => (V::I64, V::F64),
        F32DemoteF64 => (V::F64, V::F32),
        F64PromoteF32 => (V::F32, V::F64),
        I32ReinterpretF32 => (V::F32, V::I32),
        I64ReinterpretF64 => (V::F64, V::I64),
        F32ReinterpretI32 => (V::I32, V::F32),
        F64ReinterpretI64 => (V::I64, V::F64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;

    #[test]
    fn const_then_binary_add_leaves_single_register_result() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 1).unwrap();
        cg.lower_const(RuntimeValueType::I32, 2).unwrap();
        cg.lower_binary(NumType::I32, ArithOp::Add).unwrap();
        assert_eq!(cg.stack.len(), 1);
        assert!(cg.stack.peek().register.is_some());
    }

    #[test]
    fn compare_produces_cond_flag_slot() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 1).unwrap();
        cg.lower_const(RuntimeValueType::I32, 2).unwrap();
        cg.lower_compare(NumType::I32, CompareOp::LeSigned).unwrap();
        assert_eq!(cg.stack.peek().cond_flag, Some(CondFlag::Le));
    }

    #[test]
    fn signed_div_emits_zero_and_overflow_guards() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 10).unwrap();
        cg.lower_const(RuntimeValueType::I32, 3).unwrap();
        cg.lower_binary(NumType::I32, ArithOp::DivSigned).unwrap();
        assert_eq!(cg.stack.len(), 1);
        let code = cg.asm.finish();
        assert!(!code.is_empty());
    }

    #[test]
    fn clz_leaves_single_register_result() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::I32, 7).unwrap();
        cg.lower_unary(NumType::I32, UnaryOp::Clz).unwrap();
        assert_eq!(cg.stack.len(), 1);
        assert!(cg.stack.peek().register.is_some());
    }

    #[test]
    fn truncating_convert_leaves_checked_integer_result() {
        let mut cg = CodeGen::new(Amd64Assembler::new());
        cg.lower_const(RuntimeValueType::F64, 0).unwrap();
        cg.lower_convert(ConvertOp::I32TruncF64Signed).unwrap();
        assert_eq!(cg.stack.len(), 1);
        assert_eq!(cg.stack.peek().value_type, RuntimeValueType::I32);
    }
}
