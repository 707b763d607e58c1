//! The assembler abstraction: buffers instructions, resolves relative
//! jumps and the static-constant pool, and emits a contiguous byte array
//! of machine code. Grounded on winch's `MacroAssembler` trait — one
//! interface, two architecture-specific implementations selected at
//! compile time by [`crate::types::Architecture`], never a trait object
//! (see the "Dynamic dispatch" design note in `SPEC_FULL.md`).

pub mod amd64;
pub mod arm64;

use crate::ir::{ArithOp, AtomicWidth, CompareOp, ConvertOp, UnaryOp};
use crate::types::{CondFlag, PhysicalRegister, RegisterClass, Shape};

/// Operand width in bits, shared by the GP and vector paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    S8,
    S16,
    S32,
    S64,
    S128,
}

/// A forward-patchable or already-bound code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmLabel(pub u32);

/// A reference into the constant pool, valid only until the pool is
/// flushed; callers must consume it (emit the PC-relative load) before
/// requesting another constant that would force a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantRef(pub u32);

/// A register-or-immediate operand, matching the `RegImm` abstraction
/// winch's macro-assembler trait exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegImm {
    Reg(PhysicalRegister),
    Imm(i64),
}

/// Architecture-specific emission surface consumed by the lowering layer.
///
/// Mirrors winch's `MacroAssembler` trait: a handful of high-level
/// operations (`mov`, `add`, `load`, branch/patch primitives) that each ISA
/// backend lowers to its own encoding, freeing the lowering layer from
/// architecture-specific instruction selection.
pub trait Assembler {
    /// Registers available for general allocation, in priority order
    /// (highest priority first), excluding anything reserved for engine
    /// use (stack base pointer, memory base, scratch).
    fn unreserved_registers(class: RegisterClass) -> &'static [PhysicalRegister]
    where
        Self: Sized;

    /// The class a physical register belongs to, inferred from its
    /// numeric identity (disjoint ranges per architecture).
    fn register_class(reg: PhysicalRegister) -> RegisterClass
    where
        Self: Sized;

    /// Reserved register holding the `CallEngine`'s memory base pointer.
    fn memory_base_register() -> PhysicalRegister
    where
        Self: Sized;

    /// Reserved register holding the VM stack base pointer.
    fn stack_base_register() -> PhysicalRegister
    where
        Self: Sized;

    /// Reserved scratch register doubling as the fixed CAS accumulator for
    /// atomic RMW loops (spec §4.3.7 — both compare-exchange instructions
    /// fix the accumulator to one physical register on their respective
    /// architectures, so the lowering layer must too).
    fn cas_accumulator_register() -> PhysicalRegister
    where
        Self: Sized;

    /// The platform calling convention's first argument register, holding
    /// the `CallEngine` pointer at function entry (spec §6, "two fixed
    /// entry conventions ... both take a pointer to the CallEngine
    /// struct"). The prologue reads it once, before any Wasm-level
    /// register allocation begins, and it is free for ordinary use
    /// afterward.
    fn engine_ptr_arg_register() -> PhysicalRegister
    where
        Self: Sized;

    /// The calling convention's second argument register, holding the
    /// current module-instance pointer at entry.
    fn module_instance_arg_register() -> PhysicalRegister
    where
        Self: Sized;

    /// Reserved register holding the current memory's length in bytes,
    /// loaded once in the prologue from `offsets::MEMORY_LENGTH` (spec
    /// §4.4) so every bounds check reads live state rather than a
    /// compile-time constant or a stray host-memory read.
    fn memory_length_register() -> PhysicalRegister
    where
        Self: Sized;

    /// Current emission offset, in bytes, from the start of the function.
    fn current_offset(&self) -> u32;

    // -- data movement --
    fn mov_imm(&mut self, dst: PhysicalRegister, imm: i64, size: OperandSize);
    fn mov_reg(&mut self, dst: PhysicalRegister, src: PhysicalRegister, size: OperandSize);
    fn load(&mut self, dst: PhysicalRegister, base: PhysicalRegister, offset: i32, size: OperandSize);
    fn store(&mut self, src: RegImm, base: PhysicalRegister, offset: i32, size: OperandSize);

    /// Register+register ("indexed") load/store: `*(base + index)`. Every
    /// linear-memory and atomic access goes through this rather than
    /// `load`/`store`'s immediate-offset form, because `base` is always
    /// [`Assembler::memory_base_register`] and `index` is a runtime value
    /// (the bounds- or alignment-checked Wasm-relative offset), not a
    /// compile-time constant.
    fn load_indexed(&mut self, dst: PhysicalRegister, base: PhysicalRegister, index: PhysicalRegister, size: OperandSize);
    fn store_indexed(&mut self, src: RegImm, base: PhysicalRegister, index: PhysicalRegister, size: OperandSize);

    // -- arithmetic (three-address form; architectures with a two-address
    // native encoding pre-move operand 1 into dst themselves) --
    fn add(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);
    fn sub(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);
    fn mul(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);
    fn and(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);
    fn or(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);
    fn xor(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: RegImm, size: OperandSize);

    /// Compare `a` against `b` and set CPU flags; no destination register.
    fn cmp(&mut self, a: PhysicalRegister, b: RegImm, size: OperandSize);
    /// Compare `reg` against zero and set CPU flags.
    fn cmp_zero(&mut self, reg: PhysicalRegister, size: OperandSize);
    /// Materialize `cond` as 0/1 into `dst`.
    fn set_from_cond(&mut self, dst: PhysicalRegister, cond: CondFlag);

    /// The `ArithOp` variants not covered by `add`/`sub`/`mul`/`and`/`or`/
    /// `xor`: division and remainder (signed and unsigned are genuinely
    /// different instructions), shifts, rotates, and float `min`/`max`/
    /// `copysign`. One method rather than eleven, since every call site
    /// already has the exact `ArithOp` in hand and each architecture's impl
    /// dispatches it to a distinct encoding internally — division by zero
    /// and signed-overflow traps are the lowering layer's job, emitted
    /// around the call to this method, not inside it.
    fn arith_extended(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: PhysicalRegister, op: ArithOp, size: OperandSize);

    /// `Clz`/`Ctz`/`Popcnt`/`Abs`/`Sqrt`/`Ceil`/`Floor`/`Trunc`/`Nearest`:
    /// single-operand instructions, each with its own real opcode per
    /// architecture.
    fn unary_extended(&mut self, dst: PhysicalRegister, src: PhysicalRegister, op: UnaryOp, size: OperandSize);

    /// One instruction sequence per [`crate::ir::ConvertOp`] variant. The
    /// sentinel that invalid truncations leave in `dst` (hardware
    /// truncate-to-int already saturates/sentinels on NaN or out-of-range
    /// input on both architectures) is what the lowering layer probes to
    /// raise `InvalidFloatToIntConversion`, so this method never branches.
    fn convert(&mut self, dst: PhysicalRegister, src: PhysicalRegister, op: ConvertOp);

    // -- control flow --
    fn new_label(&mut self) -> AsmLabel;
    fn bind_label(&mut self, label: AsmLabel);
    fn jump(&mut self, label: AsmLabel);
    fn jump_if(&mut self, cond: CondFlag, label: AsmLabel);
    fn jump_table(&mut self, index: PhysicalRegister, targets: &[AsmLabel], default: AsmLabel);

    // -- calls --
    fn call_direct(&mut self, target_offset_placeholder: u32) -> u32;
    fn call_indirect(&mut self, target: PhysicalRegister);

    // -- cooperative exit --
    fn trap_exit(&mut self, status_code: u32);

    // -- constant pool --
    fn push_constant_bytes(&mut self, bytes: &[u8]) -> ConstantRef;
    fn load_constant_address(&mut self, dst: PhysicalRegister, ref_: ConstantRef);
    /// Flush the constant pool before a PC-relative reference would exceed
    /// the architecture's displacement limit. No-op if nothing is pending.
    fn maybe_flush_constants(&mut self);

    // -- vector --
    fn vector_move(&mut self, dst: PhysicalRegister, src: PhysicalRegister);
    fn vector_lane_insert(&mut self, dst: PhysicalRegister, lane: u8, src: PhysicalRegister);
    fn vector_lane_extract(
        &mut self,
        dst: PhysicalRegister,
        src: PhysicalRegister,
        lane: u8,
        signed: bool,
    );

    /// Per-lane binary arithmetic, dispatched on `shape` (lane width) and
    /// `op` (which operation) — e.g. `i8x16.add` and `f32x4.mul` are
    /// different opcodes entirely, not the same instruction at different
    /// widths.
    fn vector_binary(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: PhysicalRegister, shape: Shape, op: ArithOp);
    /// Per-lane unary arithmetic (`neg`/`abs`/`sqrt`/... over every lane).
    fn vector_unary(&mut self, dst: PhysicalRegister, src: PhysicalRegister, shape: Shape, op: UnaryOp);
    /// Per-lane compare; result is an all-ones/all-zeros mask per lane, not
    /// a scalar condition flag.
    fn vector_compare(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: PhysicalRegister, shape: Shape, op: CompareOp);
    /// Arbitrary byte-granularity lane permutation across the two-register
    /// input pair `(a, b)`, selected by a 16-byte mask already resident in
    /// `mask` (loaded from the constant pool by the caller).
    fn vector_shuffle(&mut self, dst: PhysicalRegister, a: PhysicalRegister, b: PhysicalRegister, mask: PhysicalRegister);
    /// Single-register byte permutation: `indices` selects from `a` only,
    /// zeroing any lane whose index is out of range (spec §4.3.6).
    fn vector_swizzle(&mut self, dst: PhysicalRegister, a: PhysicalRegister, indices: PhysicalRegister);
    /// Pack each lane's sign/top bit into the low bits of a GP register.
    fn vector_bitmask(&mut self, dst: PhysicalRegister, src: PhysicalRegister, shape: Shape);
    /// Load one `width`-sized scalar from `*(base + index)` and broadcast
    /// it to every lane of `dst`.
    fn vector_load_splat(&mut self, dst: PhysicalRegister, base: PhysicalRegister, index: PhysicalRegister, width: AtomicWidth);
    /// Load 8 bytes from `*(base + index)` and widen each byte/halfword
    /// into the next-larger lane width (`signed` chooses sign- vs.
    /// zero-extend).
    fn vector_load_extend(&mut self, dst: PhysicalRegister, base: PhysicalRegister, index: PhysicalRegister, signed: bool);

    /// Finalize the emitted buffer into a contiguous byte array.
    fn finish(self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::Amd64Assembler;
    use crate::isa::arm64::Arm64Assembler;

    #[test]
    fn unreserved_register_lists_are_disjoint_from_reserved() {
        let gp = Amd64Assembler::unreserved_registers(RegisterClass::GeneralPurpose);
        assert!(!gp.contains(&Amd64Assembler::memory_base_register()));
        assert!(!gp.contains(&Amd64Assembler::stack_base_register()));

        let gp64 = Arm64Assembler::unreserved_registers(RegisterClass::GeneralPurpose);
        assert!(!gp64.contains(&Arm64Assembler::memory_base_register()));
        assert!(!gp64.contains(&Arm64Assembler::stack_base_register()));
    }
}
