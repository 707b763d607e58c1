//! The discriminated-union IR operation type consumed by the lowering
//! layer (spec §6). Out of scope for this crate is how this stream is
//! *produced* — the binary parser and the IR-construction pass are an
//! external collaborator; this module only defines the wire contract the
//! lowering layer reads.

use crate::types::{RuntimeValueType, Shape};

/// Numeric comparison/arithmetic class, shared by the integer and float
/// arithmetic opcodes so the lowering layer can dispatch on `(NumType, ArithOp)`
/// instead of one variant per `(type, op)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    DivSigned,
    DivUnsigned,
    RemSigned,
    RemUnsigned,
    And,
    Or,
    Xor,
    Shl,
    ShrSigned,
    ShrUnsigned,
    Rotl,
    Rotr,
    Min,
    Max,
    Copysign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    LtSigned,
    LtUnsigned,
    LeSigned,
    LeUnsigned,
    GtSigned,
    GtUnsigned,
    GeSigned,
    GeUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Clz,
    Ctz,
    Popcnt,
    Eqz,
    Neg,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOp {
    I32WrapI64,
    I64ExtendI32Signed,
    I64ExtendI32Unsigned,
    I32TruncF32Signed,
    I32TruncF32Unsigned,
    I32TruncF64Signed,
    I32TruncF64Unsigned,
    I64TruncF32Signed,
    I64TruncF32Unsigned,
    I64TruncF64Signed,
    I64TruncF64Unsigned,
    F32ConvertI32Signed,
    F32ConvertI32Unsigned,
    F32ConvertI64Signed,
    F32ConvertI64Unsigned,
    F64ConvertI32Signed,
    F64ConvertI32Unsigned,
    F64ConvertI64Signed,
    F64ConvertI64Unsigned,
    F32DemoteF64,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
}

/// Label identifier, stable across the whole function's compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Sentinel label id the driver uses for the function's implicit "return"
/// target (see `Br` semantics in spec §4.3.5).
pub const RETURN_LABEL: Label = Label(u32::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    pub align_log2: u8,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicRmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicWidth {
    W8,
    W16,
    W32,
    W64,
}

/// One element of the pre-validated, linearized IR operation stream.
///
/// Each variant carries at most its discriminant plus a small fixed
/// payload, per spec §6 ("at most two small integers plus a shape/type
/// tag").
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    // --- numeric ---
    Const { ty: RuntimeValueType, bits: u64 },
    Binary { ty: NumType, op: ArithOp },
    Unary { ty: NumType, op: UnaryOp },
    Compare { ty: NumType, op: CompareOp },
    Convert { op: ConvertOp },

    // --- memory ---
    Load { ty: NumType, arg: MemArg },
    Load8 { ty: NumType, signed: bool, arg: MemArg },
    Load16 { ty: NumType, signed: bool, arg: MemArg },
    Load32 { signed: bool, arg: MemArg },
    Store { ty: NumType, arg: MemArg },
    Store8 { arg: MemArg },
    Store16 { arg: MemArg },
    Store32 { arg: MemArg },
    MemorySize,
    MemoryGrow,

    // --- globals ---
    GlobalGet { index: u32 },
    GlobalSet { index: u32 },

    // --- control flow ---
    Label { id: Label },
    Br { target: Label },
    BrIf { then_target: Label, else_target: Label },
    BrTable { targets: Vec<Label>, default: Label },
    Call { func_index: u32 },
    CallIndirect { type_index: u32, table_index: u32 },
    Return,
    Unreachable,

    // --- stack manipulation ---
    Pick { depth: u32, is_v128: bool },
    Drop { start: u32, end: u32 },
    Select,
    Set { depth: u32, is_v128: bool },
    Swap { depth: u32, is_v128: bool },

    // --- SIMD ---
    V128Const { lo: u64, hi: u64 },
    V128Binary { shape: Shape, op: ArithOp },
    V128Unary { shape: Shape, op: UnaryOp },
    V128Compare { shape: Shape, op: CompareOp },
    V128Load { arg: MemArg },
    V128LoadSplat { width: AtomicWidth, arg: MemArg },
    V128LoadExtend { signed: bool, arg: MemArg },
    V128Store { arg: MemArg },
    V128Shuffle { lanes: [u8; 16] },
    V128Swizzle,
    V128BitMask { shape: Shape },
    V128ExtractLane { shape: Shape, lane: u8, signed: bool },
    V128ReplaceLane { shape: Shape, lane: u8 },
    V128Splat { shape: Shape },

    // --- atomics ---
    AtomicLoad { width: AtomicWidth, arg: MemArg },
    AtomicStore { width: AtomicWidth, arg: MemArg },
    AtomicRmw { width: AtomicWidth, op: AtomicRmwOp, arg: MemArg },
    AtomicCmpxchg { width: AtomicWidth, arg: MemArg },
    AtomicFence,
    AtomicWait { width: AtomicWidth, arg: MemArg },
    AtomicNotify { arg: MemArg },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_label_is_distinct_from_any_real_label() {
        assert_ne!(RETURN_LABEL, Label(0));
        assert_ne!(RETURN_LABEL, Label(u32::MAX - 1));
    }
}
