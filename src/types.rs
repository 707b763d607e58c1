//! Core value types shared by the value-location tracker, the lowering
//! layer, and the ISA backends.

use std::fmt;

/// What a Wasm operand-stack slot holds, and how many 64-bit VM-stack slots
/// it occupies.
///
/// A `V128` value is represented on the logical stack as two consecutive
/// [`ValueLocation`] entries, `V128Lo` first, so that each entry still maps
/// to exactly one 64-bit VM-stack cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeValueType {
    I32,
    I64,
    F32,
    F64,
    V128Lo,
    V128Hi,
}

impl RuntimeValueType {
    /// Number of 64-bit VM-stack slots a value of this type consumes by
    /// itself (always 1; a `V128` is two [`RuntimeValueType`] entries, not
    /// one double-wide entry).
    pub const fn slot_count(self) -> u32 {
        1
    }

    pub const fn is_vector_half(self) -> bool {
        matches!(self, RuntimeValueType::V128Lo | RuntimeValueType::V128Hi)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, RuntimeValueType::F32 | RuntimeValueType::F64)
    }

    /// The register class a value of this type is naturally materialized
    /// into.
    pub const fn register_class(self) -> RegisterClass {
        match self {
            RuntimeValueType::I32 | RuntimeValueType::I64 => RegisterClass::GeneralPurpose,
            RuntimeValueType::F32
            | RuntimeValueType::F64
            | RuntimeValueType::V128Lo
            | RuntimeValueType::V128Hi => RegisterClass::Vector,
        }
    }
}

/// The two register files the allocator and lowering layer reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    GeneralPurpose,
    Vector,
}

/// An opaque physical register identifier.
///
/// The numeric value is architecture-specific; [`RegisterClass`] membership
/// is recovered from disjoint numeric ranges owned by each `isa::*` module,
/// never by a side table, per the "class is inferred from numeric identity"
/// design in the lowering layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalRegister(pub(crate) u8);

impl PhysicalRegister {
    /// Sentinel meaning "not materialized in any register."
    pub const NONE: PhysicalRegister = PhysicalRegister(u8::MAX);

    pub const fn new(id: u8) -> Self {
        PhysicalRegister(id)
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == u8::MAX
    }
}

impl fmt::Debug for PhysicalRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "r<none>")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// CPU condition-flag state, the third placement a stack slot can have
/// besides "in a register" or "on the memory stack". Only ever produced for
/// `I32`-typed comparison results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondFlag {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned/float "minus" (negative/below), ARM64 naming kept distinct
    /// from the signed variants because the emitters pick different
    /// condition-code encodings for them.
    Mi,
    Ls,
    Hs,
    Lo,
    Hi,
}

impl CondFlag {
    /// The condition that holds exactly when `self` does not.
    pub const fn inverse(self) -> CondFlag {
        use CondFlag::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Le => Gt,
            Gt => Le,
            Ge => Lt,
            Mi => Hs,
            Ls => Hi,
            Hs => Mi,
            Lo => Hs,
            Hi => Ls,
        }
    }
}

/// Target architecture selected for a [`crate::compiler::Compiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Detect the host architecture via `target-lexicon`, the same way
    /// `cranelift-native` resolves a host `isa::Builder`.
    pub fn host() -> Result<Self, crate::error::CompileError> {
        use target_lexicon::Architecture as HostArch;
        match target_lexicon::Triple::host().architecture {
            HostArch::X86_64 => Ok(Architecture::Amd64),
            HostArch::Aarch64(_) => Ok(Architecture::Arm64),
            other => Err(crate::error::CompileError::UnsupportedArchitecture(
                other.to_string(),
            )),
        }
    }
}

/// Lane shape tag for `v128` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    I8x16,
    I16x8,
    I32x4,
    I64x2,
    F32x4,
    F64x2,
}

impl Shape {
    pub const fn lane_count(self) -> u32 {
        match self {
            Shape::I8x16 => 16,
            Shape::I16x8 => 8,
            Shape::I32x4 | Shape::F32x4 => 4,
            Shape::I64x2 | Shape::F64x2 => 2,
        }
    }

    pub const fn lane_bytes(self) -> u32 {
        128 / 8 / self.lane_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_flag_inverse_is_involution() {
        for f in [
            CondFlag::Eq,
            CondFlag::Ne,
            CondFlag::Lt,
            CondFlag::Le,
            CondFlag::Gt,
            CondFlag::Ge,
        ] {
            assert_eq!(f.inverse().inverse(), f);
        }
    }

    #[test]
    fn register_class_from_type() {
        assert_eq!(
            RuntimeValueType::I32.register_class(),
            RegisterClass::GeneralPurpose
        );
        assert_eq!(
            RuntimeValueType::F64.register_class(),
            RegisterClass::Vector
        );
        assert_eq!(
            RuntimeValueType::V128Lo.register_class(),
            RegisterClass::Vector
        );
    }

    #[test]
    fn none_sentinel_roundtrips() {
        assert!(PhysicalRegister::NONE.is_none());
        assert!(!PhysicalRegister::new(3).is_none());
    }
}
