//! The driver (spec §6, module list item 10): turns one function's linear
//! `Operation` stream into finished machine code, and a batch of functions
//! into a [`CompiledModule`]. Grounded on `wasmtime-jit`'s compilation
//! pipeline, simplified to this crate's two fixed architectures.
//!
//! `Architecture` runtime dispatch is a closed sum type ([`Lowering`])
//! wrapping a per-architecture [`CodeGen`], never a trait object, so the two
//! backends' code generation is monomorphized independently.

use crate::call_engine;
use crate::config::Flags;
use crate::error::CompileError;
use crate::ir::{Operation, RETURN_LABEL};
use crate::isa::amd64::Amd64Assembler;
use crate::isa::arm64::Arm64Assembler;
use crate::isa::Assembler;
use crate::lower::CodeGen;
use crate::module::{CompiledModule, ExecutableSegment, ModuleRef};
use crate::types::Architecture;

/// One function's compiled output, before it is copied into a module's
/// shared executable segment.
#[derive(Debug, Clone)]
pub struct CompiledFunctionCode {
    pub code: Vec<u8>,
    pub stack_pointer_ceil: u64,
}

enum Lowering {
    Amd64(CodeGen<Amd64Assembler>),
    Arm64(CodeGen<Arm64Assembler>),
}

impl Lowering {
    fn new(architecture: Architecture) -> Self {
        match architecture {
            Architecture::Amd64 => Lowering::Amd64(CodeGen::new(Amd64Assembler::new())),
            Architecture::Arm64 => Lowering::Arm64(CodeGen::new(Arm64Assembler::new())),
        }
    }

    fn lower_body(&mut self, ops: &[Operation]) -> Result<(), CompileError> {
        match self {
            Lowering::Amd64(cg) => lower_body(cg, ops),
            Lowering::Arm64(cg) => lower_body(cg, ops),
        }
    }

    fn stack_pointer_ceil(&self) -> u64 {
        match self {
            Lowering::Amd64(cg) => cg.stack.stack_pointer_ceil(),
            Lowering::Arm64(cg) => cg.stack.stack_pointer_ceil(),
        }
    }

    fn emit_prologue(&mut self, ceil: u64) {
        match self {
            Lowering::Amd64(cg) => call_engine::emit_prologue(&mut cg.asm, ceil),
            Lowering::Arm64(cg) => call_engine::emit_prologue(&mut cg.asm, ceil),
        }
    }

    fn into_code(self) -> Vec<u8> {
        match self {
            Lowering::Amd64(mut cg) => {
                finalize_return(&mut cg);
                cg.asm.finish()
            }
            Lowering::Arm64(mut cg) => {
                finalize_return(&mut cg);
                cg.asm.finish()
            }
        }
    }
}

/// Lower every operation in `ops`, honoring the dead-code-skip contract a
/// `Label` establishes (spec §4.3.5): operations between an unconditional
/// exit and the next live label are never emitted at all.
fn lower_body<A: Assembler>(cg: &mut CodeGen<A>, ops: &[Operation]) -> Result<(), CompileError> {
    let mut dead = false;
    for op in ops {
        if let Operation::Label { id } = op {
            dead = cg.lower_label(*id);
            continue;
        }
        if dead {
            continue;
        }
        lower_one(cg, op)?;
    }
    Ok(())
}

/// Bind the function's implicit return label at the current offset and
/// emit the shared epilogue there, whether it was reached by an explicit
/// `Return` or by falling off the end of the body.
fn finalize_return<A: Assembler>(cg: &mut CodeGen<A>) {
    let label = cg.asm_label_for(RETURN_LABEL);
    cg.asm.bind_label(label);
    call_engine::emit_epilogue(&mut cg.asm);
}

fn lower_one<A: Assembler>(cg: &mut CodeGen<A>, op: &Operation) -> Result<(), CompileError> {
    match op {
        Operation::Const { ty, bits } => cg.lower_const(*ty, *bits),
        Operation::Binary { ty, op } => cg.lower_binary(*ty, *op),
        Operation::Unary { ty, op } => cg.lower_unary(*ty, *op),
        Operation::Compare { ty, op } => cg.lower_compare(*ty, *op),
        Operation::Convert { op } => cg.lower_convert(*op),

        Operation::Load { ty, arg } => cg.lower_load(*ty, *arg),
        Operation::Load8 { ty, signed, arg } => {
            let _ = signed;
            cg.lower_load_narrow(1, crate::isa::OperandSize::S8, runtime_type(*ty), *arg)
        }
        Operation::Load16 { ty, signed, arg } => {
            let _ = signed;
            cg.lower_load_narrow(2, crate::isa::OperandSize::S16, runtime_type(*ty), *arg)
        }
        Operation::Load32 { signed, arg } => {
            let _ = signed;
            cg.lower_load_narrow(
                4,
                crate::isa::OperandSize::S32,
                crate::types::RuntimeValueType::I64,
                *arg,
            )
        }
        Operation::Store { ty, arg } => cg.lower_store(*ty, *arg),
        Operation::Store8 { arg } => cg.lower_store_narrow(1, crate::isa::OperandSize::S8, *arg),
        Operation::Store16 { arg } => cg.lower_store_narrow(2, crate::isa::OperandSize::S16, *arg),
        Operation::Store32 { arg } => cg.lower_store_narrow(4, crate::isa::OperandSize::S32, *arg),
        Operation::MemorySize => cg.lower_memory_size(),
        Operation::MemoryGrow => cg.lower_memory_grow(),

        Operation::GlobalGet { index } => cg.lower_global_get(*index),
        Operation::GlobalSet { index } => cg.lower_global_set(*index),

        Operation::Label { .. } => unreachable!("Label is handled by the caller"),
        Operation::Br { target } => cg.lower_br(*target),
        Operation::BrIf { then_target, else_target } => cg.lower_br_if(*then_target, *else_target),
        Operation::BrTable { targets, default } => cg.lower_br_table(targets, *default),
        Operation::Call { func_index } => cg.lower_call(*func_index),
        Operation::CallIndirect { type_index, table_index } => {
            cg.lower_call_indirect(*type_index, *table_index)
        }
        Operation::Return => cg.lower_return(),
        Operation::Unreachable => cg.lower_unreachable(),

        Operation::Pick { depth, is_v128 } => cg.lower_pick(*depth, *is_v128),
        Operation::Drop { start, end } => cg.lower_drop(*start, *end),
        Operation::Select => cg.lower_select(),
        Operation::Set { depth, is_v128 } => cg.lower_set(*depth, *is_v128),
        Operation::Swap { depth, is_v128 } => cg.lower_swap(*depth, *is_v128),

        Operation::V128Const { lo, hi } => cg.lower_v128_const(*lo, *hi),
        Operation::V128Binary { shape, op } => cg.lower_v128_binary(*shape, *op),
        Operation::V128Unary { shape, op } => cg.lower_v128_unary(*shape, *op),
        Operation::V128Compare { shape, op } => cg.lower_v128_compare(*shape, *op),
        Operation::V128Load { arg } => cg.lower_v128_load(*arg),
        Operation::V128LoadSplat { width, arg } => cg.lower_v128_load_splat(*width, *arg),
        Operation::V128LoadExtend { signed, arg } => cg.lower_v128_load_extend(*signed, *arg),
        Operation::V128Store { arg } => cg.lower_v128_store(*arg),
        Operation::V128Shuffle { lanes } => cg.lower_v128_shuffle(*lanes),
        Operation::V128Swizzle => cg.lower_v128_swizzle(),
        Operation::V128BitMask { shape } => cg.lower_v128_bitmask(*shape),
        Operation::V128ExtractLane { shape, lane, signed } => {
            cg.lower_v128_extract_lane(*shape, *lane, *signed)
        }
        Operation::V128ReplaceLane { shape, lane } => cg.lower_v128_replace_lane(*shape, *lane),
        Operation::V128Splat { shape } => cg.lower_v128_splat(*shape),

        Operation::AtomicLoad { width, arg } => cg.lower_atomic_load(*width, *arg),
        Operation::AtomicStore { width, arg } => cg.lower_atomic_store(*width, *arg),
        Operation::AtomicRmw { width, op, arg } => cg.lower_atomic_rmw(*width, *op, *arg),
        Operation::AtomicCmpxchg { width, arg } => cg.lower_atomic_cmpxchg(*width, *arg),
        Operation::AtomicFence => cg.lower_atomic_fence(),
        Operation::AtomicWait { width, arg } => cg.lower_atomic_wait(*width, *arg),
        Operation::AtomicNotify { arg } => cg.lower_atomic_notify(*arg),
    }
}

fn runtime_type(ty: crate::ir::NumType) -> crate::types::RuntimeValueType {
    match ty {
        crate::ir::NumType::I32 => crate::types::RuntimeValueType::I32,
        crate::ir::NumType::I64 => crate::types::RuntimeValueType::I64,
        crate::ir::NumType::F32 => crate::types::RuntimeValueType::F32,
        crate::ir::NumType::F64 => crate::types::RuntimeValueType::F64,
    }
}

/// Compile one function's IR for `architecture`.
///
/// Two passes: the prologue's stack-growth check needs
/// `stack_pointer_ceil` before the body that produces it has run, so the
/// body is lowered once to discover the ceiling (discarding that code),
/// then lowered again into a final buffer that opens with the correctly
/// parameterized prologue. Mirrors how a single-pass baseline compiler
/// resolves a forward-referenced frame size without a relocation pass.
pub fn compile_function(
    architecture: Architecture,
    ops: &[Operation],
) -> Result<CompiledFunctionCode, CompileError> {
    let _span = tracing::debug_span!("compile_function", ?architecture, ops = ops.len()).entered();
    log::debug!("compiling function: {} ops on {architecture:?}", ops.len());

    let mut discovery = Lowering::new(architecture);
    discovery.lower_body(ops)?;
    let ceil = discovery.stack_pointer_ceil();

    let mut final_pass = Lowering::new(architecture);
    final_pass.emit_prologue(ceil);
    final_pass.lower_body(ops)?;
    let code = final_pass.into_code();

    log::trace!("compiled function: {} code bytes, stack_pointer_ceil {ceil}", code.len());
    Ok(CompiledFunctionCode { code, stack_pointer_ceil: ceil })
}

#[cfg(feature = "parallel-compilation")]
fn compile_all(
    architecture: Architecture,
    functions: &[Vec<Operation>],
) -> Result<Vec<CompiledFunctionCode>, CompileError> {
    use rayon::prelude::*;
    functions
        .par_iter()
        .map(|ops| compile_function(architecture, ops))
        .collect()
}

#[cfg(not(feature = "parallel-compilation"))]
fn compile_all(
    architecture: Architecture,
    functions: &[Vec<Operation>],
) -> Result<Vec<CompiledFunctionCode>, CompileError> {
    functions.iter().map(|ops| compile_function(architecture, ops)).collect()
}

/// Compile every function in `functions` independently — in parallel via
/// `rayon` when the `parallel-compilation` feature is enabled (spec §5,
/// "a batch compile over a module may parallelize across functions") —
/// then lay the results end to end in one shared executable segment.
pub fn compile_module(
    architecture: Architecture,
    functions: &[Vec<Operation>],
    ensure_termination: bool,
    source: ModuleRef,
) -> Result<CompiledModule, CompileError> {
    let _span = tracing::debug_span!("compile_module", ?architecture, functions = functions.len()).entered();
    log::debug!("compiling module: {} function(s) on {architecture:?}", functions.len());

    let compiled = compile_all(architecture, functions)?;

    let mut blob = Vec::new();
    let mut metadata = Vec::with_capacity(compiled.len());
    for f in &compiled {
        let offset = blob.len() as u64;
        blob.extend_from_slice(&f.code);
        metadata.push((f.stack_pointer_ceil, offset));
    }

    let executable = ExecutableSegment::new(&blob)
        .map_err(|e| CompileError::ExecutableAllocation(e.to_string()))?;
    Ok(CompiledModule::new(executable, metadata, ensure_termination, source))
}

/// Binds a resolved `(Architecture, Flags)` pair to the entry points above,
/// the way `wasmtime_cranelift`'s `Compiler` wraps a concrete `TargetIsa`
/// rather than re-resolving it on every call.
pub struct Compiler {
    architecture: Architecture,
    flags: Flags,
}

impl Compiler {
    pub fn new(architecture: Architecture, flags: Flags) -> Self {
        Compiler { architecture, flags }
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn compile_function(&self, ops: &[Operation]) -> Result<CompiledFunctionCode, CompileError> {
        compile_function(self.architecture, ops)
    }

    pub fn compile_module(
        &self,
        functions: &[Vec<Operation>],
        source: ModuleRef,
    ) -> Result<CompiledModule, CompileError> {
        compile_module(self.architecture, functions, self.flags.ensure_termination, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ArithOp, Label, NumType};
    use crate::types::RuntimeValueType;

    fn add_one_ops() -> Vec<Operation> {
        vec![
            Operation::Const { ty: RuntimeValueType::I32, bits: 1 },
            Operation::Binary { ty: NumType::I32, op: ArithOp::Add },
            Operation::Return,
        ]
    }

    #[test]
    fn compiles_a_simple_function_on_both_architectures() {
        for arch in [Architecture::Amd64, Architecture::Arm64] {
            let compiled = compile_function(arch, &add_one_ops()).unwrap();
            assert!(!compiled.code.is_empty());
        }
    }

    #[test]
    fn dead_code_after_unconditional_branch_is_skipped() {
        let ops = vec![
            Operation::Br { target: Label(0) },
            // Unreachable: would underflow the stack if lowered.
            Operation::Drop { start: 0, end: 0 },
            Operation::Label { id: Label(0) },
            Operation::Return,
        ];
        let compiled = compile_function(Architecture::Amd64, &ops).unwrap();
        assert!(!compiled.code.is_empty());
    }

    #[test]
    fn compile_module_lays_out_functions_contiguously() {
        let functions = vec![add_one_ops(), add_one_ops()];
        let module =
            compile_module(Architecture::Amd64, &functions, false, ModuleRef(7)).unwrap();
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.functions[0].executable_offset, 0);
        assert!(module.functions[1].executable_offset > 0);
    }

    #[test]
    fn compiler_wrapper_reuses_resolved_architecture() {
        let compiler = Compiler::new(Architecture::Arm64, Flags::default());
        let compiled = compiler.compile_function(&add_one_ops()).unwrap();
        assert!(!compiled.code.is_empty());
    }
}
