//! Ahead-of-time WebAssembly compiler backend: value-location tracking,
//! per-opcode lowering, the `CallEngine` call/ABI layer, and code-cache
//! serialization for AMD64 and ARM64.
//!
//! This crate compiles an already-validated, already-linearized IR stream
//! (see [`ir::Operation`]) into position-independent machine code. Parsing
//! the Wasm binary format, module instantiation and linking, and running
//! the compiled code are all the embedder's responsibility.

pub mod cache;
pub mod call_engine;
pub mod compiler;
pub mod config;
pub mod error;
pub mod ir;
pub mod isa;
pub mod lower;
pub mod module;
pub mod regalloc;
pub mod types;
pub mod value_stack;

pub use compiler::{compile_function, compile_module, CompiledFunctionCode, Compiler};
pub use config::{CachePolicy, Flags, IsaBuilder};
pub use error::{CacheError, CompileError};
pub use ir::Operation;
pub use module::{CompiledFunction, CompiledModule, CompiledModuleId, ExecutableSegment, ModuleRef};
pub use types::Architecture;
