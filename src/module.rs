//! Compiled-module ownership (spec §3, §9 "Cyclic references").
//!
//! The source representation this crate is modeled on lets a function
//! point back at its owning module. Rust ownership can't express that
//! cycle directly, so this module uses an arena-plus-index scheme instead:
//! [`CompiledModule`] owns the single executable segment and the
//! [`CompiledFunction`] table; each function carries its module's identity
//! (a cheap, copyable [`CompiledModuleId`]) rather than a reference back
//! into the arena, resolved by the caller going through
//! [`CompiledModule::function`].

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a [`CompiledModule`], cheap to copy and compare; stands in
/// for the back-reference a `CompiledFunction` would otherwise hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledModuleId(u64);

impl CompiledModuleId {
    fn next() -> Self {
        CompiledModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque handle to the source Wasm module definition. Binary parsing and
/// module instantiation/linking are outside this crate's scope (spec §1);
/// this is only an identifying token the cache and embedder can key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleRef(pub u64);

/// A single function's compiled output within its parent's code segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledFunction {
    pub module_id: CompiledModuleId,
    pub index: u32,
    pub executable_offset: u64,
    pub stack_pointer_ceil: u64,
}

/// A block of mapped memory holding one or more functions' machine code,
/// writable during compilation and made executable exactly once when the
/// module is finalized (spec §5, "marked executable after a one-shot
/// transition from writable").
pub struct ExecutableSegment {
    alloc: region::Allocation,
    len: usize,
}

// The allocation is immutable read+execute memory once constructed; no
// interior mutability is exposed, so sharing it across threads is sound —
// the same reasoning `wasmtime-jit`'s `CodeMemory` applies to its mmap.
unsafe impl Send for ExecutableSegment {}
unsafe impl Sync for ExecutableSegment {}

impl ExecutableSegment {
    /// Copy `code` into freshly allocated pages, then flip them from
    /// read-write to read-execute. `code` may be empty (a module with no
    /// functions still needs a valid, zero-length segment).
    pub fn new(code: &[u8]) -> std::io::Result<Self> {
        let len = code.len();
        let alloc_len = len.max(1);
        let mut alloc = region::alloc(alloc_len, region::Protection::READ_WRITE)?;
        if !code.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(code.as_ptr(), alloc.as_mut_ptr::<u8>(), len);
            }
        }
        region::protect(alloc.as_ptr::<u8>(), alloc.len(), region::Protection::READ_EXECUTE)?;
        Ok(ExecutableSegment { alloc, len })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.alloc.as_ptr::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read back the raw bytes, e.g. for cache serialization or a CRC
    /// check. Safe because the segment is never written to after
    /// construction.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl std::fmt::Debug for ExecutableSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableSegment")
            .field("len", &self.len)
            .field("ptr", &self.as_ptr())
            .finish()
    }
}

/// One Wasm module's compiled output: a single shared code segment plus
/// the per-function metadata needed to find entry points within it.
#[derive(Debug)]
pub struct CompiledModule {
    id: CompiledModuleId,
    pub executable: ExecutableSegment,
    pub functions: Vec<CompiledFunction>,
    pub ensure_termination: bool,
    pub source: ModuleRef,
}

impl CompiledModule {
    pub fn new(
        executable: ExecutableSegment,
        function_metadata: Vec<(u64, u64)>,
        ensure_termination: bool,
        source: ModuleRef,
    ) -> Self {
        Self::with_index_offset(executable, function_metadata, 0, ensure_termination, source)
    }

    /// Like [`Self::new`], but each function's `index` starts at
    /// `index_offset` instead of 0 — used when deserializing a cache
    /// entry, whose on-disk function indices are local to the module and
    /// must be shifted past the parent's imported functions (spec §4.5).
    pub fn with_index_offset(
        executable: ExecutableSegment,
        function_metadata: Vec<(u64, u64)>,
        index_offset: u32,
        ensure_termination: bool,
        source: ModuleRef,
    ) -> Self {
        let id = CompiledModuleId::next();
        let functions = function_metadata
            .into_iter()
            .enumerate()
            .map(|(i, (stack_pointer_ceil, executable_offset))| CompiledFunction {
                module_id: id,
                index: index_offset + i as u32,
                executable_offset,
                stack_pointer_ceil,
            })
            .collect();
        CompiledModule {
            id,
            executable,
            functions,
            ensure_termination,
            source,
        }
    }

    pub fn id(&self) -> CompiledModuleId {
        self.id
    }

    pub fn function(&self, index: u32) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.index == index)
    }

    /// Absolute pointer to `index`'s entry point within the code segment.
    pub fn entry_point(&self, index: u32) -> Option<*const u8> {
        self.function(index)
            .map(|f| unsafe { self.executable.as_ptr().add(f.executable_offset as usize) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functions_carry_their_modules_identity() {
        let exe = ExecutableSegment::new(&[0x90; 16]).unwrap();
        let module = CompiledModule::new(exe, vec![(4, 0), (4, 8)], false, ModuleRef(1));
        assert_eq!(module.functions[0].module_id, module.id());
        assert_eq!(module.functions[1].module_id, module.id());
        assert_eq!(module.function(1).unwrap().executable_offset, 8);
    }

    #[test]
    fn distinct_modules_get_distinct_ids() {
        let a = CompiledModule::new(ExecutableSegment::new(&[]).unwrap(), vec![], false, ModuleRef(1));
        let b = CompiledModule::new(ExecutableSegment::new(&[]).unwrap(), vec![], false, ModuleRef(2));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn entry_point_resolves_through_the_arena() {
        let exe = ExecutableSegment::new(&[0xC3; 4]).unwrap();
        let module = CompiledModule::new(exe, vec![(0, 2)], false, ModuleRef(1));
        let base = module.executable.as_ptr();
        let entry = module.entry_point(0).unwrap();
        assert_eq!(entry, unsafe { base.add(2) });
    }
}
