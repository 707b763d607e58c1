//! Error taxonomy for the two fallible boundaries described in the design:
//! compiling a function, and reading/writing a code-cache entry.
//!
//! Runtime faults and host-service requests are *not* represented here —
//! per the cooperative-exit protocol they never unwind through Rust's
//! `Result` machinery, they are conveyed exclusively via
//! [`crate::call_engine::NativeCallStatusCode`] written into the
//! [`crate::call_engine::CallEngine`] exit context.

use thiserror::Error;

/// Errors that can occur while lowering a single function's IR.
///
/// No partial code is ever installed when one of these is returned: the
/// caller discards the in-progress [`crate::isa::Assembler`] buffer for
/// that function.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("register allocation budget exceeded while lowering {0}")]
    RegisterBudgetExceeded(String),

    #[error("branch to undefined or out-of-scope label {0}")]
    InvalidBranchTarget(u32),

    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        expected: crate::types::RuntimeValueType,
        found: crate::types::RuntimeValueType,
    },

    #[error("unsupported host architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("failed to allocate executable memory: {0}")]
    ExecutableAllocation(String),
}

/// Errors surfaced while deserializing a code-cache entry.
///
/// Per spec §4.5/§8: a stale-version cache is *not* an error (see
/// [`crate::cache::CacheLookup::Stale`]); only I/O, header, and checksum
/// failures are represented here, and the caller is told whether it may
/// evict the entry (`Truncated`/`ChecksumMismatch` => surfaced, entry kept;
/// `Io` => surfaced, caller may retry).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid cache header: {0}")]
    InvalidHeader(String),

    #[error("cache entry truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("cache checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
}
