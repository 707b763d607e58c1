//! Engine configuration (spec §1.3 in `SPEC_FULL.md`), grounded on
//! `cranelift-codegen`'s `settings::Flags`/`isa::Builder` split: target
//! selection is resolved once, up front, into a concrete, non-reflective
//! value, and the remaining knobs are plain fields on a `Flags`-like
//! struct rather than a string-keyed settings table (this crate has far
//! fewer knobs than Cranelift, so a string table would be overkill).

use crate::error::CompileError;
use crate::types::Architecture;

/// Cache-directory policy, mirroring `wasmtime::Config`'s cache toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePolicy {
    Disabled,
    Enabled { directory: std::path::PathBuf },
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Disabled
    }
}

/// Compilation-wide flags threaded through every function compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flags {
    /// Emit a termination check at loop headers and calls (spec §5).
    pub ensure_termination: bool,
    pub cache: CachePolicy,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            ensure_termination: false,
            cache: CachePolicy::default(),
        }
    }
}

/// Builds a [`Flags`] plus a resolved [`Architecture`], the way
/// `cranelift_codegen::isa::Builder` resolves a target triple into a
/// concrete `TargetIsa` before any compilation happens.
#[derive(Debug, Clone)]
pub struct IsaBuilder {
    architecture: Option<Architecture>,
    flags: Flags,
}

impl IsaBuilder {
    pub fn new() -> Self {
        IsaBuilder {
            architecture: None,
            flags: Flags::default(),
        }
    }

    /// Pin the target architecture explicitly, rather than detecting the
    /// host at [`Self::finish`] time.
    pub fn with_architecture(mut self, arch: Architecture) -> Self {
        self.architecture = Some(arch);
        self
    }

    pub fn with_ensure_termination(mut self, enabled: bool) -> Self {
        self.flags.ensure_termination = enabled;
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.flags.cache = policy;
        self
    }

    /// Resolve to a concrete `(Architecture, Flags)` pair, detecting the
    /// host architecture via `target-lexicon` if none was pinned. Returns
    /// an error rather than panicking on an unsupported host (spec §6
    /// "Environment and configuration").
    pub fn finish(self) -> Result<(Architecture, Flags), CompileError> {
        let arch = match self.architecture {
            Some(a) => a,
            None => Architecture::host()?,
        };
        Ok((arch, self.flags))
    }
}

impl Default for IsaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_architecture_is_not_overridden_by_host_detection() {
        let (arch, flags) = IsaBuilder::new()
            .with_architecture(Architecture::Arm64)
            .with_ensure_termination(true)
            .finish()
            .unwrap();
        assert_eq!(arch, Architecture::Arm64);
        assert!(flags.ensure_termination);
    }

    #[test]
    fn default_cache_policy_is_disabled() {
        assert_eq!(Flags::default().cache, CachePolicy::Disabled);
    }
}
