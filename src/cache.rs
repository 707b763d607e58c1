//! On-disk code-cache serialization (spec §4.5), grounded on
//! `wasmtime-cache`'s version-stamped, checksummed entry format but
//! simplified to the one-module-per-entry layout the spec describes.
//! Little-endian throughout, via `byteorder`; integrity via `crc32fast`'s
//! IEEE polynomial.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::CacheError;
use crate::module::{CompiledModule, ExecutableSegment, ModuleRef};

const MAGIC: &[u8; 6] = b"WJITC\0";

/// Bumped whenever the on-disk format or the lowering layer's semantics
/// change in a way that invalidates previously cached code. A mismatch is
/// a [`CacheLookup::Stale`] result, not an error (spec §4.5/§8).
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of [`deserialize`]. Mirrors the three-way contract in spec §4.5:
/// a structurally valid, version-matching entry hits; a version mismatch
/// is stale (the caller evicts and recompiles); anything else is a
/// [`CacheError`] (the caller retains the entry and surfaces the error).
#[derive(Debug)]
pub enum CacheLookup {
    Hit(CompiledModule),
    Stale,
    /// The entry belongs to a host module, which is never cached; this is
    /// the result of asking anyway, not an error.
    NotCached,
}

/// Serialize `module`'s compiled output. Host modules (foreign-defined
/// functions with no executable segment of their own) are never cached:
/// this returns an empty buffer, matching deserialize's skip.
pub fn serialize(module: &CompiledModule, is_host_module: bool) -> Result<Vec<u8>, CacheError> {
    let _span = tracing::debug_span!("cache_serialize", functions = module.functions.len()).entered();

    if is_host_module {
        log::trace!("cache serialization skipped: host module");
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    out.write_all(MAGIC)?;

    let version = ENGINE_VERSION.as_bytes();
    out.write_u8(version.len() as u8)?;
    out.write_all(version)?;

    out.write_u8(module.ensure_termination as u8)?;

    out.write_u32::<LittleEndian>(module.functions.len() as u32)?;
    for f in &module.functions {
        out.write_u64::<LittleEndian>(f.stack_pointer_ceil)?;
        out.write_u64::<LittleEndian>(f.executable_offset)?;
    }

    let code = module.executable.bytes();
    out.write_u64::<LittleEndian>(code.len() as u64)?;
    out.write_all(code)?;

    let crc = crc32fast::hash(code);
    out.write_u32::<LittleEndian>(crc)?;

    Ok(out)
}

/// Deserialize a cache entry previously produced by [`serialize`].
/// `imported_function_count` shifts the recovered functions' indices past
/// the parent module's imports (spec §4.5, end-to-end scenario 5).
/// `is_host_module` short-circuits to [`CacheLookup::NotCached`] without
/// touching `bytes`, matching the "deserialization is skipped" contract.
pub fn deserialize(
    bytes: &[u8],
    imported_function_count: u32,
    is_host_module: bool,
    source: ModuleRef,
) -> Result<CacheLookup, CacheError> {
    let _span = tracing::debug_span!("cache_lookup", ?source, imported_function_count).entered();

    if is_host_module {
        log::trace!("cache lookup skipped: host module");
        return Ok(CacheLookup::NotCached);
    }

    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 6];
    read_exact(&mut cursor, &mut magic, bytes.len())?;
    if &magic != MAGIC {
        log::warn!("cache entry has an invalid header: {magic:?}");
        return Err(CacheError::InvalidHeader(format!("{magic:?}")));
    }

    let version_len = read_u8(&mut cursor, bytes.len())? as usize;
    let mut version_bytes = vec![0u8; version_len];
    read_exact(&mut cursor, &mut version_bytes, bytes.len())?;
    let version = String::from_utf8_lossy(&version_bytes);
    if version != ENGINE_VERSION {
        log::debug!("cache entry is stale: found version {version}, expected {ENGINE_VERSION}");
        return Ok(CacheLookup::Stale);
    }

    let ensure_termination = read_u8(&mut cursor, bytes.len())? != 0;

    let function_count = read_u32(&mut cursor, bytes.len())?;
    let mut function_metadata = Vec::with_capacity(function_count as usize);
    for _ in 0..function_count {
        let stack_pointer_ceil = read_u64(&mut cursor, bytes.len())?;
        let executable_offset = read_u64(&mut cursor, bytes.len())?;
        function_metadata.push((stack_pointer_ceil, executable_offset));
    }

    let executable_len = read_u64(&mut cursor, bytes.len())? as usize;
    let mut code = vec![0u8; executable_len];
    read_exact(&mut cursor, &mut code, bytes.len())?;

    let expected_crc = read_u32(&mut cursor, bytes.len())?;
    let computed_crc = crc32fast::hash(&code);
    if computed_crc != expected_crc {
        log::error!("cache entry checksum mismatch: expected {expected_crc:#x}, computed {computed_crc:#x}");
        return Err(CacheError::ChecksumMismatch {
            expected: expected_crc,
            computed: computed_crc,
        });
    }

    let executable = ExecutableSegment::new(&code)?;
    let module = CompiledModule::with_index_offset(
        executable,
        function_metadata,
        imported_function_count,
        ensure_termination,
        source,
    );
    log::debug!("cache hit: {function_count} function(s), {executable_len} executable bytes");
    Ok(CacheLookup::Hit(module))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], total_len: usize) -> Result<(), CacheError> {
    cursor.read_exact(buf).map_err(|_| CacheError::Truncated {
        expected: cursor.position() as usize + buf.len(),
        found: total_len,
    })
}

fn read_u8(cursor: &mut Cursor<&[u8]>, total_len: usize) -> Result<u8, CacheError> {
    cursor.read_u8().map_err(|_| CacheError::Truncated {
        expected: cursor.position() as usize + 1,
        found: total_len,
    })
}

fn read_u32(cursor: &mut Cursor<&[u8]>, total_len: usize) -> Result<u32, CacheError> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| CacheError::Truncated {
            expected: cursor.position() as usize + 4,
            found: total_len,
        })
}

fn read_u64(cursor: &mut Cursor<&[u8]>, total_len: usize) -> Result<u64, CacheError> {
    cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| CacheError::Truncated {
            expected: cursor.position() as usize + 8,
            found: total_len,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> CompiledModule {
        let code = (1u8..=10).collect::<Vec<u8>>();
        let executable = ExecutableSegment::new(&code).unwrap();
        CompiledModule::new(
            executable,
            vec![(12345, 0), (0xffffffff, 5)],
            false,
            ModuleRef(1),
        )
    }

    #[test]
    fn round_trip_preserves_metadata_and_offsets_indices() {
        let module = sample_module();
        let bytes = serialize(&module, false).unwrap();
        match deserialize(&bytes, 1, false, ModuleRef(1)).unwrap() {
            CacheLookup::Hit(recovered) => {
                assert_eq!(recovered.functions.len(), 2);
                assert_eq!(recovered.functions[0].index, 1);
                assert_eq!(recovered.functions[1].index, 2);
                assert_eq!(recovered.functions[0].stack_pointer_ceil, 12345);
                assert_eq!(recovered.functions[1].stack_pointer_ceil, 0xffffffff);
                assert_eq!(recovered.executable.bytes(), (1u8..=10).collect::<Vec<u8>>());
                assert!(!recovered.ensure_termination);
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn version_mismatch_is_stale_not_an_error() {
        let module = sample_module();
        let mut bytes = serialize(&module, false).unwrap();
        // Corrupt a byte inside the version string (index 7, just past the
        // 1-byte length prefix at index 6).
        bytes[7] = bytes[7].wrapping_add(1);
        match deserialize(&bytes, 0, false, ModuleRef(1)).unwrap() {
            CacheLookup::Stale => {}
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_crc_is_a_checksum_error() {
        let module = sample_module();
        let mut bytes = serialize(&module, false).unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xff;
        match deserialize(&bytes, 0, false, ModuleRef(1)) {
            Err(CacheError::ChecksumMismatch { .. }) => {}
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn host_modules_are_never_serialized() {
        let module = sample_module();
        let bytes = serialize(&module, true).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn truncated_entry_is_an_error_not_silently_accepted() {
        let module = sample_module();
        let bytes = serialize(&module, false).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            deserialize(truncated, 0, false, ModuleRef(1)),
            Err(CacheError::Truncated { .. })
        ));
    }
}
