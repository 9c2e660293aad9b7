//! Self-extracting container encode/decode.
//!
//! Layout (little-endian, fixed width):
//!
//! ```text
//! offset  size   field
//!   0     40     magic marker (reconstructed at run time)
//!  40      8     compressed_size   (u64 LE)
//!  48      8     uncompressed_size (u64 LE)
//!  56     16     cache_key ASCII hex (not NUL-terminated)
//!  72      1     platform byte  {0=darwin,1=linux,2=win32}
//!  73      1     arch byte      {0=x64,1=arm64}
//!  74      1     libc byte      {0=n/a,1=glibc,2=musl}
//!  75      N     compressed bytes (LZFSE)
//! ```
//!
//! The cache key is derived from the *compressed* bytes, so re-encoding
//! the same payload reproduces the same key.

use crate::cache;
use crate::codec::MAX_DECOMPRESSED_SIZE;
use crate::error::{Error, Result};
use crate::marker::{self, PRESSED_MARKER_LEN, PRESSED_MARKER_PARTS};
use crate::platform::{Arch, Libc, Platform, PlatformInfo};

/// Total header size preceding the compressed bytes.
pub const HEADER_LEN: usize = 75;

/// Length of the ASCII-hex cache key field.
pub const CACHE_KEY_LEN: usize = 16;

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Size of the compressed payload that follows the header.
    pub compressed_size: u64,
    /// Size the payload decompresses to.
    pub uncompressed_size: u64,
    /// First 16 hex chars of SHA-512 over the compressed bytes.
    pub cache_key: String,
    /// Platform the payload was built for.
    pub platform: Platform,
    /// Architecture the payload was built for.
    pub arch: Arch,
    /// libc flavor of the payload (Linux only).
    pub libc: Libc,
}

/// Build a container from compressed bytes and payload metadata.
pub fn encode(compressed: &[u8], uncompressed_size: u64, info: &PlatformInfo) -> Result<Vec<u8>> {
    if compressed.is_empty() {
        return Err(Error::invalid_args("empty compressed payload"));
    }
    if compressed.len() as u64 >= uncompressed_size {
        return Err(Error::invalid_args(format!(
            "compressed size {} not smaller than uncompressed size {}",
            compressed.len(),
            uncompressed_size
        )));
    }
    if uncompressed_size > MAX_DECOMPRESSED_SIZE {
        return Err(Error::SizeLimitExceeded {
            size: uncompressed_size,
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }
    let total = HEADER_LEN
        .checked_add(compressed.len())
        .ok_or(Error::AllocationFailed(u64::MAX))?;

    let cache_key = cache::compute_cache_key(compressed);

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&marker::assemble(PRESSED_MARKER_PARTS));
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.extend_from_slice(cache_key.as_bytes());
    out.push(info.platform.to_byte());
    out.push(info.arch.to_byte());
    out.push(info.libc.to_byte());
    out.extend_from_slice(compressed);
    debug_assert_eq!(out.len(), total);
    Ok(out)
}

/// Parse a container, returning the header and a view of the compressed
/// bytes.
///
/// `bytes` may extend past the container (note padding, section tail);
/// the view is bounded by the declared compressed size. The declared
/// uncompressed size is validated against [`MAX_DECOMPRESSED_SIZE`]
/// before anything is allocated.
pub fn decode(bytes: &[u8]) -> Result<(ContainerHeader, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::invalid_format(format!(
            "container truncated: {} bytes, need at least {HEADER_LEN}",
            bytes.len()
        )));
    }
    let magic = marker::assemble(PRESSED_MARKER_PARTS);
    if bytes[..PRESSED_MARKER_LEN] != magic[..] {
        return Err(Error::invalid_format("container magic mismatch"));
    }

    let compressed_size = u64::from_le_bytes(bytes[40..48].try_into().unwrap());
    let uncompressed_size = u64::from_le_bytes(bytes[48..56].try_into().unwrap());
    let key_bytes = &bytes[56..72];
    let platform = Platform::from_byte(bytes[72])?;
    let arch = Arch::from_byte(bytes[73])?;
    let libc = Libc::from_byte(bytes[74])?;

    if uncompressed_size > MAX_DECOMPRESSED_SIZE {
        return Err(Error::SizeLimitExceeded {
            size: uncompressed_size,
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }
    if compressed_size == 0 || compressed_size >= uncompressed_size {
        return Err(Error::invalid_format(format!(
            "bad container sizes: compressed {compressed_size}, uncompressed {uncompressed_size}"
        )));
    }

    let key_ok = key_bytes
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
    if !key_ok {
        return Err(Error::invalid_format("cache key is not lowercase hex"));
    }
    let cache_key = String::from_utf8(key_bytes.to_vec()).expect("validated ascii");

    let body_len = usize::try_from(compressed_size)
        .map_err(|_| Error::AllocationFailed(compressed_size))?;
    let available = bytes.len() - HEADER_LEN;
    if body_len > available {
        return Err(Error::invalid_format(format!(
            "container declares {body_len} compressed bytes but only {available} are present"
        )));
    }

    let header = ContainerHeader {
        compressed_size,
        uncompressed_size,
        cache_key,
        platform,
        arch,
        libc,
    };
    Ok((header, &bytes[HEADER_LEN..HEADER_LEN + body_len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn info() -> PlatformInfo {
        PlatformInfo {
            platform: Platform::Linux,
            arch: Arch::X64,
            libc: Libc::Glibc,
        }
    }

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 64) as u8).collect()
    }

    #[test]
    fn test_roundtrip() {
        let payload = compressible(200_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let container = encode(&compressed, payload.len() as u64, &info()).unwrap();

        let (header, body) = decode(&container).unwrap();
        assert_eq!(header.compressed_size, compressed.len() as u64);
        assert_eq!(header.uncompressed_size, payload.len() as u64);
        assert_eq!(header.platform, Platform::Linux);
        assert_eq!(header.arch, Arch::X64);
        assert_eq!(header.libc, Libc::Glibc);
        assert_eq!(header.cache_key, cache::compute_cache_key(&compressed));
        assert_eq!(body, &compressed[..]);

        let decoded = codec::decode_buffer_sized(body, header.uncompressed_size).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_tolerates_trailing_padding() {
        let payload = compressible(50_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let mut container = encode(&compressed, payload.len() as u64, &info()).unwrap();
        container.extend_from_slice(&[0u8; 37]);

        let (header, body) = decode(&container).unwrap();
        assert_eq!(body.len() as u64, header.compressed_size);
    }

    #[test]
    fn test_encode_key_is_deterministic() {
        let payload = compressible(10_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let a = encode(&compressed, payload.len() as u64, &info()).unwrap();
        let b = encode(&compressed, payload.len() as u64, &info()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut container = vec![0u8; HEADER_LEN + 10];
        container[0] = b'X';
        assert!(matches!(
            decode(&container),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversize_declaration_before_alloc() {
        let payload = compressible(10_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let mut container = encode(&compressed, payload.len() as u64, &info()).unwrap();
        // Forge an uncompressed size over the cap.
        container[48..56].copy_from_slice(&(MAX_DECOMPRESSED_SIZE + 1).to_le_bytes());
        assert!(matches!(
            decode(&container),
            Err(Error::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_metadata_byte() {
        let payload = compressible(10_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let mut container = encode(&compressed, payload.len() as u64, &info()).unwrap();
        container[72] = 9;
        assert!(matches!(decode(&container), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let payload = compressible(10_000);
        let compressed = codec::encode_buffer(&payload).unwrap();
        let container = encode(&compressed, payload.len() as u64, &info()).unwrap();
        let cut = &container[..container.len() - 5];
        assert!(matches!(decode(cut), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_encode_rejects_inflated_input() {
        let err = encode(&[1, 2, 3, 4], 4, &info()).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }
}
