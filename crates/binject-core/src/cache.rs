//! Content-addressed runtime cache.
//!
//! Layout: `<base>/<cache_key>/<binary_name>` plus a sibling
//! `.dlx-metadata.json`. The base directory resolves from the environment
//! in priority order: `SOCKET_DLX_DIR`, `SOCKET_HOME/_dlx`,
//! `$HOME/.socket/_dlx`, `<tmp>/.socket/_dlx`.
//!
//! The write side is stateless: the binary is streamed first, metadata
//! after, and a failed metadata write unlinks the binary so a partial
//! entry is never observable. The read side refuses symlinks
//! (`O_NOFOLLOW`) and rejects entries whose size or execute bits disagree
//! with expectations.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::atomic::create_dirs;
use crate::error::{Error, Result};
use crate::platform::{self, PlatformInfo};

/// Metadata file written next to each cached binary.
pub const METADATA_FILE: &str = ".dlx-metadata.json";

/// Metadata schema version.
pub const METADATA_VERSION: &str = "1.0.0";

/// Chunk size for streaming cache writes.
const WRITE_CHUNK: usize = 64 * 1024;

/// Name of the cached binary on this platform.
pub fn binary_name() -> &'static str {
    if cfg!(windows) {
        "node.exe"
    } else {
        "node"
    }
}

/// First 16 hex chars of SHA-512 over `bytes` (the first 8 digest bytes,
/// rendered lowercase).
pub fn compute_cache_key(bytes: &[u8]) -> String {
    let digest = Sha512::digest(bytes);
    hex_string(&digest[..8])
}

/// Full 128-hex-char SHA-512 over `bytes`.
pub fn compute_full_checksum(bytes: &[u8]) -> String {
    hex_string(&Sha512::digest(bytes))
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Resolve the cache base directory from the environment.
pub fn dlx_base_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SOCKET_DLX_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(home) = std::env::var_os("SOCKET_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join("_dlx");
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".socket").join("_dlx");
    }
    std::env::temp_dir().join(".socket").join("_dlx")
}

/// Path a cached binary for `cache_key` would live at. No existence check.
pub fn get_extracted_binary_path(cache_key: &str) -> PathBuf {
    dlx_base_dir().join(cache_key).join(binary_name())
}

/// Look up a cached binary, returning its path only when it exists with
/// the expected size and all execute bits set.
///
/// On Unix the entry is opened with `O_NOFOLLOW` so a symlinked entry is
/// rejected outright, and size/mode come from `fstat` on that descriptor.
/// The descriptor is closed before returning; callers should minimize the
/// window between this check and `exec`.
pub fn get_cached_binary_path(cache_key: &str, expected_size: u64) -> Option<PathBuf> {
    let path = get_extracted_binary_path(cache_key);
    if probe_entry(&path, expected_size) {
        Some(path)
    } else {
        None
    }
}

#[cfg(unix)]
fn probe_entry(path: &Path, expected_size: u64) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return false,
    };
    // SAFETY: c_path is a valid NUL-terminated string; the fd is closed on
    // every path out of this function.
    unsafe {
        let fd = libc::open(
            c_path.as_ptr(),
            libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return false;
        }
        let mut stat: libc::stat = std::mem::zeroed();
        let ok = libc::fstat(fd, &mut stat) == 0;
        libc::close(fd);
        if !ok {
            return false;
        }
        if (stat.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return false;
        }
        if stat.st_size as u64 != expected_size {
            return false;
        }
        // All three execute bits must be present.
        (stat.st_mode as u32 & 0o111) == 0o111
    }
}

#[cfg(not(unix))]
fn probe_entry(path: &Path, expected_size: u64) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() == expected_size,
        Err(_) => false,
    }
}

/// Origin of a cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Source kind, e.g. `"compressed-binary"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Path of the binary the payload was extracted from.
    pub path: String,
}

/// Compression details recorded for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraInfo {
    /// Size of the compressed payload.
    pub compressed_size: u64,
    /// Codec that produced it.
    pub compression_algorithm: String,
    /// `size / compressed_size`.
    pub compression_ratio: f64,
}

/// Schema of `.dlx-metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Schema version.
    pub version: String,
    /// The 16-hex cache key.
    pub cache_key: String,
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp_ms: u64,
    /// `sha512-<128 hex>` over the decompressed binary.
    pub checksum: String,
    /// Always `"sha512"`.
    pub checksum_algorithm: String,
    /// Platform name.
    pub platform: String,
    /// Architecture name.
    pub arch: String,
    /// libc flavor, absent when not applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libc: Option<String>,
    /// Size of the cached binary in bytes.
    pub size: u64,
    /// Where the payload came from.
    pub source: SourceInfo,
    /// Compression details.
    pub extra: ExtraInfo,
}

/// Write a decompressed binary into the cache and emit its metadata.
///
/// The binary is streamed in 64 KiB chunks with mode 0755; the metadata
/// JSON is written only after the binary is fully on disk. If the
/// metadata write fails the binary is unlinked so no partial entry
/// remains.
pub fn write_to_cache(
    cache_key: &str,
    bytes: &[u8],
    compressed_size: u64,
    source_path: &Path,
    checksum: &str,
    algorithm: &str,
) -> Result<PathBuf> {
    if cache_key.is_empty() || bytes.is_empty() {
        return Err(Error::invalid_args("empty cache key or payload"));
    }
    if algorithm != "lzfse" {
        return Err(Error::UnsupportedAlgorithm(algorithm.to_string()));
    }

    let entry_dir = dlx_base_dir().join(cache_key);
    create_dirs(&entry_dir)?;

    let bin_path = entry_dir.join(binary_name());
    stream_binary(&bin_path, bytes)?;

    let info = platform::detect();
    let meta = build_metadata(cache_key, bytes, compressed_size, source_path, checksum, &info);
    let meta_path = entry_dir.join(METADATA_FILE);
    if let Err(e) = write_metadata(&meta_path, &meta) {
        let _ = fs::remove_file(&bin_path);
        tracing::error!(
            path = %meta_path.display(),
            error = %e,
            "metadata write failed, cache entry removed"
        );
        return Err(e);
    }

    Ok(bin_path)
}

fn stream_binary(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    for chunk in bytes.chunks(WRITE_CHUNK) {
        file.write_all(chunk)?;
    }
    // A buffered write can defer disk-full to close; surface it here.
    file.sync_all()
        .map_err(|e| Error::write_failed(format!("{}: {e}", path.display())))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn build_metadata(
    cache_key: &str,
    bytes: &[u8],
    compressed_size: u64,
    source_path: &Path,
    checksum: &str,
    info: &PlatformInfo,
) -> CacheMetadata {
    let size = bytes.len() as u64;
    let ratio = if compressed_size > 0 {
        size as f64 / compressed_size as f64
    } else {
        0.0
    };
    CacheMetadata {
        version: METADATA_VERSION.to_string(),
        cache_key: cache_key.to_string(),
        timestamp_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
        checksum: format!("sha512-{checksum}"),
        checksum_algorithm: "sha512".to_string(),
        platform: info.platform.as_str().to_string(),
        arch: info.arch.as_str().to_string(),
        libc: info.libc.as_str().map(str::to_string),
        size,
        source: SourceInfo {
            kind: "compressed-binary".to_string(),
            path: source_path.to_string_lossy().to_string(),
        },
        extra: ExtraInfo {
            compressed_size,
            compression_algorithm: "lzfse".to_string(),
            compression_ratio: ratio,
        },
    }
}

fn write_metadata(path: &Path, meta: &CacheMetadata) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(meta)
        .map_err(|e| Error::write_failed(format!("metadata serialization: {e}")))?;
    json.push(b'\n');
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize env-dependent tests; the cache base comes from the
    /// process environment.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_cache_key_shape() {
        let key = compute_cache_key(b"some compressed bytes");
        assert_eq!(key.len(), 16);
        assert!(key.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
        // Keys are a prefix of the full checksum.
        let full = compute_full_checksum(b"some compressed bytes");
        assert_eq!(full.len(), 128);
        assert!(full.starts_with(&key));
    }

    #[test]
    fn test_cache_key_known_vector() {
        // SHA-512("abc") begins ddaf35a193617aba...
        assert_eq!(compute_cache_key(b"abc"), "ddaf35a193617aba");
    }

    #[test]
    fn test_base_dir_priority() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        std::env::set_var("SOCKET_DLX_DIR", dir.path());
        std::env::set_var("SOCKET_HOME", "/ignored");
        assert_eq!(dlx_base_dir(), dir.path());

        std::env::remove_var("SOCKET_DLX_DIR");
        assert_eq!(dlx_base_dir(), Path::new("/ignored").join("_dlx"));

        std::env::remove_var("SOCKET_HOME");
        let fallback = dlx_base_dir();
        assert!(fallback.ends_with(Path::new(".socket/_dlx")) || fallback.ends_with("_dlx"));
    }

    #[test]
    fn test_write_and_lookup() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SOCKET_DLX_DIR", dir.path());

        let payload = vec![0x42u8; 8192];
        let checksum = compute_full_checksum(&payload);
        let key = compute_cache_key(b"pretend-compressed");

        let bin = write_to_cache(
            &key,
            &payload,
            1024,
            Path::new("/opt/app/host-binary"),
            &checksum,
            "lzfse",
        )
        .unwrap();
        assert_eq!(fs::read(&bin).unwrap(), payload);

        // Metadata is present and well-formed.
        let meta_raw = fs::read(dir.path().join(&key).join(METADATA_FILE)).unwrap();
        let meta: CacheMetadata = serde_json::from_slice(&meta_raw).unwrap();
        assert_eq!(meta.version, METADATA_VERSION);
        assert_eq!(meta.cache_key, key);
        assert_eq!(meta.size, 8192);
        assert_eq!(meta.checksum, format!("sha512-{checksum}"));
        assert!(meta.extra.compression_ratio > 1.0);
        assert_eq!(meta.source.path, "/opt/app/host-binary");

        // Lookup succeeds with the right size, fails with the wrong one.
        assert!(get_cached_binary_path(&key, 8192).is_some());
        assert!(get_cached_binary_path(&key, 8191).is_none());

        std::env::remove_var("SOCKET_DLX_DIR");
    }

    #[test]
    fn test_lookup_rejects_missing_exec_bit() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SOCKET_DLX_DIR", dir.path());

        let payload = vec![1u8; 64];
        let checksum = compute_full_checksum(&payload);
        let key = compute_cache_key(b"exec-bit-test");
        let bin = write_to_cache(&key, &payload, 32, Path::new("/x"), &checksum, "lzfse").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&bin).unwrap().permissions();
            perms.set_mode(0o644);
            fs::set_permissions(&bin, perms).unwrap();
            assert!(get_cached_binary_path(&key, 64).is_none());

            // Even one cleared bit is a miss.
            let mut perms = fs::metadata(&bin).unwrap().permissions();
            perms.set_mode(0o754);
            fs::set_permissions(&bin, perms).unwrap();
            assert!(get_cached_binary_path(&key, 64).is_none());
        }
        let _ = bin;

        std::env::remove_var("SOCKET_DLX_DIR");
    }

    #[cfg(unix)]
    #[test]
    fn test_lookup_refuses_symlink() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SOCKET_DLX_DIR", dir.path());

        // A real executable file of the right size, reachable only via a
        // symlinked cache entry.
        let target = dir.path().join("real-binary");
        fs::write(&target, vec![9u8; 128]).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&target).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&target, perms).unwrap();
        }

        let key = compute_cache_key(b"symlink-test");
        let entry_dir = dir.path().join(&key);
        fs::create_dir_all(&entry_dir).unwrap();
        std::os::unix::fs::symlink(&target, entry_dir.join(binary_name())).unwrap();

        assert!(get_cached_binary_path(&key, 128).is_none());

        std::env::remove_var("SOCKET_DLX_DIR");
    }

    #[test]
    fn test_write_rejects_unknown_algorithm() {
        let err = write_to_cache(
            "abcd",
            b"data",
            1,
            Path::new("/x"),
            "00",
            "zstd",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_metadata_json_escapes_paths() {
        let meta = build_metadata(
            "k",
            b"xy",
            1,
            Path::new("/weird/\"quoted\"/path"),
            "00",
            &PlatformInfo {
                platform: crate::platform::Platform::Linux,
                arch: crate::platform::Arch::X64,
                libc: crate::platform::Libc::Glibc,
            },
        );
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\\\"quoted\\\""));
    }
}
