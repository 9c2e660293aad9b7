//! Error types for the injection and compaction core.

use thiserror::Error;

/// Result type alias using the core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
///
/// One variant per error kind; each kind maps to a stable process exit code
/// via [`Error::exit_code`] so the surface CLIs report failures uniformly.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing, empty, or structurally wrong inputs.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Unrecognized or unparseable binary.
    #[error("invalid binary format: {0}")]
    InvalidFormat(String),

    /// ELF parsed but violates an invariant the engine relies on.
    #[error("invalid elf: {0}")]
    InvalidElf(String),

    /// Named section was not found in the binary.
    #[error("section not found: {0}")]
    SectionNotFound(String),

    /// Named segment was not found in the binary.
    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    /// Logical resource was not found in the binary.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Marker scan completed without a hit. Benign for most callers and
    /// deliberately distinct from [`Error::Io`].
    #[error("marker not found")]
    MarkerNotFound,

    /// Underlying read/write/stat/rename failure, carrying the OS errno.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Output file existed but was empty, or a buffered write could not be
    /// flushed to disk.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// An allocation request could not be satisfied.
    #[error("allocation failed: {0} bytes")]
    AllocationFailed(u64),

    /// Compression produced no usable output.
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// Decompression produced no usable output.
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// A declared or produced size exceeds the safety cap.
    #[error("size limit exceeded: {size} > {limit}")]
    SizeLimitExceeded {
        /// Size that was requested or declared.
        size: u64,
        /// The cap that was violated.
        limit: u64,
    },

    /// Container names a compression algorithm this build does not carry.
    #[error("unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The host `codesign` utility failed (macOS only).
    #[error("codesign failed: {0}")]
    CodesignFailed(String),

    /// Cache entry exists but disagrees with its metadata.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),
}

impl Error {
    /// Create an invalid-arguments error with a message.
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create an invalid-format error with a message.
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create an invalid-ELF error naming the violated invariant.
    pub fn invalid_elf(msg: impl Into<String>) -> Self {
        Self::InvalidElf(msg.into())
    }

    /// Create a write-failed error with a message.
    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self::WriteFailed(msg.into())
    }

    /// Stable exit code for this error kind.
    ///
    /// `0` is success; codes start at 2 so that `1` stays free for generic
    /// CLI failures (bad flags, panics caught by the runtime).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArguments(_) => 2,
            Self::InvalidFormat(_) => 3,
            Self::InvalidElf(_) => 4,
            Self::SectionNotFound(_) => 5,
            Self::SegmentNotFound(_) => 6,
            Self::ResourceNotFound(_) => 7,
            Self::MarkerNotFound => 8,
            Self::Io(_) => 9,
            Self::WriteFailed(_) => 10,
            Self::AllocationFailed(_) => 11,
            Self::CompressFailed(_) => 12,
            Self::DecompressFailed(_) => 13,
            Self::SizeLimitExceeded { .. } => 14,
            Self::UnsupportedAlgorithm(_) => 15,
            Self::CodesignFailed(_) => 16,
            Self::CacheCorrupt(_) => 17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_elf_includes_invariant() {
        let err = Error::invalid_elf("big-endian ELF is not supported");
        assert!(err.to_string().contains("big-endian"));
    }

    #[test]
    fn test_size_limit_includes_both_numbers() {
        let err = Error::SizeLimitExceeded {
            size: 1024,
            limit: 512,
        };
        let msg = err.to_string();
        assert!(msg.contains("1024"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_exit_codes_are_stable_and_distinct() {
        let errors = [
            Error::invalid_args("x"),
            Error::invalid_format("x"),
            Error::invalid_elf("x"),
            Error::SectionNotFound("x".into()),
            Error::SegmentNotFound("x".into()),
            Error::ResourceNotFound("x".into()),
            Error::MarkerNotFound,
            Error::WriteFailed("x".into()),
            Error::AllocationFailed(8),
            Error::CompressFailed("x".into()),
            Error::DecompressFailed("x".into()),
            Error::SizeLimitExceeded { size: 2, limit: 1 },
            Error::UnsupportedAlgorithm("x".into()),
            Error::CodesignFailed("x".into()),
            Error::CacheCorrupt("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        codes.push(Error::Io(std::io::Error::other("x")).exit_code());
        let mut deduped = codes.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(codes.len(), deduped.len(), "exit codes must be distinct");
        assert!(codes.iter().all(|&c| c >= 2));
    }

    #[test]
    fn test_marker_not_found_is_not_io() {
        // Callers treat a clean miss differently from an I/O failure.
        assert_ne!(
            Error::MarkerNotFound.exit_code(),
            Error::Io(std::io::Error::other("x")).exit_code()
        );
    }
}
