//! LZFSE compression codec with bounded decompression.
//!
//! Three operations: [`encode_buffer`], [`decode_buffer`] (dynamic output,
//! capped), and [`decode_buffer_sized`] (the decoded length must equal the
//! caller's expectation exactly — used when the container header's
//! uncompressed size is trusted).
//!
//! LZFSE is the only first-class codec. Decompression streams into a
//! bounded sink so a hostile payload can never allocate past
//! [`MAX_DECOMPRESSED_SIZE`], regardless of what its stream headers claim.

use std::io::{self, Write};

use lzfse_rust::{LzfseEncoder, LzfseRingDecoder};

use crate::error::{Error, Result};

/// Safety cap for decompressed payloads (512 MiB).
pub const MAX_DECOMPRESSED_SIZE: u64 = 512 * 1024 * 1024;

/// Compress `input` with LZFSE.
///
/// Fails with [`Error::CompressFailed`] when the compressed output would
/// not be strictly smaller than the input; an inflated container is never
/// emitted.
pub fn encode_buffer(input: &[u8]) -> Result<Vec<u8>> {
    if input.is_empty() {
        return Err(Error::invalid_args("cannot compress an empty buffer"));
    }

    let mut out = Vec::with_capacity(input.len() / 2);
    LzfseEncoder::default()
        .encode_bytes(input, &mut out)
        .map_err(|e| Error::CompressFailed(e.to_string()))?;

    if out.len() >= input.len() {
        tracing::debug!(
            input = input.len(),
            output = out.len(),
            "compressed output not smaller than input"
        );
        return Err(Error::CompressFailed(format!(
            "output ({} bytes) not smaller than input ({} bytes)",
            out.len(),
            input.len()
        )));
    }
    Ok(out)
}

/// Decompress `input`, growing the output as needed up to
/// [`MAX_DECOMPRESSED_SIZE`].
pub fn decode_buffer(input: &[u8]) -> Result<Vec<u8>> {
    decode_with_limit(input, MAX_DECOMPRESSED_SIZE)
}

/// Decompress `input` into a buffer that must come out at exactly
/// `expected_size` bytes.
///
/// Used when the caller already knows the uncompressed size from a trusted
/// container header; any other length is a [`Error::DecompressFailed`].
pub fn decode_buffer_sized(input: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    if expected_size > MAX_DECOMPRESSED_SIZE {
        return Err(Error::SizeLimitExceeded {
            size: expected_size,
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }
    let out = decode_with_limit(input, expected_size)?;
    if out.len() as u64 != expected_size {
        return Err(Error::DecompressFailed(format!(
            "decoded {} bytes, expected {}",
            out.len(),
            expected_size
        )));
    }
    Ok(out)
}

fn decode_with_limit(input: &[u8], limit: u64) -> Result<Vec<u8>> {
    if input.is_empty() {
        return Err(Error::invalid_args("cannot decompress an empty buffer"));
    }

    // Seed capacity at 4x the compressed size; the sink grows from there
    // but is hard-capped at `limit`.
    let initial = (input.len() as u64)
        .checked_mul(4)
        .unwrap_or(limit)
        .min(limit);
    let mut sink = BoundedSink::new(initial as usize, limit);

    let mut reader = input;
    let decode = LzfseRingDecoder::default().decode(&mut reader, &mut sink);
    if let Err(e) = decode {
        if sink.exceeded {
            return Err(Error::SizeLimitExceeded {
                size: limit + 1,
                limit,
            });
        }
        return Err(Error::DecompressFailed(e.to_string()));
    }
    Ok(sink.buf)
}

/// An owned output buffer that refuses to grow past its limit.
struct BoundedSink {
    buf: Vec<u8>,
    limit: u64,
    exceeded: bool,
}

impl BoundedSink {
    fn new(capacity: usize, limit: u64) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            limit,
            exceeded: false,
        }
    }
}

impl Write for BoundedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let projected = self.buf.len() as u64 + data.len() as u64;
        if projected > self.limit {
            self.exceeded = true;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "decompressed size limit exceeded",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
