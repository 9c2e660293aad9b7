//! Single-executable-application fuse flipping.
//!
//! Host binaries carry a fixed ASCII sentinel ending in `:0`. Flipping
//! the final byte to `'1'` arms embedded-resource mode. Only that one
//! byte is ever mutated, and at most once per call; not finding the
//! sentinel is not an error (the host may already be armed, or may not be
//! a SEA host at all).

use crate::marker::find_subslice;
use crate::resource::Resource;

const FUSE_PREFIX: &str = "NODE_SEA_FUSE_";
const FUSE_HEX: &str = "fce680ab2cc467b6e072b8b5df1996b2";

/// The unflipped sentinel, assembled at run time.
pub fn unflipped_sentinel() -> Vec<u8> {
    let mut s = Vec::with_capacity(FUSE_PREFIX.len() + FUSE_HEX.len() + 2);
    s.extend_from_slice(FUSE_PREFIX.as_bytes());
    s.extend_from_slice(FUSE_HEX.as_bytes());
    s.extend_from_slice(b":0");
    s
}

/// Scan a raw in-memory binary for the unflipped sentinel and flip its
/// last byte. Returns whether a flip happened.
///
/// Well-formed hosts carry at most one sentinel; the contract is "mutate
/// at most one", so the scan stops at the first match.
pub fn flip_raw(buf: &mut [u8]) -> bool {
    let sentinel = unflipped_sentinel();
    match find_subslice(buf, &sentinel) {
        Some(idx) => {
            buf[idx + sentinel.len() - 1] = b'1';
            tracing::debug!(offset = idx, "fuse flipped");
            true
        }
        None => false,
    }
}

/// Whether an injection should attempt a fuse flip.
///
/// Returns false when no resource is actually being installed (empty
/// payload), when the resource kind does not arm the fuse, or when the
/// resource already exists in the host (re-injection is idempotent and
/// the fuse was flipped the first time).
pub fn should_flip_fuse(resource: Resource, payload: &[u8], already_present: bool) -> bool {
    if payload.is_empty() {
        return false;
    }
    if !resource.arms_fuse() {
        return false;
    }
    !already_present
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip_raw_mutates_last_byte_only() {
        let sentinel = unflipped_sentinel();
        let mut buf = vec![0u8; 64];
        buf.extend_from_slice(&sentinel);
        buf.extend_from_slice(&[0u8; 64]);
        let before = buf.clone();

        assert!(flip_raw(&mut buf));

        let flip_at = 64 + sentinel.len() - 1;
        for (i, (a, b)) in before.iter().zip(buf.iter()).enumerate() {
            if i == flip_at {
                assert_eq!(*a, b'0');
                assert_eq!(*b, b'1');
            } else {
                assert_eq!(a, b, "byte {i} must be untouched");
            }
        }
    }

    #[test]
    fn test_flip_raw_absent_is_benign() {
        let mut buf = vec![0xffu8; 256];
        let before = buf.clone();
        assert!(!flip_raw(&mut buf));
        assert_eq!(buf, before);
    }

    #[test]
    fn test_flip_raw_ignores_already_flipped() {
        let mut sentinel = unflipped_sentinel();
        *sentinel.last_mut().unwrap() = b'1';
        let mut buf = sentinel.clone();
        assert!(!flip_raw(&mut buf));
        assert_eq!(buf, sentinel);
    }

    #[test]
    fn test_flip_raw_first_match_only() {
        let sentinel = unflipped_sentinel();
        let mut buf = Vec::new();
        buf.extend_from_slice(&sentinel);
        buf.extend_from_slice(&sentinel);
        assert!(flip_raw(&mut buf));
        // Second copy untouched.
        assert_eq!(&buf[sentinel.len()..], &sentinel[..]);
    }

    #[test]
    fn test_should_flip_policy() {
        assert!(should_flip_fuse(Resource::NodeSeaBlob, b"blob", false));
        assert!(should_flip_fuse(Resource::SmolVfsBlob, b"blob", false));
        assert!(!should_flip_fuse(Resource::NodeSeaBlob, b"", false));
        assert!(!should_flip_fuse(Resource::NodeSeaBlob, b"blob", true));
        assert!(!should_flip_fuse(Resource::PressedData, b"blob", false));
    }

    #[test]
    fn test_sentinel_shape() {
        let s = unflipped_sentinel();
        assert!(s.starts_with(b"NODE_SEA_FUSE_"));
        assert!(s.ends_with(b":0"));
        // Prefix + 32 hex chars + ":0".
        assert_eq!(s.len(), 14 + 32 + 2);
    }
}
