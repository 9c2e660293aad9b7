//! Magic marker location in files and ELF PT_NOTE segments.
//!
//! Markers are byte-exact sentinels assembled at run time from three
//! compile-time parts so the literal never appears contiguously in the
//! tool binaries themselves. Searches are plain memory comparison; no
//! regex, no escaping.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

/// Marker for the self-extracting container header (40 bytes assembled).
///
/// Each part is stored NUL-terminated like a C literal; [`assemble`]
/// strips the terminator. The embedded NUL keeps the parts from forming
/// the contiguous marker in the tool binary's read-only data, wherever
/// the compiler places them.
pub const PRESSED_MARKER_PARTS: [&str; 3] =
    ["__SMOL_PRESSED__\0", "__CONTAINER__\0", "__MAGIC_V1_\0"];

/// Marker for the inner decompressor stub (33 bytes assembled).
pub const INFLATE_MARKER_PARTS: [&str; 3] = ["__SMOL_INFLATE__\0", "__STUB__\0", "_MAGIC_V1\0"];

/// Length of the assembled container marker.
pub const PRESSED_MARKER_LEN: usize = 40;

/// Length of the assembled stub marker.
pub const INFLATE_MARKER_LEN: usize = 33;

/// Page size used for the stream scan.
const SCAN_PAGE: usize = 4096;

/// Which offset a successful scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerPosition {
    /// Offset of the first marker byte.
    Start,
    /// Offset immediately after the marker.
    After,
}

/// Reconstruct a marker from its three parts, stripping the stored
/// terminator bytes.
pub fn assemble(parts: [&str; 3]) -> Vec<u8> {
    let mut marker = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        marker.extend_from_slice(part.trim_end_matches('\0').as_bytes());
    }
    marker
}

/// Scan an open file for a three-part marker, reading in 4 KiB pages and
/// overlapping successive pages by `marker_len - 1` bytes so a marker
/// split across a page boundary is still found.
///
/// Returns the offset selected by `pos`, or [`Error::MarkerNotFound`] when
/// the scan completes without a hit.
pub fn find_in_file(file: &mut File, parts: [&str; 3], pos: MarkerPosition) -> Result<u64> {
    let marker = assemble(parts);
    let mlen = marker.len();
    if mlen == 0 {
        return Err(Error::invalid_args("empty marker"));
    }

    file.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; SCAN_PAGE + mlen - 1];
    let mut carried = 0usize; // bytes kept from the previous page
    let mut buf_start: u64 = 0; // file offset of buf[0]

    loop {
        let n = read_up_to(file, &mut buf[carried..carried + SCAN_PAGE])?;
        if n == 0 {
            return Err(Error::MarkerNotFound);
        }
        let total = carried + n;

        if let Some(idx) = find_subslice(&buf[..total], &marker) {
            let start = buf_start + idx as u64;
            return Ok(match pos {
                MarkerPosition::Start => start,
                MarkerPosition::After => start + mlen as u64,
            });
        }

        let keep = (mlen - 1).min(total);
        buf.copy_within(total - keep..total, 0);
        buf_start += (total - keep) as u64;
        carried = keep;
    }
}

/// Open `path` and scan it for the marker.
pub fn find_in_path(path: &Path, parts: [&str; 3], pos: MarkerPosition) -> Result<u64> {
    let mut file = File::open(path)?;
    find_in_file(&mut file, parts, pos)
}

/// Scan the PT_NOTE segments of a 64-bit little-endian ELF for the marker
/// and return the absolute file offset of the marker start.
///
/// Every failure mode — big-endian ELF, non-64-bit ELF, a program header
/// table larger than 4 KiB, any I/O error — reports as
/// [`Error::MarkerNotFound`]: callers of this form only want to know
/// whether a structured hit exists.
pub fn find_in_elf_note(path: &Path, parts: [&str; 3]) -> Result<u64> {
    find_in_elf_note_inner(path, parts).ok_or(Error::MarkerNotFound)
}

fn find_in_elf_note_inner(path: &Path, parts: [&str; 3]) -> Option<u64> {
    let marker = assemble(parts);
    let mut file = File::open(path).ok()?;

    let mut ehdr = [0u8; 64];
    file.read_exact(&mut ehdr).ok()?;
    if ehdr[0..4] != crate::format::ELF_MAGIC {
        return None;
    }
    // EI_CLASS == ELFCLASS64, EI_DATA == ELFDATA2LSB
    if ehdr[4] != 2 || ehdr[5] != 1 {
        return None;
    }

    let e_phoff = u64::from_le_bytes(ehdr[32..40].try_into().unwrap());
    let e_phentsize = u16::from_le_bytes(ehdr[54..56].try_into().unwrap()) as usize;
    let e_phnum = u16::from_le_bytes(ehdr[56..58].try_into().unwrap()) as usize;
    if e_phentsize == 0 || e_phnum == 0 {
        return None;
    }

    let table_size = e_phentsize.checked_mul(e_phnum)?;
    if table_size > 4096 {
        return None;
    }
    let mut table = vec![0u8; table_size];
    file.seek(SeekFrom::Start(e_phoff)).ok()?;
    file.read_exact(&mut table).ok()?;

    const PT_NOTE: u32 = 4;
    for i in 0..e_phnum {
        let ph = &table[i * e_phentsize..(i + 1) * e_phentsize];
        let p_type = u32::from_le_bytes(ph[0..4].try_into().unwrap());
        if p_type != PT_NOTE {
            continue;
        }
        let p_offset = u64::from_le_bytes(ph[8..16].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(ph[32..40].try_into().unwrap());
        if p_filesz == 0 {
            continue;
        }

        let mut content = vec![0u8; usize::try_from(p_filesz).ok()?];
        file.seek(SeekFrom::Start(p_offset)).ok()?;
        file.read_exact(&mut content).ok()?;

        if let Some(idx) = find_subslice(&content, &marker) {
            return Some(p_offset + idx as u64);
        }
    }
    None
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// First occurrence of `needle` in `haystack` by memory comparison.
pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_marker_lengths() {
        assert_eq!(assemble(PRESSED_MARKER_PARTS).len(), PRESSED_MARKER_LEN);
        assert_eq!(assemble(INFLATE_MARKER_PARTS).len(), INFLATE_MARKER_LEN);
    }

    #[test]
    fn test_find_at_start_and_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let marker = assemble(PRESSED_MARKER_PARTS);

        let mut data = vec![0xaau8; 100];
        data.extend_from_slice(&marker);
        data.extend_from_slice(&[0x55u8; 100]);
        std::fs::write(&path, &data).unwrap();

        let mut f = File::open(&path).unwrap();
        assert_eq!(
            find_in_file(&mut f, PRESSED_MARKER_PARTS, MarkerPosition::Start).unwrap(),
            100
        );
        let mut f = File::open(&path).unwrap();
        assert_eq!(
            find_in_file(&mut f, PRESSED_MARKER_PARTS, MarkerPosition::After).unwrap(),
            100 + PRESSED_MARKER_LEN as u64
        );
    }

    #[test]
    fn test_find_across_page_boundary() {
        // 12 KiB file with the 40-byte marker split exactly across the
        // first 4 KiB read boundary.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundary.bin");
        let marker = assemble(PRESSED_MARKER_PARTS);

        let mut data = vec![0u8; 12 * 1024];
        data[4076..4076 + PRESSED_MARKER_LEN].copy_from_slice(&marker);
        std::fs::write(&path, &data).unwrap();

        assert_eq!(
            find_in_path(&path, PRESSED_MARKER_PARTS, MarkerPosition::Start).unwrap(),
            4076
        );
        assert_eq!(
            find_in_path(&path, PRESSED_MARKER_PARTS, MarkerPosition::After).unwrap(),
            4116
        );
    }

    #[test]
    fn test_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        assert!(matches!(
            find_in_path(&path, PRESSED_MARKER_PARTS, MarkerPosition::Start),
            Err(Error::MarkerNotFound)
        ));
    }

    #[test]
    fn test_marker_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.bin");
        let marker = assemble(INFLATE_MARKER_PARTS);
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![7u8; 9000]).unwrap();
        f.write_all(&marker).unwrap();
        drop(f);

        assert_eq!(
            find_in_path(&path, INFLATE_MARKER_PARTS, MarkerPosition::Start).unwrap(),
            9000
        );
    }

    #[test]
    fn test_elf_note_form_rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_elf.bin");
        std::fs::write(&path, vec![0u8; 256]).unwrap();
        assert!(matches!(
            find_in_elf_note(&path, PRESSED_MARKER_PARTS),
            Err(Error::MarkerNotFound)
        ));
    }

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"fg"), None);
        assert_eq!(find_subslice(b"ab", b"abc"), None);
    }

    #[test]
    fn test_markers_absent_from_own_binary() {
        // The three-part split exists so the assembled sentinels never
        // appear contiguously in a compiled tool binary. This binary
        // carries the parts; neither whole marker may be found in it.
        let exe = std::env::current_exe().unwrap();
        assert!(matches!(
            find_in_path(&exe, PRESSED_MARKER_PARTS, MarkerPosition::Start),
            Err(Error::MarkerNotFound)
        ));
        assert!(matches!(
            find_in_path(&exe, INFLATE_MARKER_PARTS, MarkerPosition::Start),
            Err(Error::MarkerNotFound)
        ));
    }
}
