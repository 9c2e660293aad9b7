//! ELF64 model and the PT_NOTE injection engine.
//!
//! Two disjoint writers are exposed:
//!
//! - [`reuse_multi_ptnote`] rewrites an *existing* PT_NOTE entry in place
//!   and appends the note payload at the end of the file. The Program
//!   Header Table never moves, which is what statically-linked glibc
//!   stubs require.
//! - [`write_with_notes`] adds fresh PT_NOTE + PT_LOAD pairs through the
//!   [`ElfFile`] model, relocating the PHT to the end of the file. This
//!   is the writer for dynamically linked hosts that look resources up
//!   via `dl_iterate_phdr()`.
//!
//! Only 64-bit little-endian ELF is written. Reads of other classes are
//! tolerated just far enough to reject them with a precise error.

use crate::error::{Error, Result};
use crate::format::ELF_MAGIC;

/// Program header types.
pub const PT_LOAD: u32 = 1;
/// Dynamic linking information.
pub const PT_DYNAMIC: u32 = 2;
/// Interpreter path. Its presence is the engine's definition of
/// "dynamically linked": static-PIE binaries carry PT_DYNAMIC but no
/// PT_INTERP and must be treated as static.
pub const PT_INTERP: u32 = 3;
/// Note segment.
pub const PT_NOTE: u32 = 4;
/// Program header table self-reference.
pub const PT_PHDR: u32 = 6;

/// Readable segment flag.
pub const PF_R: u32 = 4;

/// Note section type.
pub const SHT_NOTE: u32 = 7;
/// Section occupies memory at run time.
pub const SHF_ALLOC: u64 = 0x2;

/// Size of an `Elf64_Ehdr`.
pub const EHDR_SIZE: usize = 64;
/// Size of an `Elf64_Phdr`.
pub const PHDR_SIZE: usize = 56;
/// Size of an `Elf64_Shdr`.
pub const SHDR_SIZE: usize = 64;

/// Defensive cap on the program header table (malformed PHT guard).
const MAX_PHT_BYTES: usize = 4096;

/// Base virtual address for notes reused into static binaries. Extending
/// a PT_LOAD there would force the loader to map the whole gap, so the
/// note gets an address above every loaded segment instead.
const STATIC_NOTE_VADDR_BASE: u64 = 0x1000_0000;

const PAGE: u64 = 0x1000;

fn align_up(v: u64, a: u64) -> u64 {
    (v + a - 1) & !(a - 1)
}

// ---------------------------------------------------------------------------
// Fixed-width header structs
// ---------------------------------------------------------------------------

/// ELF64 file header.
#[derive(Debug, Clone)]
pub struct Elf64Header {
    /// Identification bytes, including class and data encoding.
    pub e_ident: [u8; 16],
    /// Object file type.
    pub e_type: u16,
    /// Target machine.
    pub e_machine: u16,
    /// Object file version.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// Program header table file offset.
    pub e_phoff: u64,
    /// Section header table file offset.
    pub e_shoff: u64,
    /// Processor-specific flags.
    pub e_flags: u32,
    /// ELF header size.
    pub e_ehsize: u16,
    /// Program header entry size.
    pub e_phentsize: u16,
    /// Program header entry count.
    pub e_phnum: u16,
    /// Section header entry size.
    pub e_shentsize: u16,
    /// Section header entry count.
    pub e_shnum: u16,
    /// Section name string table index.
    pub e_shstrndx: u16,
}

impl Elf64Header {
    /// Parse and validate a 64-bit little-endian ELF header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EHDR_SIZE {
            return Err(Error::invalid_elf("file shorter than the ELF header"));
        }
        if data[0..4] != ELF_MAGIC {
            return Err(Error::invalid_elf("bad ELF magic"));
        }
        if data[4] != 2 {
            return Err(Error::invalid_elf("only 64-bit ELF is supported"));
        }
        if data[5] != 1 {
            return Err(Error::invalid_elf("only little-endian ELF is supported"));
        }
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[0..16]);
        Ok(Self {
            e_ident,
            e_type: u16::from_le_bytes(data[16..18].try_into().unwrap()),
            e_machine: u16::from_le_bytes(data[18..20].try_into().unwrap()),
            e_version: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_shoff: u64::from_le_bytes(data[40..48].try_into().unwrap()),
            e_flags: u32::from_le_bytes(data[48..52].try_into().unwrap()),
            e_ehsize: u16::from_le_bytes(data[52..54].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes(data[54..56].try_into().unwrap()),
            e_phnum: u16::from_le_bytes(data[56..58].try_into().unwrap()),
            e_shentsize: u16::from_le_bytes(data[58..60].try_into().unwrap()),
            e_shnum: u16::from_le_bytes(data[60..62].try_into().unwrap()),
            e_shstrndx: u16::from_le_bytes(data[62..64].try_into().unwrap()),
        })
    }

    /// Serialize into the first 64 bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&self.e_ident);
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.e_machine.to_le_bytes());
        out[20..24].copy_from_slice(&self.e_version.to_le_bytes());
        out[24..32].copy_from_slice(&self.e_entry.to_le_bytes());
        out[32..40].copy_from_slice(&self.e_phoff.to_le_bytes());
        out[40..48].copy_from_slice(&self.e_shoff.to_le_bytes());
        out[48..52].copy_from_slice(&self.e_flags.to_le_bytes());
        out[52..54].copy_from_slice(&self.e_ehsize.to_le_bytes());
        out[54..56].copy_from_slice(&self.e_phentsize.to_le_bytes());
        out[56..58].copy_from_slice(&self.e_phnum.to_le_bytes());
        out[58..60].copy_from_slice(&self.e_shentsize.to_le_bytes());
        out[60..62].copy_from_slice(&self.e_shnum.to_le_bytes());
        out[62..64].copy_from_slice(&self.e_shstrndx.to_le_bytes());
    }
}

/// ELF64 program header entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type.
    pub p_type: u32,
    /// Segment flags.
    pub p_flags: u32,
    /// File offset.
    pub p_offset: u64,
    /// Virtual address.
    pub p_vaddr: u64,
    /// Physical address.
    pub p_paddr: u64,
    /// Bytes in the file image.
    pub p_filesz: u64,
    /// Bytes in the memory image.
    pub p_memsz: u64,
    /// Alignment.
    pub p_align: u64,
}

impl ProgramHeader {
    /// Parse one entry.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PHDR_SIZE {
            return Err(Error::invalid_elf("truncated program header"));
        }
        Ok(Self {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_paddr: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
            p_align: u64::from_le_bytes(data[48..56].try_into().unwrap()),
        })
    }

    /// Serialize one entry.
    pub fn to_bytes(&self) -> [u8; PHDR_SIZE] {
        let mut out = [0u8; PHDR_SIZE];
        out[0..4].copy_from_slice(&self.p_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.p_flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.p_offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.p_vaddr.to_le_bytes());
        out[24..32].copy_from_slice(&self.p_paddr.to_le_bytes());
        out[32..40].copy_from_slice(&self.p_filesz.to_le_bytes());
        out[40..48].copy_from_slice(&self.p_memsz.to_le_bytes());
        out[48..56].copy_from_slice(&self.p_align.to_le_bytes());
        out
    }
}

/// ELF64 section header entry.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    /// Offset into the section name string table.
    pub sh_name: u32,
    /// Section type.
    pub sh_type: u32,
    /// Section flags.
    pub sh_flags: u64,
    /// Virtual address.
    pub sh_addr: u64,
    /// File offset.
    pub sh_offset: u64,
    /// Size in bytes.
    pub sh_size: u64,
    /// Type-specific link.
    pub sh_link: u32,
    /// Type-specific info.
    pub sh_info: u32,
    /// Alignment.
    pub sh_addralign: u64,
    /// Entry size for table sections.
    pub sh_entsize: u64,
}

impl SectionHeader {
    /// Parse one entry.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SHDR_SIZE {
            return Err(Error::invalid_elf("truncated section header"));
        }
        Ok(Self {
            sh_name: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            sh_type: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            sh_flags: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            sh_addr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            sh_offset: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            sh_size: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            sh_link: u32::from_le_bytes(data[40..44].try_into().unwrap()),
            sh_info: u32::from_le_bytes(data[44..48].try_into().unwrap()),
            sh_addralign: u64::from_le_bytes(data[48..56].try_into().unwrap()),
            sh_entsize: u64::from_le_bytes(data[56..64].try_into().unwrap()),
        })
    }

    /// Serialize one entry.
    pub fn to_bytes(&self) -> [u8; SHDR_SIZE] {
        let mut out = [0u8; SHDR_SIZE];
        out[0..4].copy_from_slice(&self.sh_name.to_le_bytes());
        out[4..8].copy_from_slice(&self.sh_type.to_le_bytes());
        out[8..16].copy_from_slice(&self.sh_flags.to_le_bytes());
        out[16..24].copy_from_slice(&self.sh_addr.to_le_bytes());
        out[24..32].copy_from_slice(&self.sh_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.sh_size.to_le_bytes());
        out[40..44].copy_from_slice(&self.sh_link.to_le_bytes());
        out[44..48].copy_from_slice(&self.sh_info.to_le_bytes());
        out[48..56].copy_from_slice(&self.sh_addralign.to_le_bytes());
        out[56..64].copy_from_slice(&self.sh_entsize.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

/// One note record: owner name, descriptor bytes, and note type.
/// Custom notes written by this engine use type 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteEntry {
    /// Owner name (without the trailing NUL).
    pub name: String,
    /// Descriptor bytes.
    pub desc: Vec<u8>,
    /// Note type; 0 for custom notes.
    pub ntype: u32,
}

impl NoteEntry {
    /// Custom note with type 0.
    pub fn new(name: impl Into<String>, desc: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            desc,
            ntype: 0,
        }
    }
}

fn align4(v: usize) -> usize {
    (v + 3) & !3
}

/// Serialize notes into the on-disk `Elf64_Nhdr` sequence, padding name
/// and descriptor to 4 bytes each.
pub fn build_note_payload(notes: &[NoteEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for note in notes {
        let namesz = note.name.len() + 1;
        out.extend_from_slice(&(namesz as u32).to_le_bytes());
        out.extend_from_slice(&(note.desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&note.ntype.to_le_bytes());
        out.extend_from_slice(note.name.as_bytes());
        out.push(0);
        out.resize(out.len() + align4(namesz) - namesz, 0);
        out.extend_from_slice(&note.desc);
        let dlen = note.desc.len();
        out.resize(out.len() + align4(dlen) - dlen, 0);
    }
    out
}

/// Parse a note segment's content. Tolerant: stops at the first record
/// that does not fit.
pub fn parse_notes(data: &[u8]) -> Vec<NoteEntry> {
    let mut notes = Vec::new();
    let mut pos = 0usize;
    while pos + 12 <= data.len() {
        let namesz = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let descsz = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let ntype = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap());
        let name_start = pos + 12;
        let desc_start = name_start.checked_add(align4(namesz));
        let end = desc_start.and_then(|d| d.checked_add(align4(descsz)));
        let (desc_start, end) = match (desc_start, end) {
            (Some(d), Some(e)) if e <= data.len() => (d, e),
            _ => break,
        };
        let name = if namesz > 0 {
            String::from_utf8_lossy(&data[name_start..name_start + namesz - 1]).to_string()
        } else {
            String::new()
        };
        let desc = data[desc_start..desc_start + descsz].to_vec();
        notes.push(NoteEntry { name, desc, ntype });
        pos = end;
    }
    notes
}

// ---------------------------------------------------------------------------
// Raw reuse writer
// ---------------------------------------------------------------------------

/// Rewrite an existing PT_NOTE entry to point at a combined note payload
/// appended to the end of the file, without relocating the Program Header
/// Table.
///
/// `modify` runs against the in-memory buffer before anything else (fuse
/// flip). `pressed_write` marks a self-extracting payload write, which
/// always takes the static-address path: extending a PT_LOAD over tens of
/// megabytes of payload would make the loader map it all and crash.
///
/// Deduplication law: existing notes whose owner is not among `notes` are
/// preserved in file order; the new notes follow them.
pub fn reuse_multi_ptnote(
    mut input: Vec<u8>,
    notes: &[NoteEntry],
    modify: Option<&mut dyn FnMut(&mut Vec<u8>) -> bool>,
    pressed_write: bool,
) -> Result<Vec<u8>> {
    if notes.is_empty() {
        return Err(Error::invalid_args("no notes to write"));
    }

    // Validate before running the callback so the error names the real
    // problem, not a callback artifact.
    Elf64Header::parse(&input)?;

    if let Some(cb) = modify {
        if !cb(&mut input) {
            return Err(Error::invalid_args("binary modify callback failed"));
        }
    }

    let header = Elf64Header::parse(&input)?;
    if header.e_phnum == 0 {
        return Err(Error::invalid_elf("no program headers"));
    }
    if header.e_phentsize as usize != PHDR_SIZE {
        return Err(Error::invalid_elf(format!(
            "unexpected program header entry size {}",
            header.e_phentsize
        )));
    }
    let pht_bytes = header.e_phnum as usize * PHDR_SIZE;
    if pht_bytes > MAX_PHT_BYTES {
        return Err(Error::invalid_elf(format!(
            "program header table too large: {pht_bytes} bytes"
        )));
    }
    let pht_off = usize::try_from(header.e_phoff)
        .map_err(|_| Error::invalid_elf("program header offset out of range"))?;
    let pht_end = pht_off
        .checked_add(pht_bytes)
        .ok_or_else(|| Error::invalid_elf("program header table out of bounds"))?;
    if pht_end > input.len() {
        return Err(Error::invalid_elf("program header table out of bounds"));
    }

    let mut phdrs = Vec::with_capacity(header.e_phnum as usize);
    for i in 0..header.e_phnum as usize {
        let start = pht_off + i * PHDR_SIZE;
        phdrs.push(ProgramHeader::parse(&input[start..start + PHDR_SIZE])?);
    }

    // Highest-ending PT_LOAD and the last PT_NOTE. The note is reused;
    // one is never invented.
    let mut last_load: Option<usize> = None;
    let mut last_note: Option<usize> = None;
    for (i, ph) in phdrs.iter().enumerate() {
        match ph.p_type {
            PT_LOAD => {
                let end = ph.p_offset + ph.p_filesz;
                let is_later = last_load
                    .map(|j: usize| end > phdrs[j].p_offset + phdrs[j].p_filesz)
                    .unwrap_or(true);
                if is_later {
                    last_load = Some(i);
                }
            }
            PT_NOTE => last_note = Some(i),
            _ => {}
        }
    }
    let load_idx = last_load.ok_or_else(|| Error::invalid_elf("no PT_LOAD segment"))?;
    let note_idx = last_note.ok_or_else(|| Error::invalid_elf("no PT_NOTE segment to reuse"))?;

    // Preserve existing notes that are not being rewritten.
    let note_ph = phdrs[note_idx];
    let note_off = usize::try_from(note_ph.p_offset)
        .map_err(|_| Error::invalid_elf("PT_NOTE offset out of range"))?;
    let note_len = usize::try_from(note_ph.p_filesz)
        .map_err(|_| Error::invalid_elf("PT_NOTE size out of range"))?;
    let note_end = note_off
        .checked_add(note_len)
        .filter(|&e| e <= input.len())
        .ok_or_else(|| Error::invalid_elf("PT_NOTE content out of bounds"))?;
    let existing = parse_notes(&input[note_off..note_end]);

    let new_owners: Vec<&str> = notes.iter().map(|n| n.name.as_str()).collect();
    let mut combined: Vec<NoteEntry> = existing
        .into_iter()
        .filter(|n| !new_owners.contains(&n.name.as_str()))
        .collect();
    combined.extend(notes.iter().cloned());
    let payload = build_note_payload(&combined);

    // "Dynamic" means PT_INTERP and nothing else.
    let dynamic = phdrs.iter().any(|ph| ph.p_type == PT_INTERP);

    let notes_file_offset = input.len() as u64;
    let note_vaddr;
    if dynamic && !pressed_write {
        let load = phdrs[load_idx];
        let load_end = load.p_offset + load.p_filesz;
        let gap = notes_file_offset
            .checked_sub(load_end)
            .ok_or_else(|| Error::invalid_elf("last PT_LOAD extends past end of file"))?;
        let grow = gap + payload.len() as u64;
        note_vaddr = load.p_vaddr + load.p_filesz + gap;
        let load_mut = &mut phdrs[load_idx];
        load_mut.p_filesz += grow;
        load_mut.p_memsz += grow;
        let slot = pht_off + load_idx * PHDR_SIZE;
        input[slot..slot + PHDR_SIZE].copy_from_slice(&load_mut.to_bytes());
    } else {
        note_vaddr = STATIC_NOTE_VADDR_BASE + align_up(input.len() as u64, PAGE);
    }

    let reused = ProgramHeader {
        p_type: PT_NOTE,
        p_flags: PF_R,
        p_offset: notes_file_offset,
        p_vaddr: note_vaddr,
        p_paddr: note_vaddr,
        p_filesz: payload.len() as u64,
        p_memsz: payload.len() as u64,
        p_align: 4,
    };
    let slot = pht_off + note_idx * PHDR_SIZE;
    input[slot..slot + PHDR_SIZE].copy_from_slice(&reused.to_bytes());

    tracing::debug!(
        offset = notes_file_offset,
        vaddr = note_vaddr,
        bytes = payload.len(),
        dynamic,
        "reused PT_NOTE entry"
    );

    input.extend_from_slice(&payload);
    Ok(input)
}

// ---------------------------------------------------------------------------
// ElfFile model (new-segment writer)
// ---------------------------------------------------------------------------

/// A program header plus optionally rebuilt content.
#[derive(Debug, Clone)]
pub struct Segment {
    /// The program header entry.
    pub phdr: ProgramHeader,
    /// Replacement content; `None` means the bytes at `p_offset` in the
    /// original image are still current.
    pub replacement: Option<Vec<u8>>,
    /// Extent of the original file region when `replacement` shrank it,
    /// so the stale tail can be zeroed at write time.
    orig_filesz: Option<u64>,
}

/// A section header plus its resolved name.
#[derive(Debug, Clone)]
pub struct Section {
    /// The section header entry.
    pub shdr: SectionHeader,
    /// Resolved name from the string table.
    pub name: String,
    /// Index of the segment this (new) section mirrors, for offset
    /// assignment.
    paired_segment: Option<usize>,
}

/// Builder configuration for [`ElfFile::write`]. Everything except notes
/// is left untouched in the original image; `notes` must stay enabled or
/// staged note segments would be dropped on the floor.
#[derive(Debug, Clone, Copy)]
pub struct WriteConfig {
    /// Materialize staged and rebuilt note segments. Mandatory.
    pub notes: bool,
    /// Do not rebuild dynamic-linking structures (always honored; this
    /// writer never touches them).
    pub skip_dynamic: bool,
}

impl WriteConfig {
    /// The minimal configuration used by the new-segment writer: only
    /// notes, nothing else rebuilt.
    pub fn minimal_notes() -> Self {
        Self {
            notes: true,
            skip_dynamic: true,
        }
    }
}

/// Parsed 64-bit little-endian ELF with staged mutations.
#[derive(Debug)]
pub struct ElfFile {
    /// File header.
    pub header: Elf64Header,
    base: Vec<u8>,
    /// Program headers, including staged additions.
    pub segments: Vec<Segment>,
    /// Section headers, including staged additions.
    pub sections: Vec<Section>,
    sections_dirty: bool,
}

impl ElfFile {
    /// Parse an ELF image.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = Elf64Header::parse(&data)?;
        if header.e_phnum == 0 {
            return Err(Error::invalid_elf("no program headers"));
        }
        if header.e_phentsize as usize != PHDR_SIZE {
            return Err(Error::invalid_elf(format!(
                "unexpected program header entry size {}",
                header.e_phentsize
            )));
        }
        let pht_bytes = header.e_phnum as usize * PHDR_SIZE;
        if pht_bytes > MAX_PHT_BYTES {
            return Err(Error::invalid_elf(format!(
                "program header table too large: {pht_bytes} bytes"
            )));
        }
        let pht_off = usize::try_from(header.e_phoff)
            .map_err(|_| Error::invalid_elf("program header offset out of range"))?;
        if pht_off + pht_bytes > data.len() {
            return Err(Error::invalid_elf("program header table out of bounds"));
        }

        let mut segments = Vec::with_capacity(header.e_phnum as usize);
        for i in 0..header.e_phnum as usize {
            let start = pht_off + i * PHDR_SIZE;
            segments.push(Segment {
                phdr: ProgramHeader::parse(&data[start..start + PHDR_SIZE])?,
                replacement: None,
                orig_filesz: None,
            });
        }

        let mut sections = Vec::new();
        if header.e_shoff != 0 && header.e_shnum > 0 && header.e_shentsize as usize == SHDR_SIZE {
            let sht_off = usize::try_from(header.e_shoff)
                .map_err(|_| Error::invalid_elf("section header offset out of range"))?;
            let sht_bytes = header.e_shnum as usize * SHDR_SIZE;
            if sht_off + sht_bytes <= data.len() {
                let mut shdrs = Vec::with_capacity(header.e_shnum as usize);
                for i in 0..header.e_shnum as usize {
                    let start = sht_off + i * SHDR_SIZE;
                    shdrs.push(SectionHeader::parse(&data[start..start + SHDR_SIZE])?);
                }
                let strtab: &[u8] = shdrs
                    .get(header.e_shstrndx as usize)
                    .and_then(|s| {
                        let off = usize::try_from(s.sh_offset).ok()?;
                        let size = usize::try_from(s.sh_size).ok()?;
                        let end = off.checked_add(size)?;
                        data.get(off..end)
                    })
                    .unwrap_or(&[]);
                for shdr in shdrs {
                    let name = read_strtab(strtab, shdr.sh_name as usize);
                    sections.push(Section {
                        shdr,
                        name,
                        paired_segment: None,
                    });
                }
            }
        }

        Ok(Self {
            header,
            base: data,
            segments,
            sections,
            sections_dirty: false,
        })
    }

    /// Content of segment `idx`, from its replacement or the base image.
    pub fn segment_data(&self, idx: usize) -> &[u8] {
        let seg = &self.segments[idx];
        if let Some(ref repl) = seg.replacement {
            return repl;
        }
        let off = seg.phdr.p_offset as usize;
        let end = off.checked_add(seg.phdr.p_filesz as usize);
        end.and_then(|e| self.base.get(off..e)).unwrap_or(&[])
    }

    /// Whether the binary carries a PT_INTERP entry.
    pub fn has_interp(&self) -> bool {
        self.segments.iter().any(|s| s.phdr.p_type == PT_INTERP)
    }

    /// Scan the whole in-memory image for the unflipped fuse sentinel and
    /// arm it. Returns whether a flip happened.
    pub fn flip_fuse(&mut self) -> bool {
        crate::fuse::flip_raw(&mut self.base)
    }

    /// All notes across every PT_NOTE segment, in file order.
    pub fn notes(&self) -> Vec<NoteEntry> {
        let mut all = Vec::new();
        for i in 0..self.segments.len() {
            if self.segments[i].phdr.p_type == PT_NOTE {
                all.extend(parse_notes(self.segment_data(i)));
            }
        }
        all
    }

    /// Whether a note with this owner exists.
    pub fn note_exists(&self, owner: &str) -> bool {
        self.notes().iter().any(|n| n.name == owner)
    }

    /// Descriptor bytes of the first note with this owner.
    pub fn note_content(&self, owner: &str) -> Option<Vec<u8>> {
        self.notes().into_iter().find(|n| n.name == owner).map(|n| n.desc)
    }

    /// Remove every note with this owner. Returns whether anything was
    /// removed.
    pub fn remove_all_notes(&mut self, owner: &str) -> bool {
        let mut removed = false;
        for i in 0..self.segments.len() {
            if self.segments[i].phdr.p_type != PT_NOTE {
                continue;
            }
            let entries = parse_notes(self.segment_data(i));
            if !entries.iter().any(|n| n.name == owner) {
                continue;
            }
            let kept: Vec<NoteEntry> =
                entries.into_iter().filter(|n| n.name != owner).collect();
            let payload = build_note_payload(&kept);
            let seg = &mut self.segments[i];
            if seg.orig_filesz.is_none() {
                seg.orig_filesz = Some(seg.phdr.p_filesz);
            }
            seg.phdr.p_filesz = payload.len() as u64;
            seg.phdr.p_memsz = payload.len() as u64;
            seg.replacement = Some(payload);
            removed = true;
        }
        let section_name = format!(".note.{owner}");
        let before = self.sections.len();
        self.sections.retain(|s| s.name != section_name);
        if self.sections.len() != before {
            self.sections_dirty = true;
        }
        removed
    }

    /// Stage a new custom note in its own PT_NOTE segment, with a
    /// `.note.<owner>` section. The section is created without ALLOC: it
    /// has no assigned virtual address yet, and an ALLOC section at
    /// address zero makes the kernel map page zero.
    pub fn create_and_add_note(&mut self, owner: &str, desc: &[u8]) {
        let payload = build_note_payload(&[NoteEntry::new(owner, desc.to_vec())]);
        let len = payload.len() as u64;
        self.segments.push(Segment {
            phdr: ProgramHeader {
                p_type: PT_NOTE,
                p_flags: PF_R,
                p_offset: 0,
                p_vaddr: 0,
                p_paddr: 0,
                p_filesz: len,
                p_memsz: len,
                p_align: 4,
            },
            replacement: Some(payload),
            orig_filesz: None,
        });
        let seg_idx = self.segments.len() - 1;
        if !self.sections.is_empty() {
            self.sections.push(Section {
                shdr: SectionHeader {
                    sh_name: 0,
                    sh_type: SHT_NOTE,
                    sh_flags: 0,
                    sh_addr: 0,
                    sh_offset: 0,
                    sh_size: len,
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: 4,
                    sh_entsize: 0,
                },
                name: format!(".note.{owner}"),
                paired_segment: Some(seg_idx),
            });
            self.sections_dirty = true;
        }
    }

    /// Remove then add: the single-note replacement primitive.
    pub fn replace_or_add_note(&mut self, owner: &str, desc: &[u8]) {
        self.remove_all_notes(owner);
        self.create_and_add_note(owner, desc);
    }

    /// Assign file offsets to staged segments, appending after the
    /// original image. Idempotent: segments with an offset keep it.
    fn assign_new_offsets(&mut self) {
        let mut cursor = align_up(self.base.len() as u64, 8);
        for seg in &mut self.segments {
            if seg.replacement.is_some() && seg.phdr.p_offset == 0 {
                seg.phdr.p_offset = cursor;
                cursor = align_up(cursor + seg.phdr.p_filesz, 8);
            }
        }
        for i in 0..self.sections.len() {
            if let Some(seg_idx) = self.sections[i].paired_segment {
                self.sections[i].shdr.sh_offset = self.segments[seg_idx].phdr.p_offset;
            }
        }
    }

    /// Phase 1a: give every PT_NOTE with `p_vaddr == 0` a page-aligned
    /// virtual address above the highest-ending PT_LOAD, preserving the
    /// offset/vaddr page congruence loaders require. Returns whether any
    /// address was assigned.
    pub fn fix_note_segment_vaddrs(&mut self) -> bool {
        // Congruence needs real file offsets.
        self.assign_new_offsets();
        let mut cursor = self
            .segments
            .iter()
            .filter(|s| s.phdr.p_type == PT_LOAD)
            .map(|s| align_up(s.phdr.p_vaddr + s.phdr.p_memsz, PAGE))
            .max()
            .unwrap_or(PAGE);
        let mut changed = false;
        for seg in &mut self.segments {
            if seg.phdr.p_type == PT_NOTE && seg.phdr.p_vaddr == 0 && seg.phdr.p_filesz > 0 {
                let vaddr = cursor + (seg.phdr.p_offset & (PAGE - 1));
                seg.phdr.p_vaddr = vaddr;
                seg.phdr.p_paddr = vaddr;
                cursor = align_up(vaddr + seg.phdr.p_filesz, PAGE);
                changed = true;
            }
        }
        changed
    }

    /// Phase 1b: for every PT_NOTE that carries one of `owners` and has a
    /// virtual address, append a read-only PT_LOAD covering the same file
    /// region, page-aligned, unless one already covers it. Returns
    /// whether a load was added.
    pub fn add_matching_load_for_notes(&mut self, owners: &[&str]) -> bool {
        self.assign_new_offsets();
        let mut to_cover = Vec::new();
        for i in 0..self.segments.len() {
            let ph = self.segments[i].phdr;
            if ph.p_type != PT_NOTE || ph.p_vaddr == 0 || ph.p_filesz == 0 {
                continue;
            }
            let entries = parse_notes(self.segment_data(i));
            if entries.iter().any(|n| owners.contains(&n.name.as_str())) {
                to_cover.push(ph);
            }
        }
        let mut added = false;
        for ph in to_cover {
            // A load only counts as covering when it maps the note's file
            // region at the note's own address.
            let covered = self.segments.iter().any(|s| {
                s.phdr.p_type == PT_LOAD
                    && s.phdr.p_offset <= ph.p_offset
                    && s.phdr.p_offset + s.phdr.p_filesz >= ph.p_offset + ph.p_filesz
                    && ph.p_vaddr.wrapping_sub(s.phdr.p_vaddr)
                        == ph.p_offset.wrapping_sub(s.phdr.p_offset)
            });
            if covered {
                continue;
            }
            let page_off = ph.p_offset & !(PAGE - 1);
            let page_vaddr = ph.p_vaddr & !(PAGE - 1);
            let span = align_up((ph.p_offset - page_off) + ph.p_filesz, PAGE);
            self.segments.push(Segment {
                phdr: ProgramHeader {
                    p_type: PT_LOAD,
                    p_flags: PF_R,
                    p_offset: page_off,
                    p_vaddr: page_vaddr,
                    p_paddr: page_vaddr,
                    p_filesz: span,
                    p_memsz: span,
                    p_align: PAGE,
                },
                replacement: None,
                orig_filesz: None,
            });
            added = true;
        }
        added
    }

    /// Phase 3 scrub: clear ALLOC on any NOTE section whose virtual
    /// address is zero. An ALLOC section at address zero makes the kernel
    /// try to map page zero and the process dies with SIGSEGV. Returns
    /// whether any flag changed.
    pub fn clear_alloc_on_zero_vaddr_notes(&mut self) -> bool {
        let mut changed = false;
        for sect in &mut self.sections {
            if sect.shdr.sh_type == SHT_NOTE
                && sect.shdr.sh_addr == 0
                && sect.shdr.sh_flags & SHF_ALLOC != 0
            {
                sect.shdr.sh_flags &= !SHF_ALLOC;
                changed = true;
            }
        }
        if changed {
            self.sections_dirty = true;
        }
        changed
    }

    /// Serialize the binary.
    ///
    /// When segments were added the PHT is relocated to the end of the
    /// file inside a fresh read-only PT_LOAD (and PT_PHDR is retargeted);
    /// otherwise program headers are rewritten in place. The section
    /// header table is rebuilt at the end of the file when sections
    /// changed.
    pub fn write(&mut self, config: &WriteConfig) -> Result<Vec<u8>> {
        if !config.notes {
            return Err(Error::invalid_args(
                "builder configuration must keep notes enabled",
            ));
        }
        self.assign_new_offsets();

        let mut out = self.base.clone();

        // Materialize replaced and appended segment content.
        for seg in &self.segments {
            let Some(ref payload) = seg.replacement else {
                continue;
            };
            let off = seg.phdr.p_offset as usize;
            if off + payload.len() <= self.base.len() {
                out[off..off + payload.len()].copy_from_slice(payload);
                if let Some(orig) = seg.orig_filesz {
                    let orig_end = off + orig as usize;
                    if orig_end <= out.len() {
                        out[off + payload.len()..orig_end].fill(0);
                    }
                }
            } else {
                if out.len() < off {
                    out.resize(off, 0);
                }
                out.truncate(off);
                out.extend_from_slice(payload);
            }
        }

        let grew = self.segments.len() != self.header.e_phnum as usize;
        let mut header = self.header.clone();

        if grew {
            // Relocate the PHT to a fresh page at the end of the file and
            // cover it with its own read-only PT_LOAD.
            let new_phoff = align_up(out.len() as u64, PAGE);
            let phnum = self.segments.len() + 1; // + the covering load
            let pht_size = (phnum * PHDR_SIZE) as u64;

            let vaddr_base = self
                .segments
                .iter()
                .filter(|s| s.phdr.p_type == PT_LOAD || s.phdr.p_type == PT_NOTE)
                .map(|s| align_up(s.phdr.p_vaddr + s.phdr.p_memsz, PAGE))
                .max()
                .unwrap_or(PAGE);

            let mut phdrs: Vec<ProgramHeader> =
                self.segments.iter().map(|s| s.phdr).collect();
            for ph in &mut phdrs {
                if ph.p_type == PT_PHDR {
                    ph.p_offset = new_phoff;
                    ph.p_vaddr = vaddr_base;
                    ph.p_paddr = vaddr_base;
                    ph.p_filesz = pht_size;
                    ph.p_memsz = pht_size;
                }
            }
            phdrs.push(ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R,
                p_offset: new_phoff,
                p_vaddr: vaddr_base,
                p_paddr: vaddr_base,
                p_filesz: align_up(pht_size, PAGE),
                p_memsz: align_up(pht_size, PAGE),
                p_align: PAGE,
            });

            out.resize(new_phoff as usize, 0);
            for ph in &phdrs {
                out.extend_from_slice(&ph.to_bytes());
            }

            header.e_phoff = new_phoff;
            header.e_phnum = phnum as u16;
        } else {
            let pht_off = header.e_phoff as usize;
            for (i, seg) in self.segments.iter().enumerate() {
                let slot = pht_off + i * PHDR_SIZE;
                out[slot..slot + PHDR_SIZE].copy_from_slice(&seg.phdr.to_bytes());
            }
        }

        // Rebuild the section header table when it changed.
        if (self.sections_dirty || grew) && !self.sections.is_empty() && self.header.e_shoff != 0 {
            let mut strtab: Vec<u8> = vec![0];
            let mut shdrs: Vec<SectionHeader> = Vec::with_capacity(self.sections.len());
            let mut shstrndx: Option<usize> = None;
            for (i, sect) in self.sections.iter().enumerate() {
                let mut shdr = sect.shdr;
                if sect.name.is_empty() {
                    shdr.sh_name = 0;
                } else {
                    shdr.sh_name = strtab.len() as u32;
                    strtab.extend_from_slice(sect.name.as_bytes());
                    strtab.push(0);
                }
                if sect.name == ".shstrtab" {
                    shstrndx = Some(i);
                }
                shdrs.push(shdr);
            }

            let strtab_off = align_up(out.len() as u64, 8);
            out.resize(strtab_off as usize, 0);
            out.extend_from_slice(&strtab);
            if let Some(idx) = shstrndx {
                shdrs[idx].sh_offset = strtab_off;
                shdrs[idx].sh_size = strtab.len() as u64;
            }

            let sht_off = align_up(out.len() as u64, 8);
            out.resize(sht_off as usize, 0);
            for shdr in &shdrs {
                out.extend_from_slice(&shdr.to_bytes());
            }

            header.e_shoff = sht_off;
            header.e_shnum = self.sections.len() as u16;
            if let Some(idx) = shstrndx {
                header.e_shstrndx = idx as u16;
            }
        }

        header.write_to(&mut out[..EHDR_SIZE]);
        Ok(out)
    }
}

fn read_strtab(strtab: &[u8], offset: usize) -> String {
    let Some(tail) = strtab.get(offset..) else {
        return String::new();
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).to_string()
}

/// The new-segment writer: the documented three-phase workflow.
///
/// Phase 1 fixes missing note vaddrs and adds matching loads; phase 2
/// writes with the minimal builder configuration; phase 3 re-parses,
/// scrubs ALLOC from zero-address NOTE sections, and, when anything was
/// scrubbed, reapplies phase 1 (the re-parse dropped staged state) and
/// writes again with the same minimal configuration.
pub fn write_with_notes(mut elf: ElfFile, owners: &[&str]) -> Result<Vec<u8>> {
    elf.fix_note_segment_vaddrs();
    elf.add_matching_load_for_notes(owners);

    let config = WriteConfig::minimal_notes();
    let first = elf.write(&config)?;

    let mut reparsed = ElfFile::parse(first.clone())?;
    if !reparsed.clear_alloc_on_zero_vaddr_notes() {
        return Ok(first);
    }
    reparsed.fix_note_segment_vaddrs();
    reparsed.add_matching_load_for_notes(owners);
    reparsed.write(&config)
}
