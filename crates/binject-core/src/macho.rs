//! Mach-O binary manipulation.
//!
//! Parses 64-bit Mach-O executables (thin, or slice 0 of a universal
//! binary), locates and removes segments by name, replaces section
//! content in place, and builds the dedicated resource segments
//! (`NODE_SEA`, `SMOL`) that carry injected payloads.
//!
//! Load commands are read through a shared little-endian field cursor
//! ([`Fields`]) and written back through the [`PutLe`] emit helpers; a
//! command type the model does not understand, or whose declared size
//! disagrees with its fixed layout, is carried through as raw bytes so a
//! rewrite never truncates it.
//!
//! Mutations leave the binary's code signature stale; macOS builds re-sign
//! through the host `codesign` utility after every mutation (see
//! [`codesign`]).

#![allow(missing_docs)]

use std::path::Path;

use crate::error::{Error, Result};

/// 64-bit Mach-O magic.
pub const MH_MAGIC_64: u32 = 0xfeedfacf;

/// Universal (fat) binary magic, big-endian on disk.
pub const FAT_MAGIC: u32 = 0xcafebabe;

/// Load command types the model understands structurally.
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_DYLD_INFO_ONLY: u32 = 0x80000022;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x80000034;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x80000033;

/// Page size for segment alignment (16 KiB on arm64).
pub const MACHO_PAGE_SIZE: usize = 16384;

const VM_PROT_READ: i32 = 0x1;

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidFormat(msg.into())
}

fn fixed_name(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn name16_str(bytes: &[u8; 16]) -> &str {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(16);
    std::str::from_utf8(&bytes[..len]).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Field cursor and emit helpers
// ---------------------------------------------------------------------------

/// Little-endian field cursor over a load command's payload (the bytes
/// after `cmd`/`cmdsize`). Every structured read in this module goes
/// through it, and [`Fields::consumed`] lets the parser verify a
/// command's declared size against what its layout actually used.
struct Fields<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| invalid("truncated load command"))?;
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn name16(&mut self) -> Result<[u8; 16]> {
        Ok(self.take(16)?.try_into().expect("16 bytes"))
    }

    fn consumed(&self) -> usize {
        self.at
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
}

/// Little-endian emit helpers; every serializer in this module goes
/// through these.
trait PutLe {
    fn put_u32(&mut self, v: u32);
    fn put_i32(&mut self, v: i32);
    fn put_u64(&mut self, v: u64);
    fn put_bytes(&mut self, v: &[u8]);
}

impl PutLe for Vec<u8> {
    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.extend_from_slice(v);
    }
}

// ---------------------------------------------------------------------------
// Load command structs
// ---------------------------------------------------------------------------

/// Mach-O 64-bit header.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader64 {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let head = data
            .get(..Self::SIZE)
            .ok_or_else(|| invalid("file too short for a Mach-O header"))?;
        let mut f = Fields::new(head);
        Ok(Self {
            magic: f.u32()?,
            cputype: f.i32()?,
            cpusubtype: f.i32()?,
            filetype: f.u32()?,
            ncmds: f.u32()?,
            sizeofcmds: f.u32()?,
            flags: f.u32()?,
            reserved: f.u32()?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.magic);
        out.put_i32(self.cputype);
        out.put_i32(self.cpusubtype);
        out.put_u32(self.filetype);
        out.put_u32(self.ncmds);
        out.put_u32(self.sizeofcmds);
        out.put_u32(self.flags);
        out.put_u32(self.reserved);
    }
}

/// 64-bit segment command.
#[derive(Debug, Clone)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: i32,
    pub initprot: i32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    pub const SIZE: usize = 72;

    fn parse(cmd: u32, cmdsize: u32, f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            cmd,
            cmdsize,
            segname: f.name16()?,
            vmaddr: f.u64()?,
            vmsize: f.u64()?,
            fileoff: f.u64()?,
            filesize: f.u64()?,
            maxprot: f.i32()?,
            initprot: f.i32()?,
            nsects: f.u32()?,
            flags: f.u32()?,
        })
    }

    pub fn name(&self) -> &str {
        name16_str(&self.segname)
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.cmd);
        out.put_u32(self.cmdsize);
        out.put_bytes(&self.segname);
        out.put_u64(self.vmaddr);
        out.put_u64(self.vmsize);
        out.put_u64(self.fileoff);
        out.put_u64(self.filesize);
        out.put_i32(self.maxprot);
        out.put_i32(self.initprot);
        out.put_u32(self.nsects);
        out.put_u32(self.flags);
    }
}

/// 64-bit section header.
#[derive(Debug, Clone)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

impl Section64 {
    pub const SIZE: usize = 80;

    fn parse(f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            sectname: f.name16()?,
            segname: f.name16()?,
            addr: f.u64()?,
            size: f.u64()?,
            offset: f.u32()?,
            align: f.u32()?,
            reloff: f.u32()?,
            nreloc: f.u32()?,
            flags: f.u32()?,
            reserved1: f.u32()?,
            reserved2: f.u32()?,
            reserved3: f.u32()?,
        })
    }

    pub fn name(&self) -> &str {
        name16_str(&self.sectname)
    }

    pub fn segment_name(&self) -> &str {
        name16_str(&self.segname)
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_bytes(&self.sectname);
        out.put_bytes(&self.segname);
        out.put_u64(self.addr);
        out.put_u64(self.size);
        out.put_u32(self.offset);
        out.put_u32(self.align);
        out.put_u32(self.reloff);
        out.put_u32(self.nreloc);
        out.put_u32(self.flags);
        out.put_u32(self.reserved1);
        out.put_u32(self.reserved2);
        out.put_u32(self.reserved3);
    }
}

/// Linkedit-data load command (code signature, function starts, ...).
#[derive(Debug, Clone, Copy)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

impl LinkeditDataCommand {
    pub const SIZE: usize = 16;

    fn parse(cmd: u32, cmdsize: u32, f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            cmd,
            cmdsize,
            dataoff: f.u32()?,
            datasize: f.u32()?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.cmd);
        out.put_u32(self.cmdsize);
        out.put_u32(self.dataoff);
        out.put_u32(self.datasize);
    }
}

/// Symbol table command.
#[derive(Debug, Clone, Copy)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

impl SymtabCommand {
    pub const SIZE: usize = 24;

    fn parse(cmd: u32, cmdsize: u32, f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            cmd,
            cmdsize,
            symoff: f.u32()?,
            nsyms: f.u32()?,
            stroff: f.u32()?,
            strsize: f.u32()?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.cmd);
        out.put_u32(self.cmdsize);
        out.put_u32(self.symoff);
        out.put_u32(self.nsyms);
        out.put_u32(self.stroff);
        out.put_u32(self.strsize);
    }
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

impl DysymtabCommand {
    pub const SIZE: usize = 80;

    fn parse(cmd: u32, cmdsize: u32, f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            cmd,
            cmdsize,
            ilocalsym: f.u32()?,
            nlocalsym: f.u32()?,
            iextdefsym: f.u32()?,
            nextdefsym: f.u32()?,
            iundefsym: f.u32()?,
            nundefsym: f.u32()?,
            tocoff: f.u32()?,
            ntoc: f.u32()?,
            modtaboff: f.u32()?,
            nmodtab: f.u32()?,
            extrefsymoff: f.u32()?,
            nextrefsyms: f.u32()?,
            indirectsymoff: f.u32()?,
            nindirectsyms: f.u32()?,
            extreloff: f.u32()?,
            nextrel: f.u32()?,
            locreloff: f.u32()?,
            nlocrel: f.u32()?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.cmd);
        out.put_u32(self.cmdsize);
        for v in [
            self.ilocalsym,
            self.nlocalsym,
            self.iextdefsym,
            self.nextdefsym,
            self.iundefsym,
            self.nundefsym,
            self.tocoff,
            self.ntoc,
            self.modtaboff,
            self.nmodtab,
            self.extrefsymoff,
            self.nextrefsyms,
            self.indirectsymoff,
            self.nindirectsyms,
            self.extreloff,
            self.nextrel,
            self.locreloff,
            self.nlocrel,
        ] {
            out.put_u32(v);
        }
    }
}

/// Dyld info command.
#[derive(Debug, Clone, Copy)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

impl DyldInfoCommand {
    pub const SIZE: usize = 48;

    fn parse(cmd: u32, cmdsize: u32, f: &mut Fields<'_>) -> Result<Self> {
        Ok(Self {
            cmd,
            cmdsize,
            rebase_off: f.u32()?,
            rebase_size: f.u32()?,
            bind_off: f.u32()?,
            bind_size: f.u32()?,
            weak_bind_off: f.u32()?,
            weak_bind_size: f.u32()?,
            lazy_bind_off: f.u32()?,
            lazy_bind_size: f.u32()?,
            export_off: f.u32()?,
            export_size: f.u32()?,
        })
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.put_u32(self.cmd);
        out.put_u32(self.cmdsize);
        for v in [
            self.rebase_off,
            self.rebase_size,
            self.bind_off,
            self.bind_size,
            self.weak_bind_off,
            self.weak_bind_size,
            self.lazy_bind_off,
            self.lazy_bind_size,
            self.export_off,
            self.export_size,
        ] {
            out.put_u32(v);
        }
    }
}

/// A load command the model keeps structurally, or raw bytes for types it
/// only needs to carry through.
#[derive(Debug)]
pub enum ParsedLoadCommand {
    Segment64 {
        segment: SegmentCommand64,
        sections: Vec<Section64>,
    },
    CodeSignature(LinkeditDataCommand),
    FunctionStarts(LinkeditDataCommand),
    DataInCode(LinkeditDataCommand),
    DyldChainedFixups(LinkeditDataCommand),
    DyldExportsTrie(LinkeditDataCommand),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    DyldInfo(DyldInfoCommand),
    Other {
        cmd: u32,
        data: Vec<u8>,
    },
}

/// A parsed thin 64-bit Mach-O.
#[derive(Debug)]
pub struct MachoFile {
    /// Mach header.
    pub header: MachHeader64,
    /// Load commands in file order.
    pub load_commands: Vec<ParsedLoadCommand>,
    /// File content after the load command area.
    pub file_data: Vec<u8>,
    /// Absolute file offset where `file_data` starts.
    pub data_offset: usize,
}

impl MachoFile {
    /// Parse a thin 64-bit little-endian Mach-O.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = MachHeader64::parse(data)?;
        if header.magic != MH_MAGIC_64 {
            return Err(invalid(format!(
                "unsupported Mach-O magic: 0x{:x}",
                header.magic
            )));
        }

        let mut load_commands = Vec::with_capacity(header.ncmds as usize);
        let mut at = MachHeader64::SIZE;
        for _ in 0..header.ncmds {
            let head = data
                .get(at..at + 8)
                .ok_or_else(|| invalid("load commands extend past end of file"))?;
            let cmd = u32::from_le_bytes(head[0..4].try_into().expect("4 bytes"));
            let cmdsize = u32::from_le_bytes(head[4..8].try_into().expect("4 bytes")) as usize;
            if cmdsize < 8 {
                return Err(invalid(format!(
                    "load command 0x{cmd:x} has impossible size {cmdsize}"
                )));
            }
            let end = at
                .checked_add(cmdsize)
                .ok_or_else(|| invalid("load command size overflows"))?;
            let payload = data
                .get(at + 8..end)
                .ok_or_else(|| invalid("load command extends past end of file"))?;
            load_commands.push(Self::parse_command(cmd, cmdsize as u32, payload));
            at = end;
        }

        let data_offset = at;
        let file_data = data[data_offset..].to_vec();

        Ok(Self {
            header,
            load_commands,
            file_data,
            data_offset,
        })
    }

    /// Parse one load command from its payload. An unknown command type,
    /// a truncated payload, or a declared size that disagrees with the
    /// type's fixed layout all fall back to raw carry-through.
    fn parse_command(cmd: u32, cmdsize: u32, payload: &[u8]) -> ParsedLoadCommand {
        let mut f = Fields::new(payload);
        let parsed = match cmd {
            LC_SEGMENT_64 => SegmentCommand64::parse(cmd, cmdsize, &mut f).and_then(|segment| {
                if segment.nsects as usize > f.remaining() / Section64::SIZE {
                    return Err(invalid("section count exceeds command size"));
                }
                let mut sections = Vec::with_capacity(segment.nsects as usize);
                for _ in 0..segment.nsects {
                    sections.push(Section64::parse(&mut f)?);
                }
                Ok(ParsedLoadCommand::Segment64 { segment, sections })
            }),
            LC_CODE_SIGNATURE => LinkeditDataCommand::parse(cmd, cmdsize, &mut f)
                .map(ParsedLoadCommand::CodeSignature),
            LC_FUNCTION_STARTS => LinkeditDataCommand::parse(cmd, cmdsize, &mut f)
                .map(ParsedLoadCommand::FunctionStarts),
            LC_DATA_IN_CODE => LinkeditDataCommand::parse(cmd, cmdsize, &mut f)
                .map(ParsedLoadCommand::DataInCode),
            LC_DYLD_CHAINED_FIXUPS => LinkeditDataCommand::parse(cmd, cmdsize, &mut f)
                .map(ParsedLoadCommand::DyldChainedFixups),
            LC_DYLD_EXPORTS_TRIE => LinkeditDataCommand::parse(cmd, cmdsize, &mut f)
                .map(ParsedLoadCommand::DyldExportsTrie),
            LC_SYMTAB => {
                SymtabCommand::parse(cmd, cmdsize, &mut f).map(ParsedLoadCommand::Symtab)
            }
            LC_DYSYMTAB => {
                DysymtabCommand::parse(cmd, cmdsize, &mut f).map(ParsedLoadCommand::Dysymtab)
            }
            LC_DYLD_INFO_ONLY => {
                DyldInfoCommand::parse(cmd, cmdsize, &mut f).map(ParsedLoadCommand::DyldInfo)
            }
            _ => {
                return ParsedLoadCommand::Other {
                    cmd,
                    data: payload.to_vec(),
                }
            }
        };

        match parsed {
            Ok(command) if f.consumed() + 8 == cmdsize as usize => command,
            _ => ParsedLoadCommand::Other {
                cmd,
                data: payload.to_vec(),
            },
        }
    }

    fn emit_command(out: &mut Vec<u8>, cmd: &ParsedLoadCommand) {
        match cmd {
            ParsedLoadCommand::Segment64 { segment, sections } => {
                segment.emit(out);
                for section in sections {
                    section.emit(out);
                }
            }
            ParsedLoadCommand::CodeSignature(lc)
            | ParsedLoadCommand::FunctionStarts(lc)
            | ParsedLoadCommand::DataInCode(lc)
            | ParsedLoadCommand::DyldChainedFixups(lc)
            | ParsedLoadCommand::DyldExportsTrie(lc) => lc.emit(out),
            ParsedLoadCommand::Symtab(st) => st.emit(out),
            ParsedLoadCommand::Dysymtab(dst) => dst.emit(out),
            ParsedLoadCommand::DyldInfo(di) => di.emit(out),
            ParsedLoadCommand::Other { cmd, data } => {
                out.put_u32(*cmd);
                out.put_u32((data.len() + 8) as u32);
                out.put_bytes(data);
            }
        }
    }

    fn page_align(size: usize) -> usize {
        (size + MACHO_PAGE_SIZE - 1) & !(MACHO_PAGE_SIZE - 1)
    }

    /// Index of the segment load command with this name.
    pub fn find_segment_index(&self, name: &str) -> Option<usize> {
        self.load_commands.iter().position(|cmd| {
            matches!(cmd, ParsedLoadCommand::Segment64 { segment, .. } if segment.name() == name)
        })
    }

    /// Find a section by segment and section name.
    pub fn find_section(&self, seg_name: &str, sect_name: &str) -> Option<&Section64> {
        for cmd in &self.load_commands {
            if let ParsedLoadCommand::Segment64 { sections, .. } = cmd {
                for section in sections {
                    if section.segment_name() == seg_name && section.name() == sect_name {
                        return Some(section);
                    }
                }
            }
        }
        None
    }

    /// All sections under the given segment name.
    pub fn sections_of(&self, seg_name: &str) -> Vec<&Section64> {
        let mut out = Vec::new();
        for cmd in &self.load_commands {
            if let ParsedLoadCommand::Segment64 { segment, sections } = cmd {
                if segment.name() == seg_name {
                    out.extend(sections.iter());
                }
            }
        }
        out
    }

    /// Content bytes of a section.
    pub fn section_content(&self, section: &Section64) -> Option<&[u8]> {
        let off = (section.offset as usize).checked_sub(self.data_offset)?;
        self.file_data.get(off..off + section.size as usize)
    }

    fn find_linkedit(&self) -> Option<&SegmentCommand64> {
        for cmd in &self.load_commands {
            if let ParsedLoadCommand::Segment64 { segment, .. } = cmd {
                if segment.name() == "__LINKEDIT" {
                    return Some(segment);
                }
            }
        }
        None
    }

    /// File offset of the first section content; anything between the end
    /// of the load commands and this point is padding that can absorb new
    /// load commands.
    fn first_content_offset(&self) -> usize {
        let mut min = usize::MAX;
        for cmd in &self.load_commands {
            if let ParsedLoadCommand::Segment64 { sections, .. } = cmd {
                for s in sections {
                    if s.offset != 0 && (s.offset as usize) < min {
                        min = s.offset as usize;
                    }
                }
            }
        }
        if min == usize::MAX {
            self.data_offset + self.file_data.len()
        } else {
            min
        }
    }

    /// Shift every file offset at or past `from` by `delta` bytes, and
    /// every vmaddr at or past `from_vmaddr` by `delta` (which is always
    /// page-aligned here).
    fn shift_from(&mut self, from: usize, from_vmaddr: u64, delta: i64) {
        for cmd in &mut self.load_commands {
            match cmd {
                ParsedLoadCommand::Segment64 { segment, sections } => {
                    let moves = segment.vmaddr >= from_vmaddr && segment.vmaddr != 0;
                    if segment.fileoff as usize >= from && segment.fileoff != 0 {
                        segment.fileoff = (segment.fileoff as i64 + delta) as u64;
                    }
                    if moves {
                        segment.vmaddr = (segment.vmaddr as i64 + delta) as u64;
                    }
                    for section in sections {
                        if section.offset as usize >= from && section.offset != 0 {
                            section.offset = (section.offset as i64 + delta) as u32;
                        }
                        if moves {
                            section.addr = (section.addr as i64 + delta) as u64;
                        }
                    }
                }
                ParsedLoadCommand::CodeSignature(lc)
                | ParsedLoadCommand::FunctionStarts(lc)
                | ParsedLoadCommand::DataInCode(lc)
                | ParsedLoadCommand::DyldChainedFixups(lc)
                | ParsedLoadCommand::DyldExportsTrie(lc) => {
                    Self::shift_offset(&mut lc.dataoff, from, delta);
                }
                ParsedLoadCommand::Symtab(st) => {
                    Self::shift_offset(&mut st.symoff, from, delta);
                    Self::shift_offset(&mut st.stroff, from, delta);
                }
                ParsedLoadCommand::Dysymtab(dst) => {
                    Self::shift_offset(&mut dst.tocoff, from, delta);
                    Self::shift_offset(&mut dst.modtaboff, from, delta);
                    Self::shift_offset(&mut dst.extrefsymoff, from, delta);
                    Self::shift_offset(&mut dst.indirectsymoff, from, delta);
                    Self::shift_offset(&mut dst.extreloff, from, delta);
                    Self::shift_offset(&mut dst.locreloff, from, delta);
                }
                ParsedLoadCommand::DyldInfo(di) => {
                    Self::shift_offset(&mut di.rebase_off, from, delta);
                    Self::shift_offset(&mut di.bind_off, from, delta);
                    Self::shift_offset(&mut di.weak_bind_off, from, delta);
                    Self::shift_offset(&mut di.lazy_bind_off, from, delta);
                    Self::shift_offset(&mut di.export_off, from, delta);
                }
                ParsedLoadCommand::Other { .. } => {}
            }
        }
    }

    fn shift_offset(offset: &mut u32, from: usize, delta: i64) {
        if *offset != 0 && (*offset as usize) >= from {
            *offset = (*offset as i64 + delta) as u32;
        }
    }

    /// Add a dedicated read-only segment with a single section holding
    /// `data`, placed where `__LINKEDIT` currently starts. `__LINKEDIT`
    /// and everything referencing it shift up by the page-aligned size.
    pub fn add_segment_with_section(
        &mut self,
        seg_name: &str,
        sect_name: &str,
        data: &[u8],
    ) -> Result<()> {
        if self.find_segment_index(seg_name).is_some() {
            return Err(invalid(format!("segment {seg_name} already present")));
        }
        let linkedit = self
            .find_linkedit()
            .ok_or_else(|| Error::SegmentNotFound("__LINKEDIT".into()))?;
        let linkedit_idx = self
            .find_segment_index("__LINKEDIT")
            .expect("just found __LINKEDIT");

        // The new load command must fit into the padding between the end
        // of the load command area and the first section content.
        let cmd_bytes = SegmentCommand64::SIZE + Section64::SIZE;
        let cmd_area_end = MachHeader64::SIZE + self.header.sizeofcmds as usize;
        if cmd_area_end + cmd_bytes > self.first_content_offset() {
            return Err(invalid(format!(
                "no room for a new load command ({cmd_bytes} bytes needed)"
            )));
        }

        let insert_off = linkedit.fileoff as usize;
        let new_vmaddr = linkedit.vmaddr;
        let aligned = Self::page_align(data.len().max(1));

        // Splice the segment content in front of __LINKEDIT.
        let rel = insert_off
            .checked_sub(self.data_offset)
            .filter(|&r| r <= self.file_data.len())
            .ok_or_else(|| invalid("__LINKEDIT offset out of bounds"))?;
        let mut region = vec![0u8; aligned];
        region[..data.len()].copy_from_slice(data);
        self.file_data.splice(rel..rel, region);

        // Retarget everything at or past the insertion point.
        self.shift_from(insert_off, new_vmaddr, aligned as i64);

        let segment = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: cmd_bytes as u32,
            segname: fixed_name(seg_name),
            vmaddr: new_vmaddr,
            vmsize: aligned as u64,
            fileoff: insert_off as u64,
            filesize: aligned as u64,
            maxprot: VM_PROT_READ,
            initprot: VM_PROT_READ,
            nsects: 1,
            flags: 0,
        };
        let section = Section64 {
            sectname: fixed_name(sect_name),
            segname: fixed_name(seg_name),
            addr: new_vmaddr,
            size: data.len() as u64,
            offset: insert_off as u32,
            align: 3,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };

        self.load_commands.insert(
            linkedit_idx,
            ParsedLoadCommand::Segment64 {
                segment,
                sections: vec![section],
            },
        );
        self.header.ncmds += 1;
        self.header.sizeofcmds += cmd_bytes as u32;

        // The command area grew into the leading padding of file_data;
        // drop those bytes so absolute offsets stay put.
        self.file_data.drain(..cmd_bytes);
        self.data_offset += cmd_bytes;

        Ok(())
    }

    /// Remove a segment (and its file region) by name.
    pub fn remove_segment_by_name(&mut self, name: &str) -> Result<()> {
        let idx = self
            .find_segment_index(name)
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?;
        let (fileoff, filesize, vmaddr, cmdsize) = match &self.load_commands[idx] {
            ParsedLoadCommand::Segment64 { segment, .. } => (
                segment.fileoff as usize,
                segment.filesize as usize,
                segment.vmaddr,
                segment.cmdsize as usize,
            ),
            _ => unreachable!("find_segment_index matched a segment"),
        };

        self.load_commands.remove(idx);
        self.header.ncmds -= 1;
        self.header.sizeofcmds -= cmdsize as u32;

        // Drop the file region and pull everything after it back down.
        let rel = fileoff.saturating_sub(self.data_offset);
        if filesize > 0 && rel + filesize <= self.file_data.len() {
            self.file_data.drain(rel..rel + filesize);
            self.shift_from(fileoff + filesize, vmaddr + 1, -(filesize as i64));
        }

        // The command area shrank; restore padding so content offsets
        // stay put.
        let mut pad = vec![0u8; cmdsize];
        pad.append(&mut self.file_data);
        self.file_data = pad;
        self.data_offset -= cmdsize;

        Ok(())
    }

    /// Replace the content of a resource section, growing or shrinking
    /// the file as needed. Sections injected by this tooling each occupy
    /// their own page-aligned subregion of their segment, so the resize
    /// happens at the end of that subregion.
    pub fn replace_section_content(
        &mut self,
        seg_name: &str,
        sect_name: &str,
        data: &[u8],
    ) -> Result<()> {
        let (section_offset, old_size, cmd_idx, sect_idx) = self
            .find_section_details(seg_name, sect_name)
            .ok_or_else(|| {
                Error::SectionNotFound(format!("({seg_name},{sect_name})"))
            })?;

        let new_size = data.len();
        let aligned_new = Self::page_align(new_size.max(1));
        let aligned_old = Self::page_align(old_size.max(1));
        let delta = aligned_new as i64 - aligned_old as i64;

        let rel = section_offset
            .checked_sub(self.data_offset)
            .filter(|&r| r + old_size <= self.file_data.len())
            .ok_or_else(|| invalid("section offset out of bounds"))?;

        if delta > 0 {
            let insert_at = rel + aligned_old;
            self.file_data
                .splice(insert_at..insert_at, vec![0u8; delta as usize]);
        } else if delta < 0 {
            let remove_start = rel + aligned_new;
            self.file_data.drain(remove_start..remove_start + (-delta) as usize);
        }

        self.file_data[rel..rel + new_size].copy_from_slice(data);
        self.file_data[rel + new_size..rel + aligned_new].fill(0);

        let seg_vmaddr =
            if let ParsedLoadCommand::Segment64 { segment, sections } =
                &mut self.load_commands[cmd_idx]
            {
                sections[sect_idx].size = new_size as u64;
                segment.filesize = (segment.filesize as i64 + delta) as u64;
                segment.vmsize = (segment.vmsize as i64 + delta) as u64;
                // Sibling sections after the resized subregion move with
                // it; their file offsets are handled by the global shift.
                for (i, section) in sections.iter_mut().enumerate() {
                    if i != sect_idx && section.offset as usize >= section_offset + aligned_old {
                        section.addr = (section.addr as i64 + delta) as u64;
                    }
                }
                segment.vmaddr
            } else {
                0
            };

        if delta != 0 {
            self.shift_from(section_offset + aligned_old, seg_vmaddr + 1, delta);
        }
        Ok(())
    }

    /// Append a section to an existing segment, placing its content at
    /// the end of the segment's file region.
    pub fn add_section_into(
        &mut self,
        seg_name: &str,
        sect_name: &str,
        data: &[u8],
    ) -> Result<()> {
        let cmd_idx = self
            .find_segment_index(seg_name)
            .ok_or_else(|| Error::SegmentNotFound(seg_name.to_string()))?;
        if self.find_section(seg_name, sect_name).is_some() {
            return Err(invalid(format!(
                "section ({seg_name},{sect_name}) already present"
            )));
        }

        let cmd_bytes = Section64::SIZE;
        let cmd_area_end = MachHeader64::SIZE + self.header.sizeofcmds as usize;
        if cmd_area_end + cmd_bytes > self.first_content_offset() {
            return Err(invalid("no room for a new section header"));
        }

        let (seg_fileoff, seg_filesize, seg_vmaddr) = match &self.load_commands[cmd_idx] {
            ParsedLoadCommand::Segment64 { segment, .. } => {
                (segment.fileoff as usize, segment.filesize as usize, segment.vmaddr)
            }
            _ => unreachable!("find_segment_index matched a segment"),
        };

        let insert_off = seg_fileoff + seg_filesize;
        let aligned = Self::page_align(data.len().max(1));
        let rel = insert_off
            .checked_sub(self.data_offset)
            .filter(|&r| r <= self.file_data.len())
            .ok_or_else(|| invalid("segment end out of bounds"))?;
        let mut region = vec![0u8; aligned];
        region[..data.len()].copy_from_slice(data);
        self.file_data.splice(rel..rel, region);

        self.shift_from(insert_off, seg_vmaddr + 1, aligned as i64);

        let section = Section64 {
            sectname: fixed_name(sect_name),
            segname: fixed_name(seg_name),
            addr: seg_vmaddr + seg_filesize as u64,
            size: data.len() as u64,
            offset: insert_off as u32,
            align: 3,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        if let ParsedLoadCommand::Segment64 { segment, sections } =
            &mut self.load_commands[cmd_idx]
        {
            segment.filesize += aligned as u64;
            segment.vmsize += aligned as u64;
            segment.nsects += 1;
            segment.cmdsize += cmd_bytes as u32;
            sections.push(section);
        }
        self.header.sizeofcmds += cmd_bytes as u32;
        self.file_data.drain(..cmd_bytes);
        self.data_offset += cmd_bytes;
        Ok(())
    }

    /// Remove a resource section; when it is the segment's only section
    /// the whole segment goes with it.
    pub fn remove_resource_section(&mut self, seg_name: &str, sect_name: &str) -> Result<()> {
        let cmd_idx = self
            .find_segment_index(seg_name)
            .ok_or_else(|| Error::SegmentNotFound(seg_name.to_string()))?;
        let nsects = match &self.load_commands[cmd_idx] {
            ParsedLoadCommand::Segment64 { segment, .. } => segment.nsects,
            _ => unreachable!("find_segment_index matched a segment"),
        };
        if nsects <= 1 {
            return self.remove_segment_by_name(seg_name);
        }

        let (section_offset, old_size, _, sect_idx) = self
            .find_section_details(seg_name, sect_name)
            .ok_or_else(|| Error::SectionNotFound(format!("({seg_name},{sect_name})")))?;
        let aligned_old = Self::page_align(old_size.max(1));

        let rel = section_offset
            .checked_sub(self.data_offset)
            .filter(|&r| r + aligned_old <= self.file_data.len())
            .ok_or_else(|| invalid("section offset out of bounds"))?;
        self.file_data.drain(rel..rel + aligned_old);

        let seg_vmaddr = if let ParsedLoadCommand::Segment64 { segment, sections } =
            &mut self.load_commands[cmd_idx]
        {
            sections.remove(sect_idx);
            segment.filesize -= aligned_old as u64;
            segment.vmsize -= aligned_old as u64;
            segment.nsects -= 1;
            segment.cmdsize -= Section64::SIZE as u32;
            for section in sections.iter_mut() {
                if section.offset as usize >= section_offset + aligned_old {
                    section.addr -= aligned_old as u64;
                }
            }
            segment.vmaddr
        } else {
            0
        };

        self.shift_from(section_offset + aligned_old, seg_vmaddr + 1, -(aligned_old as i64));

        self.header.sizeofcmds -= Section64::SIZE as u32;
        let mut pad = vec![0u8; Section64::SIZE];
        pad.append(&mut self.file_data);
        self.file_data = pad;
        self.data_offset -= Section64::SIZE;
        Ok(())
    }

    /// Install or replace a resource section, creating the segment on
    /// demand.
    pub fn add_resource_section(
        &mut self,
        seg_name: &str,
        sect_name: &str,
        data: &[u8],
    ) -> Result<()> {
        if self.find_section(seg_name, sect_name).is_some() {
            self.replace_section_content(seg_name, sect_name, data)
        } else if self.find_segment_index(seg_name).is_some() {
            self.add_section_into(seg_name, sect_name, data)
        } else {
            self.add_segment_with_section(seg_name, sect_name, data)
        }
    }

    /// Scan every section's content for the unflipped fuse sentinel and
    /// arm the first match. Returns whether a flip happened.
    pub fn flip_fuse(&mut self) -> bool {
        let mut ranges = Vec::new();
        for cmd in &self.load_commands {
            if let ParsedLoadCommand::Segment64 { sections, .. } = cmd {
                for s in sections {
                    if s.offset == 0 || s.size == 0 {
                        continue;
                    }
                    if let Some(rel) = (s.offset as usize).checked_sub(self.data_offset) {
                        ranges.push((rel, s.size as usize));
                    }
                }
            }
        }
        for (rel, size) in ranges {
            let Some(slice) = self.file_data.get_mut(rel..rel + size) else {
                continue;
            };
            if crate::fuse::flip_raw(slice) {
                return true;
            }
        }
        false
    }

    fn find_section_details(
        &self,
        seg_name: &str,
        sect_name: &str,
    ) -> Option<(usize, usize, usize, usize)> {
        for (cmd_idx, cmd) in self.load_commands.iter().enumerate() {
            if let ParsedLoadCommand::Segment64 { sections, .. } = cmd {
                for (sect_idx, section) in sections.iter().enumerate() {
                    if section.segment_name() == seg_name && section.name() == sect_name {
                        return Some((
                            section.offset as usize,
                            section.size as usize,
                            cmd_idx,
                            sect_idx,
                        ));
                    }
                }
            }
        }
        None
    }

    /// Serialize the Mach-O back to bytes.
    pub fn write(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.data_offset + self.file_data.len());

        self.header.emit(&mut result);
        for cmd in &self.load_commands {
            Self::emit_command(&mut result, cmd);
        }
        if result.len() < self.data_offset {
            result.resize(self.data_offset, 0);
        }
        result.extend_from_slice(&self.file_data);
        result
    }
}

// ---------------------------------------------------------------------------
// Fat (universal) container
// ---------------------------------------------------------------------------

/// One architecture entry of a universal binary (big-endian on disk).
#[derive(Debug, Clone, Copy)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// A parsed Mach-O file: thin, or a universal binary whose first slice is
/// the one this tooling operates on.
#[derive(Debug)]
pub enum MachoContainer {
    /// A thin 64-bit Mach-O.
    Thin(MachoFile),
    /// A universal binary; mutations apply to slice 0.
    Fat {
        /// Original file image (for the untouched slices).
        raw: Vec<u8>,
        /// Architecture table.
        arches: Vec<FatArch>,
        /// Parsed slice 0.
        binary: MachoFile,
    },
}

impl MachoContainer {
    /// Parse a thin or universal Mach-O.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(invalid("file too short for Mach-O"));
        }
        let be_magic = u32::from_be_bytes(data[0..4].try_into().expect("4 bytes"));
        if be_magic != FAT_MAGIC {
            return Ok(Self::Thin(MachoFile::parse(data)?));
        }

        if data.len() < 8 {
            return Err(invalid("truncated fat header"));
        }
        let nfat = u32::from_be_bytes(data[4..8].try_into().expect("4 bytes")) as usize;
        if nfat == 0 {
            return Err(invalid("fat binary with no architectures"));
        }
        let mut arches = Vec::with_capacity(nfat);
        for i in 0..nfat {
            let off = 8 + i * 20;
            let entry = data
                .get(off..off + 20)
                .ok_or_else(|| invalid("truncated fat arch table"))?;
            let word = |j: usize| -> u32 {
                u32::from_be_bytes(entry[j * 4..j * 4 + 4].try_into().expect("4 bytes"))
            };
            arches.push(FatArch {
                cputype: word(0),
                cpusubtype: word(1),
                offset: word(2),
                size: word(3),
                align: word(4),
            });
        }
        let first = arches[0];
        let slice = data
            .get(first.offset as usize..(first.offset + first.size) as usize)
            .ok_or_else(|| invalid("fat slice 0 out of bounds"))?;
        let binary = MachoFile::parse(slice)?;
        Ok(Self::Fat {
            raw: data.to_vec(),
            arches,
            binary,
        })
    }

    /// The binary mutations apply to (slice 0 for universal files).
    pub fn binary(&self) -> &MachoFile {
        match self {
            Self::Thin(b) => b,
            Self::Fat { binary, .. } => binary,
        }
    }

    /// Mutable access to the operative binary.
    pub fn binary_mut(&mut self) -> &mut MachoFile {
        match self {
            Self::Thin(b) => b,
            Self::Fat { binary, .. } => binary,
        }
    }

    /// Serialize the container, reassembling the fat layout around the
    /// rewritten slice 0 when needed.
    pub fn write(&self) -> Vec<u8> {
        match self {
            Self::Thin(b) => b.write(),
            Self::Fat { raw, arches, binary } => {
                let slice0 = binary.write();
                let mut out = Vec::new();
                out.extend(&FAT_MAGIC.to_be_bytes());
                out.extend(&(arches.len() as u32).to_be_bytes());

                // Reserve the arch table; offsets are filled as slices
                // are placed at their alignment.
                let table_at = out.len();
                out.resize(out.len() + arches.len() * 20, 0);

                let mut placed: Vec<FatArch> = Vec::with_capacity(arches.len());
                for (i, arch) in arches.iter().enumerate() {
                    let data = if i == 0 {
                        slice0.clone()
                    } else {
                        raw[arch.offset as usize..(arch.offset + arch.size) as usize].to_vec()
                    };
                    let alignment = 1usize << arch.align.min(20);
                    let pos = (out.len() + alignment - 1) & !(alignment - 1);
                    out.resize(pos, 0);
                    placed.push(FatArch {
                        offset: pos as u32,
                        size: data.len() as u32,
                        ..*arch
                    });
                    out.extend(&data);
                }
                for (i, arch) in placed.iter().enumerate() {
                    let at = table_at + i * 20;
                    out[at..at + 4].copy_from_slice(&arch.cputype.to_be_bytes());
                    out[at + 4..at + 8].copy_from_slice(&arch.cpusubtype.to_be_bytes());
                    out[at + 8..at + 12].copy_from_slice(&arch.offset.to_be_bytes());
                    out[at + 12..at + 16].copy_from_slice(&arch.size.to_be_bytes());
                    out[at + 16..at + 20].copy_from_slice(&arch.align.to_be_bytes());
                }
                out
            }
        }
    }
}

/// Re-sign a binary in place with an ad-hoc identity via the host
/// `codesign` utility. Invoked after every mutation on macOS; a no-op
/// elsewhere. PATH is not consulted.
pub fn codesign(path: &Path) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("/usr/bin/codesign")
            .args(["--sign", "-", "--force"])
            .arg(path)
            .output()
            .map_err(|e| Error::CodesignFailed(format!("{}: {e}", path.display())))?;
        if !output.status.success() {
            return Err(Error::CodesignFailed(format!(
                "{}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(path = %path.display(), "re-signed");
        Ok(())
    }
    #[cfg(not(target_os = "macos"))]
    {
        tracing::debug!(path = %path.display(), "codesign skipped off-macOS");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal thin Mach-O: __TEXT (covering the headers, one
    /// `__text` section at 0x400) and __LINKEDIT at 0x500.
    fn build_macho() -> Vec<u8> {
        let text_seg = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            segname: fixed_name("__TEXT"),
            vmaddr: 0x100000000,
            vmsize: MACHO_PAGE_SIZE as u64,
            fileoff: 0,
            filesize: 0x500,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            flags: 0,
        };
        let text_sect = Section64 {
            sectname: fixed_name("__text"),
            segname: fixed_name("__TEXT"),
            addr: 0x100000400,
            size: 0x100,
            offset: 0x400,
            align: 4,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        let linkedit = SegmentCommand64 {
            cmd: LC_SEGMENT_64,
            cmdsize: SegmentCommand64::SIZE as u32,
            segname: fixed_name("__LINKEDIT"),
            vmaddr: 0x100000000 + MACHO_PAGE_SIZE as u64,
            vmsize: MACHO_PAGE_SIZE as u64,
            fileoff: 0x500,
            filesize: 0x100,
            maxprot: 1,
            initprot: 1,
            nsects: 0,
            flags: 0,
        };
        let symtab = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: SymtabCommand::SIZE as u32,
            symoff: 0x500,
            nsyms: 0,
            stroff: 0x550,
            strsize: 0x10,
        };

        let sizeofcmds = (SegmentCommand64::SIZE + Section64::SIZE)
            + SegmentCommand64::SIZE
            + SymtabCommand::SIZE;
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: 0x0100000c, // ARM64
            cpusubtype: 0,
            filetype: 2, // MH_EXECUTE
            ncmds: 3,
            sizeofcmds: sizeofcmds as u32,
            flags: 0,
            reserved: 0,
        };

        let mut out = Vec::new();
        header.emit(&mut out);
        text_seg.emit(&mut out);
        text_sect.emit(&mut out);
        linkedit.emit(&mut out);
        symtab.emit(&mut out);

        out.resize(0x400, 0);
        out.extend(vec![0x90u8; 0x100]); // __text
        out.resize(0x600, 0x2a); // __LINKEDIT content
        out
    }

    #[test]
    fn test_parse_roundtrip() {
        let data = build_macho();
        let macho = MachoFile::parse(&data).unwrap();
        assert_eq!(macho.header.ncmds, 3);
        assert!(macho.find_segment_index("__TEXT").is_some());
        assert!(macho.find_segment_index("__LINKEDIT").is_some());
        assert_eq!(macho.write(), data);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut data = build_macho();
        data[0] = 0;
        assert!(MachoFile::parse(&data).is_err());
    }

    #[test]
    fn test_parse_carries_unknown_commands_raw() {
        // Append an LC_UUID-style command the model does not parse; its
        // bytes must survive a rewrite untouched.
        let mut data = build_macho();
        let mut uuid_cmd = Vec::new();
        uuid_cmd.put_u32(0x1b); // LC_UUID
        uuid_cmd.put_u32(24);
        uuid_cmd.put_bytes(&[0xdd; 16]);

        // Rebuild with the extra command in the padding after the others.
        let insert_at = MachHeader64::SIZE
            + (SegmentCommand64::SIZE + Section64::SIZE)
            + SegmentCommand64::SIZE
            + SymtabCommand::SIZE;
        data.splice(insert_at..insert_at + 24, uuid_cmd.iter().copied());
        let ncmds_at = 16;
        data[ncmds_at..ncmds_at + 4].copy_from_slice(&4u32.to_le_bytes());
        let sizeofcmds = (insert_at - MachHeader64::SIZE + 24) as u32;
        data[20..24].copy_from_slice(&sizeofcmds.to_le_bytes());

        let macho = MachoFile::parse(&data).unwrap();
        let raw = macho
            .load_commands
            .iter()
            .find_map(|c| match c {
                ParsedLoadCommand::Other { cmd, data } => Some((*cmd, data.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(raw.0, 0x1b);
        assert_eq!(raw.1, vec![0xdd; 16]);
        assert_eq!(macho.write(), data);
    }

    #[test]
    fn test_parse_size_mismatch_falls_back_to_raw() {
        // A symtab command whose cmdsize disagrees with the fixed layout
        // must be carried through raw, not re-serialized short.
        let mut data = build_macho();
        // The symtab command starts after the two segments.
        let symtab_at =
            MachHeader64::SIZE + (SegmentCommand64::SIZE + Section64::SIZE) + SegmentCommand64::SIZE;
        // Inflate its declared size by 8 (the padding after it is zeros).
        data[symtab_at + 4..symtab_at + 8].copy_from_slice(&32u32.to_le_bytes());
        data[20..24].copy_from_slice(
            &((SegmentCommand64::SIZE + Section64::SIZE + SegmentCommand64::SIZE + 32) as u32)
                .to_le_bytes(),
        );

        let macho = MachoFile::parse(&data).unwrap();
        assert!(macho
            .load_commands
            .iter()
            .any(|c| matches!(c, ParsedLoadCommand::Other { cmd, .. } if *cmd == LC_SYMTAB)));
        assert_eq!(macho.write(), data);
    }

    #[test]
    fn test_add_segment_and_extract() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        let payload = vec![0x42u8; 1000];

        macho
            .add_segment_with_section("NODE_SEA", "__NODE_SEA_BLOB", &payload)
            .unwrap();

        let rewritten = macho.write();
        let reparsed = MachoFile::parse(&rewritten).unwrap();

        let section = reparsed.find_section("NODE_SEA", "__NODE_SEA_BLOB").unwrap();
        assert_eq!(section.size, 1000);
        let content = reparsed.section_content(section).unwrap();
        assert_eq!(content, &payload[..]);

        // __LINKEDIT moved past the new segment and its content is intact.
        let linkedit = reparsed.find_linkedit().unwrap();
        assert_eq!(linkedit.fileoff as usize, 0x500 + MACHO_PAGE_SIZE);
        let le_rel = linkedit.fileoff as usize - reparsed.data_offset;
        assert_eq!(reparsed.file_data[le_rel], 0x2a);

        // Symtab offsets were shifted along with __LINKEDIT.
        let symtab = reparsed
            .load_commands
            .iter()
            .find_map(|c| match c {
                ParsedLoadCommand::Symtab(st) => Some(*st),
                _ => None,
            })
            .unwrap();
        assert_eq!(symtab.symoff as usize, 0x500 + MACHO_PAGE_SIZE);
    }

    #[test]
    fn test_add_segment_twice_rejected() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        macho
            .add_segment_with_section("SMOL", "__PRESSED_DATA", &[1, 2, 3])
            .unwrap();
        assert!(macho
            .add_segment_with_section("SMOL", "__PRESSED_DATA", &[4, 5])
            .is_err());
    }

    #[test]
    fn test_remove_segment_restores_layout() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        macho
            .add_segment_with_section("SMOL", "__PRESSED_DATA", &[7u8; 500])
            .unwrap();
        macho.remove_segment_by_name("SMOL").unwrap();

        let rewritten = macho.write();
        assert_eq!(rewritten, data, "add followed by remove restores the file");
    }

    #[test]
    fn test_remove_missing_segment() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        assert!(matches!(
            macho.remove_segment_by_name("NOPE"),
            Err(Error::SegmentNotFound(_))
        ));
    }

    #[test]
    fn test_replace_section_content_same_page_count() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        macho
            .add_segment_with_section("NODE_SEA", "__SMOL_VFS_BLOB", &[1u8; 100])
            .unwrap();
        macho
            .replace_section_content("NODE_SEA", "__SMOL_VFS_BLOB", &[2u8; 200])
            .unwrap();

        let reparsed = MachoFile::parse(&macho.write()).unwrap();
        let section = reparsed.find_section("NODE_SEA", "__SMOL_VFS_BLOB").unwrap();
        assert_eq!(section.size, 200);
        assert_eq!(
            reparsed.section_content(section).unwrap(),
            &[2u8; 200][..]
        );
    }

    #[test]
    fn test_replace_section_content_grows_pages() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        macho
            .add_segment_with_section("NODE_SEA", "__NODE_SEA_BLOB", &[1u8; 100])
            .unwrap();
        let grown = vec![3u8; MACHO_PAGE_SIZE + 10];
        macho
            .replace_section_content("NODE_SEA", "__NODE_SEA_BLOB", &grown)
            .unwrap();

        let reparsed = MachoFile::parse(&macho.write()).unwrap();
        let section = reparsed.find_section("NODE_SEA", "__NODE_SEA_BLOB").unwrap();
        assert_eq!(section.size, grown.len() as u64);
        assert_eq!(reparsed.section_content(section).unwrap(), &grown[..]);

        // __LINKEDIT content survived the shift.
        let linkedit = reparsed.find_linkedit().unwrap();
        let le_rel = linkedit.fileoff as usize - reparsed.data_offset;
        assert_eq!(reparsed.file_data[le_rel], 0x2a);
    }

    #[test]
    fn test_fat_container_roundtrip() {
        let thin = build_macho();
        // Assemble a one-arch fat file by hand.
        let mut fat = Vec::new();
        fat.extend(&FAT_MAGIC.to_be_bytes());
        fat.extend(&1u32.to_be_bytes());
        fat.extend(&0x0100000cu32.to_be_bytes()); // cputype
        fat.extend(&0u32.to_be_bytes()); // cpusubtype
        fat.extend(&64u32.to_be_bytes()); // offset
        fat.extend(&(thin.len() as u32).to_be_bytes()); // size
        fat.extend(&6u32.to_be_bytes()); // align (2^6)
        fat.resize(64, 0);
        fat.extend(&thin);

        let mut container = MachoContainer::parse(&fat).unwrap();
        assert!(matches!(container, MachoContainer::Fat { .. }));
        container
            .binary_mut()
            .add_segment_with_section("SMOL", "__PRESSED_DATA", &[9u8; 64])
            .unwrap();

        let rewritten = container.write();
        let reparsed = MachoContainer::parse(&rewritten).unwrap();
        assert!(reparsed
            .binary()
            .find_section("SMOL", "__PRESSED_DATA")
            .is_some());
    }

    #[test]
    fn test_sections_of() {
        let data = build_macho();
        let mut macho = MachoFile::parse(&data).unwrap();
        macho
            .add_segment_with_section("NODE_SEA", "__NODE_SEA_BLOB", &[1u8; 10])
            .unwrap();
        let sections = macho.sections_of("NODE_SEA");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].name(), "__NODE_SEA_BLOB");
        assert!(macho.sections_of("SMOL").is_empty());
    }
}
