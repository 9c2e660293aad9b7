//! PE (Portable Executable) manipulation.
//!
//! PE has no segment concept; injected blobs live either in the `.rsrc`
//! resource tree as RT_RCDATA entries named in UTF-16, or in a dedicated
//! `.pressed_data` section. Resource mutation rebuilds the whole tree:
//! entries are parsed into an in-memory model, edited, and re-serialized
//! (directories, then name strings, then data entries, then blobs).

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Resource type id for raw data resources.
pub const RT_RCDATA: u32 = 10;

const DOS_MAGIC: [u8; 2] = [b'M', b'Z'];
const PE_SIGNATURE: [u8; 4] = [b'P', b'E', 0, 0];
const SECTION_HEADER_SIZE: usize = 40;
const RESOURCE_DIR_INDEX: usize = 2;

/// IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ
const DATA_SECTION_CHARACTERISTICS: u32 = 0x4000_0040;

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidFormat(msg.into())
}

fn align_to(v: u32, a: u32) -> u32 {
    if a == 0 {
        return v;
    }
    (v + a - 1) & !(a - 1)
}

/// One entry of the PE section table.
#[derive(Debug, Clone)]
pub struct PeSectionHeader {
    /// Padded section name.
    pub name: [u8; 8],
    /// Size of the section in memory.
    pub virtual_size: u32,
    /// RVA the section is mapped at.
    pub virtual_address: u32,
    /// Size of the raw data on disk.
    pub size_of_raw_data: u32,
    /// File offset of the raw data.
    pub pointer_to_raw_data: u32,
    /// Unused for executables this tooling targets.
    pub pointer_to_relocations: u32,
    /// Unused.
    pub pointer_to_linenumbers: u32,
    /// Unused.
    pub number_of_relocations: u16,
    /// Unused.
    pub number_of_linenumbers: u16,
    /// Section flags.
    pub characteristics: u32,
}

impl PeSectionHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SECTION_HEADER_SIZE {
            return Err(invalid("truncated section header"));
        }
        let mut name = [0u8; 8];
        name.copy_from_slice(&data[0..8]);
        Ok(Self {
            name,
            virtual_size: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            virtual_address: u32::from_le_bytes(data[12..16].try_into().unwrap()),
            size_of_raw_data: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            pointer_to_raw_data: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            pointer_to_relocations: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            pointer_to_linenumbers: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            number_of_relocations: u16::from_le_bytes(data[32..34].try_into().unwrap()),
            number_of_linenumbers: u16::from_le_bytes(data[34..36].try_into().unwrap()),
            characteristics: u32::from_le_bytes(data[36..40].try_into().unwrap()),
        })
    }

    fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.name);
        out[8..12].copy_from_slice(&self.virtual_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.virtual_address.to_le_bytes());
        out[16..20].copy_from_slice(&self.size_of_raw_data.to_le_bytes());
        out[20..24].copy_from_slice(&self.pointer_to_raw_data.to_le_bytes());
        out[24..28].copy_from_slice(&self.pointer_to_relocations.to_le_bytes());
        out[28..32].copy_from_slice(&self.pointer_to_linenumbers.to_le_bytes());
        out[32..34].copy_from_slice(&self.number_of_relocations.to_le_bytes());
        out[34..36].copy_from_slice(&self.number_of_linenumbers.to_le_bytes());
        out[36..40].copy_from_slice(&self.characteristics.to_le_bytes());
        out
    }

    /// Section name with padding stripped.
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Resource tree model
// ---------------------------------------------------------------------------

/// Identifier of a resource directory entry: numeric id or UTF-16 name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsrcId {
    /// Numeric identifier.
    Id(u32),
    /// UTF-16 name.
    Name(Vec<u16>),
}

/// A node of the resource tree.
#[derive(Debug, Clone)]
pub enum RsrcNode {
    /// Directory with child entries.
    Dir(RsrcDir),
    /// Leaf data.
    Data {
        /// Resource bytes.
        bytes: Vec<u8>,
        /// Code page recorded in the data entry.
        codepage: u32,
    },
}

/// A resource directory: entries sorted names-first (by UTF-16 sequence),
/// then ids ascending, as the on-disk format requires.
#[derive(Debug, Clone, Default)]
pub struct RsrcDir {
    /// Child entries.
    pub entries: Vec<(RsrcId, RsrcNode)>,
}

impl RsrcDir {
    fn sort(&mut self) {
        self.entries.sort_by(|a, b| match (&a.0, &b.0) {
            (RsrcId::Name(x), RsrcId::Name(y)) => x.cmp(y),
            (RsrcId::Name(_), RsrcId::Id(_)) => std::cmp::Ordering::Less,
            (RsrcId::Id(_), RsrcId::Name(_)) => std::cmp::Ordering::Greater,
            (RsrcId::Id(x), RsrcId::Id(y)) => x.cmp(y),
        });
    }

    fn child_mut(&mut self, id: &RsrcId) -> Option<&mut RsrcNode> {
        self.entries
            .iter_mut()
            .find(|(i, _)| i == id)
            .map(|(_, n)| n)
    }

    fn child(&self, id: &RsrcId) -> Option<&RsrcNode> {
        self.entries.iter().find(|(i, _)| i == id).map(|(_, n)| n)
    }
}

fn utf16_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

// ---------------------------------------------------------------------------
// PeFile
// ---------------------------------------------------------------------------

/// A parsed PE image with staged mutations applied directly to the byte
/// buffer and the section table.
#[derive(Debug)]
pub struct PeFile {
    data: Vec<u8>,
    pe_offset: usize,
    opt_offset: usize,
    is_plus: bool,
    section_table_offset: usize,
    section_alignment: u32,
    file_alignment: u32,
    size_of_image: u32,
    size_of_headers: u32,
    resource_dir: Option<(u32, u32)>,
    /// Section table, in file order.
    pub sections: Vec<PeSectionHeader>,
}

impl PeFile {
    /// Parse a PE32 or PE32+ image.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < 0x40 || data[0..2] != DOS_MAGIC {
            return Err(invalid("missing MZ header"));
        }
        let pe_offset = u32::from_le_bytes(data[0x3c..0x40].try_into().unwrap()) as usize;
        if pe_offset + 24 > data.len() || data[pe_offset..pe_offset + 4] != PE_SIGNATURE {
            return Err(invalid("missing PE signature"));
        }

        let coff = pe_offset + 4;
        let num_sections = u16::from_le_bytes(data[coff + 2..coff + 4].try_into().unwrap());
        let opt_size =
            u16::from_le_bytes(data[coff + 16..coff + 18].try_into().unwrap()) as usize;
        let opt_offset = coff + 20;
        if opt_offset + opt_size > data.len() || opt_size < 112 {
            return Err(invalid("optional header out of bounds"));
        }

        let opt_magic = u16::from_le_bytes(data[opt_offset..opt_offset + 2].try_into().unwrap());
        let is_plus = match opt_magic {
            0x20b => true,
            0x10b => false,
            other => return Err(invalid(format!("unknown optional header magic 0x{other:x}"))),
        };

        let section_alignment =
            u32::from_le_bytes(data[opt_offset + 32..opt_offset + 36].try_into().unwrap());
        let file_alignment =
            u32::from_le_bytes(data[opt_offset + 36..opt_offset + 40].try_into().unwrap());
        let size_of_image =
            u32::from_le_bytes(data[opt_offset + 56..opt_offset + 60].try_into().unwrap());
        let size_of_headers =
            u32::from_le_bytes(data[opt_offset + 60..opt_offset + 64].try_into().unwrap());

        let dirs_offset = opt_offset + if is_plus { 112 } else { 96 };
        let dir_count_offset = dirs_offset - 4;
        let dir_count =
            u32::from_le_bytes(data[dir_count_offset..dirs_offset].try_into().unwrap()) as usize;
        let resource_dir = if dir_count > RESOURCE_DIR_INDEX {
            let at = dirs_offset + RESOURCE_DIR_INDEX * 8;
            if at + 8 <= data.len() {
                let rva = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
                let size = u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap());
                if rva != 0 {
                    Some((rva, size))
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            None
        };

        let section_table_offset = opt_offset + opt_size;
        let mut sections = Vec::with_capacity(num_sections as usize);
        for i in 0..num_sections as usize {
            let at = section_table_offset + i * SECTION_HEADER_SIZE;
            let end = at + SECTION_HEADER_SIZE;
            if end > data.len() {
                return Err(invalid("section table out of bounds"));
            }
            sections.push(PeSectionHeader::parse(&data[at..end])?);
        }

        Ok(Self {
            data,
            pe_offset,
            opt_offset,
            is_plus,
            section_table_offset,
            section_alignment,
            file_alignment,
            size_of_image,
            size_of_headers,
            resource_dir,
            sections,
        })
    }

    /// Translate an RVA into a file offset through the section table.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        for s in &self.sections {
            let span = s.virtual_size.max(s.size_of_raw_data);
            if rva >= s.virtual_address && rva < s.virtual_address + span {
                let delta = rva - s.virtual_address;
                if delta < s.size_of_raw_data {
                    return Some((s.pointer_to_raw_data + delta) as usize);
                }
                return None;
            }
        }
        None
    }

    /// Section lookup by name.
    pub fn section_by_name(&self, name: &str) -> Option<&PeSectionHeader> {
        self.sections.iter().find(|s| s.name_str() == name)
    }

    /// Whether a section with this name exists.
    pub fn has_section(&self, name: &str) -> bool {
        self.section_by_name(name).is_some()
    }

    /// Raw content of a named section (up to `virtual_size` bytes, the
    /// meaningful extent).
    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        let s = self.section_by_name(name)?;
        let start = s.pointer_to_raw_data as usize;
        let len = s.virtual_size.min(s.size_of_raw_data) as usize;
        self.data.get(start..start + len)
    }

    /// Scan every section's raw content for the unflipped fuse sentinel
    /// and arm the first match. Returns whether a flip happened.
    pub fn flip_fuse(&mut self) -> bool {
        for s in &self.sections {
            let start = s.pointer_to_raw_data as usize;
            let end = start + s.size_of_raw_data as usize;
            if end > self.data.len() || start >= end {
                continue;
            }
            if crate::fuse::flip_raw(&mut self.data[start..end]) {
                return true;
            }
        }
        false
    }

    // -- resource tree ------------------------------------------------------

    fn rsrc_base(&self) -> Option<(u32, usize)> {
        let (rva, _) = self.resource_dir?;
        Some((rva, self.rva_to_offset(rva)?))
    }

    /// Parse the resource tree, or an empty root when the image has none.
    pub fn resource_tree(&self) -> RsrcDir {
        match self.rsrc_base() {
            Some((rva, base)) => self
                .parse_dir(rva, base, 0, 0)
                .unwrap_or_default(),
            None => RsrcDir::default(),
        }
    }

    fn parse_dir(&self, base_rva: u32, base: usize, rel: u32, depth: u32) -> Option<RsrcDir> {
        if depth > 4 {
            return None;
        }
        let at = base + rel as usize;
        let hdr = self.data.get(at..at + 16)?;
        let named = u16::from_le_bytes(hdr[12..14].try_into().unwrap()) as usize;
        let ids = u16::from_le_bytes(hdr[14..16].try_into().unwrap()) as usize;
        let mut dir = RsrcDir::default();
        for i in 0..named + ids {
            let eat = at + 16 + i * 8;
            let entry = self.data.get(eat..eat + 8)?;
            let name_field = u32::from_le_bytes(entry[0..4].try_into().unwrap());
            let offset_field = u32::from_le_bytes(entry[4..8].try_into().unwrap());

            let id = if name_field & 0x8000_0000 != 0 {
                let nat = base + (name_field & 0x7fff_ffff) as usize;
                let len_bytes = self.data.get(nat..nat + 2)?;
                let chars = u16::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let raw = self.data.get(nat + 2..nat + 2 + chars * 2)?;
                let mut name = Vec::with_capacity(chars);
                for c in raw.chunks_exact(2) {
                    name.push(u16::from_le_bytes(c.try_into().unwrap()));
                }
                RsrcId::Name(name)
            } else {
                RsrcId::Id(name_field)
            };

            let node = if offset_field & 0x8000_0000 != 0 {
                RsrcNode::Dir(self.parse_dir(
                    base_rva,
                    base,
                    offset_field & 0x7fff_ffff,
                    depth + 1,
                )?)
            } else {
                let dat = base + offset_field as usize;
                let de = self.data.get(dat..dat + 16)?;
                let data_rva = u32::from_le_bytes(de[0..4].try_into().unwrap());
                let size = u32::from_le_bytes(de[4..8].try_into().unwrap());
                let codepage = u32::from_le_bytes(de[8..12].try_into().unwrap());
                let off = self.rva_to_offset(data_rva)?;
                let bytes = self.data.get(off..off + size as usize)?.to_vec();
                RsrcNode::Data { bytes, codepage }
            };
            dir.entries.push((id, node));
        }
        Some(dir)
    }

    /// Find an RT_RCDATA resource by UTF-16 name; returns its bytes. The
    /// size comes from the first language child (the data node).
    pub fn find_rcdata(&self, name: &str) -> Option<Vec<u8>> {
        let tree = self.resource_tree();
        let type_dir = match tree.child(&RsrcId::Id(RT_RCDATA))? {
            RsrcNode::Dir(d) => d,
            RsrcNode::Data { .. } => return None,
        };
        let name_dir = match type_dir.child(&RsrcId::Name(utf16_name(name)))? {
            RsrcNode::Dir(d) => d,
            RsrcNode::Data { .. } => return None,
        };
        // First language child carries the data.
        match name_dir.entries.first()? {
            (_, RsrcNode::Data { bytes, .. }) => Some(bytes.clone()),
            (_, RsrcNode::Dir(_)) => None,
        }
    }

    /// Names of all RT_RCDATA resources.
    pub fn rcdata_names(&self) -> Vec<String> {
        let tree = self.resource_tree();
        let mut out = Vec::new();
        if let Some(RsrcNode::Dir(type_dir)) = tree.child(&RsrcId::Id(RT_RCDATA)) {
            for (id, _) in &type_dir.entries {
                if let RsrcId::Name(name) = id {
                    out.push(String::from_utf16_lossy(name));
                }
            }
        }
        out
    }

    /// Insert or replace an RT_RCDATA resource and rebuild `.rsrc`.
    pub fn insert_rcdata(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut tree = self.resource_tree();
        let type_id = RsrcId::Id(RT_RCDATA);
        if tree.child(&type_id).is_none() {
            tree.entries.push((type_id.clone(), RsrcNode::Dir(RsrcDir::default())));
        }
        let Some(RsrcNode::Dir(type_dir)) = tree.child_mut(&type_id) else {
            return Err(invalid("RT_RCDATA entry is not a directory"));
        };

        let name_id = RsrcId::Name(utf16_name(name));
        let lang_dir = RsrcDir {
            entries: vec![(
                RsrcId::Id(0),
                RsrcNode::Data {
                    bytes: bytes.to_vec(),
                    codepage: 0,
                },
            )],
        };
        match type_dir.child_mut(&name_id) {
            Some(node) => *node = RsrcNode::Dir(lang_dir),
            None => type_dir.entries.push((name_id, RsrcNode::Dir(lang_dir))),
        }

        self.rebuild_rsrc(tree)
    }

    /// Remove an RT_RCDATA resource. Returns whether it existed.
    pub fn remove_rcdata(&mut self, name: &str) -> Result<bool> {
        let mut tree = self.resource_tree();
        let name_id = RsrcId::Name(utf16_name(name));
        let mut removed = false;
        if let Some(RsrcNode::Dir(type_dir)) = tree.child_mut(&RsrcId::Id(RT_RCDATA)) {
            let before = type_dir.entries.len();
            type_dir.entries.retain(|(id, _)| *id != name_id);
            removed = type_dir.entries.len() != before;
        }
        // Drop an emptied RT_RCDATA directory.
        tree.entries.retain(|(id, node)| {
            !(matches!(id, RsrcId::Id(t) if *t == RT_RCDATA)
                && matches!(node, RsrcNode::Dir(d) if d.entries.is_empty()))
        });
        if removed {
            self.rebuild_rsrc(tree)?;
        }
        Ok(removed)
    }

    fn rebuild_rsrc(&mut self, mut tree: RsrcDir) -> Result<()> {
        sort_tree(&mut tree);

        // Serialize at the existing .rsrc RVA when there is one; fall
        // back to a fresh section otherwise.
        if let Some((rva, _)) = self.resource_dir {
            let serialized = serialize_tree(&tree, rva);
            let sect_idx = self
                .sections
                .iter()
                .position(|s| {
                    rva >= s.virtual_address
                        && rva < s.virtual_address + s.virtual_size.max(s.size_of_raw_data)
                })
                .ok_or_else(|| invalid("resource directory outside any section"))?;

            let fits = serialized.len() as u32 <= self.sections[sect_idx].size_of_raw_data;
            if fits {
                let start = self.sections[sect_idx].pointer_to_raw_data as usize;
                self.data[start..start + serialized.len()].copy_from_slice(&serialized);
                let raw_size = self.sections[sect_idx].size_of_raw_data as usize;
                self.data[start + serialized.len()..start + raw_size].fill(0);
                self.sections[sect_idx].virtual_size = serialized.len() as u32;
                self.resource_dir = Some((rva, serialized.len() as u32));
                return Ok(());
            }

            let is_last_va = self
                .sections
                .iter()
                .all(|s| s.virtual_address <= self.sections[sect_idx].virtual_address);
            let is_last_raw = self
                .sections
                .iter()
                .all(|s| s.pointer_to_raw_data <= self.sections[sect_idx].pointer_to_raw_data);
            if is_last_va && is_last_raw {
                // Grow the trailing .rsrc section in place.
                let serialized = serialize_tree(&tree, rva);
                let start = self.sections[sect_idx].pointer_to_raw_data as usize;
                let new_raw = align_to(serialized.len() as u32, self.file_alignment);
                self.data.truncate(start);
                self.data.extend_from_slice(&serialized);
                self.data.resize(start + new_raw as usize, 0);
                let section = &mut self.sections[sect_idx];
                section.size_of_raw_data = new_raw;
                section.virtual_size = serialized.len() as u32;
                self.size_of_image = align_to(
                    section.virtual_address + serialized.len() as u32,
                    self.section_alignment,
                );
                self.resource_dir = Some((rva, serialized.len() as u32));
                return Ok(());
            }
        }

        // New section at a fresh RVA.
        let rva = align_to(self.size_of_image, self.section_alignment);
        let serialized = serialize_tree(&tree, rva);
        self.add_section_raw(".rsrc", &serialized, DATA_SECTION_CHARACTERISTICS)?;
        self.resource_dir = Some((rva, serialized.len() as u32));
        Ok(())
    }

    // -- sections -----------------------------------------------------------

    /// Append a section at the end of the image.
    pub fn add_section_raw(&mut self, name: &str, bytes: &[u8], characteristics: u32) -> Result<u32> {
        // The new header must fit in the headers region.
        let table_end =
            self.section_table_offset + (self.sections.len() + 1) * SECTION_HEADER_SIZE;
        let first_raw = self
            .sections
            .iter()
            .filter(|s| s.pointer_to_raw_data != 0)
            .map(|s| s.pointer_to_raw_data)
            .min()
            .unwrap_or(self.size_of_headers);
        if table_end as u32 > self.size_of_headers.min(first_raw) {
            return Err(invalid("no room in headers for a new section"));
        }

        let rva = align_to(self.size_of_image, self.section_alignment);
        let raw_ptr = align_to(self.data.len() as u32, self.file_alignment);
        let raw_size = align_to(bytes.len().max(1) as u32, self.file_alignment);

        self.data.resize(raw_ptr as usize, 0);
        self.data.extend_from_slice(bytes);
        self.data.resize((raw_ptr + raw_size) as usize, 0);

        let mut name_bytes = [0u8; 8];
        let n = name.len().min(8);
        name_bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.sections.push(PeSectionHeader {
            name: name_bytes,
            virtual_size: bytes.len().max(1) as u32,
            virtual_address: rva,
            size_of_raw_data: raw_size,
            pointer_to_raw_data: raw_ptr,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics,
        });
        self.size_of_image = align_to(rva + bytes.len().max(1) as u32, self.section_alignment);
        Ok(rva)
    }

    /// Add a data section carrying an injected payload.
    pub fn add_data_section(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        if self.has_section(name) {
            return Err(invalid(format!("section {name} already present")));
        }
        self.add_section_raw(name, bytes, DATA_SECTION_CHARACTERISTICS)?;
        Ok(())
    }

    /// Remove a section header by name. The raw region becomes dead file
    /// space; the image size is recomputed from the surviving sections.
    pub fn remove_section(&mut self, name: &str) -> Result<()> {
        let idx = self
            .sections
            .iter()
            .position(|s| s.name_str() == name)
            .ok_or_else(|| Error::SectionNotFound(name.to_string()))?;
        self.sections.remove(idx);
        self.size_of_image = self
            .sections
            .iter()
            .map(|s| align_to(s.virtual_address + s.virtual_size.max(1), self.section_alignment))
            .max()
            .unwrap_or(self.size_of_headers);
        Ok(())
    }

    /// Serialize the image: headers and the section table are patched
    /// into the working buffer.
    pub fn write(&self) -> Result<Vec<u8>> {
        let mut out = self.data.clone();

        let coff = self.pe_offset + 4;
        out[coff + 2..coff + 4].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
        out[self.opt_offset + 56..self.opt_offset + 60]
            .copy_from_slice(&self.size_of_image.to_le_bytes());

        let dirs_offset = self.opt_offset + if self.is_plus { 112 } else { 96 };
        let at = dirs_offset + RESOURCE_DIR_INDEX * 8;
        if at + 8 <= out.len() {
            let (rva, size) = self.resource_dir.unwrap_or((0, 0));
            out[at..at + 4].copy_from_slice(&rva.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        }

        let table_end = self.section_table_offset + self.sections.len() * SECTION_HEADER_SIZE;
        if table_end as u32 > self.size_of_headers {
            return Err(invalid("section table overflows headers"));
        }
        for (i, s) in self.sections.iter().enumerate() {
            let sat = self.section_table_offset + i * SECTION_HEADER_SIZE;
            out[sat..sat + SECTION_HEADER_SIZE].copy_from_slice(&s.to_bytes());
        }
        // Zero any now-unused trailing table slots.
        let headers_end = self.size_of_headers as usize;
        if table_end < headers_end && headers_end <= out.len() {
            let dead_end = headers_end.min(table_end + 4 * SECTION_HEADER_SIZE);
            out[table_end..dead_end].fill(0);
        }

        Ok(out)
    }
}

fn sort_tree(dir: &mut RsrcDir) {
    dir.sort();
    for (_, node) in &mut dir.entries {
        if let RsrcNode::Dir(d) = node {
            sort_tree(d);
        }
    }
}

/// Serialize a resource tree for placement at `base_rva`: directory
/// tables in breadth-first order, then name strings, then data entries,
/// then the blobs themselves.
fn serialize_tree(root: &RsrcDir, base_rva: u32) -> Vec<u8> {
    // Breadth-first directory order.
    let mut dirs: Vec<&RsrcDir> = vec![root];
    let mut i = 0;
    while i < dirs.len() {
        for (_, node) in &dirs[i].entries {
            if let RsrcNode::Dir(d) = node {
                dirs.push(d);
            }
        }
        i += 1;
    }

    let mut dir_offsets = Vec::with_capacity(dirs.len());
    let mut cursor: u32 = 0;
    for d in &dirs {
        dir_offsets.push(cursor);
        cursor += 16 + 8 * d.entries.len() as u32;
    }

    // Name strings.
    let mut string_offsets: HashMap<Vec<u16>, u32> = HashMap::new();
    for d in &dirs {
        for (id, _) in &d.entries {
            if let RsrcId::Name(name) = id {
                string_offsets.entry(name.clone()).or_insert_with(|| {
                    let at = cursor;
                    cursor += 2 + 2 * name.len() as u32;
                    at
                });
            }
        }
    }

    cursor = (cursor + 3) & !3;

    // Data entries, in BFS traversal order.
    let mut data_entry_offsets = Vec::new();
    for d in &dirs {
        for (_, node) in &d.entries {
            if let RsrcNode::Data { .. } = node {
                data_entry_offsets.push(cursor);
                cursor += 16;
            }
        }
    }

    cursor = (cursor + 7) & !7;

    // Blob placement.
    let mut blob_rvas = Vec::new();
    for d in &dirs {
        for (_, node) in &d.entries {
            if let RsrcNode::Data { bytes, .. } = node {
                blob_rvas.push(base_rva + cursor);
                cursor += (bytes.len() as u32 + 7) & !7;
            }
        }
    }
    let total = cursor as usize;

    // Emit.
    let mut out = vec![0u8; total];
    let mut next_child_dir = 1usize; // BFS index of the next subdirectory
    let mut next_data = 0usize;
    for (di, d) in dirs.iter().enumerate() {
        let at = dir_offsets[di] as usize;
        let named = d
            .entries
            .iter()
            .filter(|(id, _)| matches!(id, RsrcId::Name(_)))
            .count() as u16;
        let ids = d.entries.len() as u16 - named;
        out[at + 12..at + 14].copy_from_slice(&named.to_le_bytes());
        out[at + 14..at + 16].copy_from_slice(&ids.to_le_bytes());

        for (ei, (id, node)) in d.entries.iter().enumerate() {
            let eat = at + 16 + ei * 8;
            let name_field = match id {
                RsrcId::Name(name) => 0x8000_0000 | string_offsets[name],
                RsrcId::Id(v) => *v,
            };
            let offset_field = match node {
                RsrcNode::Dir(_) => {
                    let field = 0x8000_0000 | dir_offsets[next_child_dir];
                    next_child_dir += 1;
                    field
                }
                RsrcNode::Data { .. } => {
                    let field = data_entry_offsets[next_data];
                    next_data += 1;
                    field
                }
            };
            out[eat..eat + 4].copy_from_slice(&name_field.to_le_bytes());
            out[eat + 4..eat + 8].copy_from_slice(&offset_field.to_le_bytes());
        }
    }

    for (name, at) in &string_offsets {
        let at = *at as usize;
        out[at..at + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
        for (ci, c) in name.iter().enumerate() {
            out[at + 2 + ci * 2..at + 4 + ci * 2].copy_from_slice(&c.to_le_bytes());
        }
    }

    let mut data_idx = 0usize;
    for d in &dirs {
        for (_, node) in &d.entries {
            if let RsrcNode::Data { bytes, codepage } = node {
                let at = data_entry_offsets[data_idx] as usize;
                out[at..at + 4].copy_from_slice(&blob_rvas[data_idx].to_le_bytes());
                out[at + 4..at + 8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                out[at + 8..at + 12].copy_from_slice(&codepage.to_le_bytes());
                let blob_at = (blob_rvas[data_idx] - base_rva) as usize;
                out[blob_at..blob_at + bytes.len()].copy_from_slice(bytes);
                data_idx += 1;
            }
        }
    }

    out
}
