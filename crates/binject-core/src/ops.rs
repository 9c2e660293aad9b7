//! Top-level operations composing the format engines, the container
//! codec, the cache, and the atomic write workflow.
//!
//! Every mutating operation reads the whole input into memory, transforms
//! it, and persists the result through [`write_atomic`]; the rename is
//! the only externally visible state change. Re-injecting identical
//! content is idempotent: the input is copied through unchanged, byte for
//! byte.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::atomic::write_atomic;
use crate::binary::Binary;
use crate::cache;
use crate::codec;
use crate::container;
use crate::elf::{self, ElfFile, NoteEntry};
use crate::error::{Error, Result};
use crate::format::FileFormat;
use crate::fuse;
use crate::macho::{self, MachoContainer};
use crate::marker::{self, MarkerPosition, INFLATE_MARKER_LEN, INFLATE_MARKER_PARTS, PRESSED_MARKER_PARTS};
use crate::pe::PeFile;
use crate::platform;
use crate::resource::Resource;
use crate::sections::{self, SectionInfo};

/// List the known resources present in a binary.
pub fn list(input: &Path) -> Result<Vec<SectionInfo>> {
    let binary = Binary::parse_file(input)?;
    Ok(sections::list_sections(&binary))
}

/// Verify a resource exists and is readable; returns its size.
pub fn verify(input: &Path, resource: Resource) -> Result<u64> {
    let binary = Binary::parse_file(input)?;
    sections::verify_section(&binary, resource)
}

/// Extract a resource to `out_path`; returns the number of bytes written.
pub fn extract(input: &Path, resource: Resource, out_path: &Path) -> Result<u64> {
    let binary = Binary::parse_file(input)?;
    sections::extract_section(&binary, resource, out_path)
}

fn write_bytes(output: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(output, |tmp| {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
            .map_err(|e| Error::write_failed(format!("{}: {e}", tmp.display())))?;
        Ok(())
    })
}

/// Insert (or replace) a named resource in a host binary.
///
/// The fuse policy runs for blob resources: the sentinel is armed on
/// first installation and left alone on re-injection. Injecting content
/// identical to what is already present copies the input through
/// unchanged.
pub fn inject(input: &Path, resource: Resource, payload: &[u8], output: &Path) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::invalid_args("refusing to inject an empty payload"));
    }
    let data = fs::read(input)?;

    let out = match FileFormat::detect(&data) {
        FileFormat::Elf => inject_elf(data, resource, payload)?,
        FileFormat::MachO => inject_macho(data, resource, payload)?,
        FileFormat::Pe => inject_pe(data, resource, payload)?,
        FileFormat::Unknown => {
            tracing::error!(path = %input.display(), "unrecognized binary format");
            return Err(Error::invalid_format(format!(
                "{}: not ELF, Mach-O, or PE",
                input.display()
            )));
        }
    };

    let signed = matches!(out, Injected::Fresh(_));
    let bytes = match &out {
        Injected::Fresh(b) | Injected::Unchanged(b) => b,
    };
    write_bytes(output, bytes)?;
    if signed && FileFormat::detect(bytes) == FileFormat::MachO {
        macho::codesign(output)?;
    }
    tracing::debug!(
        resource = %resource,
        input = %input.display(),
        output = %output.display(),
        "inject complete"
    );
    Ok(())
}

enum Injected {
    /// A mutated binary that needs re-signing on Mach-O.
    Fresh(Vec<u8>),
    /// The input carried identical content already; passed through
    /// untouched (signature intact).
    Unchanged(Vec<u8>),
}

fn inject_elf(data: Vec<u8>, resource: Resource, payload: &[u8]) -> Result<Injected> {
    let owner = resource.elf_note_owner();
    let probe = ElfFile::parse(data.clone())?;
    let existing = probe.note_content(owner);
    if existing.as_deref() == Some(payload) {
        return Ok(Injected::Unchanged(data));
    }
    let flip = fuse::should_flip_fuse(resource, payload, existing.is_some());

    let use_reuse_writer = resource == Resource::PressedData || !probe.has_interp();
    let out = if use_reuse_writer {
        let notes = [NoteEntry::new(owner, payload.to_vec())];
        let mut modify = |buf: &mut Vec<u8>| {
            if flip {
                // A host without the sentinel is not an error.
                fuse::flip_raw(buf);
            }
            true
        };
        elf::reuse_multi_ptnote(
            data,
            &notes,
            Some(&mut modify),
            resource == Resource::PressedData,
        )?
    } else {
        let mut elf = probe;
        if flip {
            elf.flip_fuse();
        }
        elf.replace_or_add_note(owner, payload);
        elf::write_with_notes(elf, &[owner])?
    };
    Ok(Injected::Fresh(out))
}

fn inject_macho(data: Vec<u8>, resource: Resource, payload: &[u8]) -> Result<Injected> {
    let mut container = MachoContainer::parse(&data)?;
    let seg = resource.macho_segment();
    let sect = resource.macho_section();

    let existing = container
        .binary()
        .find_section(seg, sect)
        .and_then(|s| container.binary().section_content(s));
    if existing == Some(payload) {
        return Ok(Injected::Unchanged(data));
    }
    let already = existing.is_some();

    if fuse::should_flip_fuse(resource, payload, already) {
        container.binary_mut().flip_fuse();
    }
    container
        .binary_mut()
        .add_resource_section(seg, sect, payload)?;
    Ok(Injected::Fresh(container.write()))
}

fn inject_pe(data: Vec<u8>, resource: Resource, payload: &[u8]) -> Result<Injected> {
    let mut pe = PeFile::parse(data.clone())?;

    let existing = match resource.pe_section_name() {
        Some(section) => pe.section_data(section).map(<[u8]>::to_vec),
        None => pe.find_rcdata(resource.pe_resource_name().expect("rcdata resource")),
    };
    if existing.as_deref() == Some(payload) {
        return Ok(Injected::Unchanged(data));
    }

    if fuse::should_flip_fuse(resource, payload, existing.is_some()) {
        pe.flip_fuse();
    }
    match resource.pe_section_name() {
        Some(section) => {
            if pe.has_section(section) {
                pe.remove_section(section)?;
            }
            pe.add_data_section(section, payload)?;
        }
        None => {
            pe.insert_rcdata(resource.pe_resource_name().expect("rcdata resource"), payload)?;
        }
    }
    Ok(Injected::Fresh(pe.write()?))
}

/// Remove a named resource from a host binary.
pub fn remove(input: &Path, resource: Resource, output: &Path) -> Result<()> {
    let data = fs::read(input)?;
    let format = FileFormat::detect(&data);

    let out = match format {
        FileFormat::Elf => {
            let mut elf = ElfFile::parse(data)?;
            if !elf.remove_all_notes(resource.elf_note_owner()) {
                return Err(Error::ResourceNotFound(resource.logical_name().into()));
            }
            elf.write(&elf::WriteConfig::minimal_notes())?
        }
        FileFormat::MachO => {
            let mut container = MachoContainer::parse(&data)?;
            let seg = resource.macho_segment();
            let sect = resource.macho_section();
            if container.binary().find_section(seg, sect).is_none() {
                return Err(Error::ResourceNotFound(resource.logical_name().into()));
            }
            container.binary_mut().remove_resource_section(seg, sect)?;
            container.write()
        }
        FileFormat::Pe => {
            let mut pe = PeFile::parse(data)?;
            match resource.pe_section_name() {
                Some(section) => pe.remove_section(section).map_err(|e| match e {
                    Error::SectionNotFound(_) => {
                        Error::ResourceNotFound(resource.logical_name().into())
                    }
                    other => other,
                })?,
                None => {
                    let name = resource.pe_resource_name().expect("rcdata resource");
                    if !pe.remove_rcdata(name)? {
                        return Err(Error::ResourceNotFound(resource.logical_name().into()));
                    }
                }
            }
            pe.write()?
        }
        FileFormat::Unknown => {
            return Err(Error::invalid_format(format!(
                "{}: not ELF, Mach-O, or PE",
                input.display()
            )));
        }
    };

    write_bytes(output, &out)?;
    if format == FileFormat::MachO {
        macho::codesign(output)?;
    }
    tracing::debug!(
        resource = %resource,
        output = %output.display(),
        "remove complete"
    );
    Ok(())
}

/// Result of a compression run.
#[derive(Debug, Clone)]
pub struct CompressInfo {
    /// Size of the original binary.
    pub original_size: u64,
    /// Size of the LZFSE payload.
    pub compressed_size: u64,
    /// `original_size / compressed_size`.
    pub ratio: f64,
    /// Cache key derived from the compressed bytes.
    pub cache_key: String,
    /// Size of the self-extracting output.
    pub output_size: u64,
}

/// Compress `input` into a self-extracting binary: `stub` plus the
/// container, embedded as the `pressed_data` realization of the stub's
/// format. The payload is prefixed with the stub marker so the runtime
/// can locate it without scanning for the container magic first.
pub fn compress(input: &Path, stub: &Path, output: &Path) -> Result<CompressInfo> {
    let payload = fs::read(input)?;
    if payload.is_empty() {
        return Err(Error::invalid_args(format!(
            "{}: refusing to compress an empty binary",
            input.display()
        )));
    }
    let compressed = codec::encode_buffer(&payload)?;
    let info = platform::detect();
    let container_bytes = container::encode(&compressed, payload.len() as u64, &info)?;
    let cache_key = cache::compute_cache_key(&compressed);

    let mut embedded =
        Vec::with_capacity(INFLATE_MARKER_LEN + container_bytes.len());
    embedded.extend_from_slice(&marker::assemble(INFLATE_MARKER_PARTS));
    embedded.extend_from_slice(&container_bytes);

    let stub_bytes = fs::read(stub)?;
    let format = FileFormat::detect(&stub_bytes);
    let out = match format {
        FileFormat::Elf => elf::reuse_multi_ptnote(
            stub_bytes,
            &[NoteEntry::new(
                Resource::PressedData.elf_note_owner(),
                embedded,
            )],
            None,
            true,
        )?,
        FileFormat::MachO => {
            let mut container = MachoContainer::parse(&stub_bytes)?;
            container.binary_mut().add_resource_section(
                Resource::PressedData.macho_segment(),
                Resource::PressedData.macho_section(),
                &embedded,
            )?;
            container.write()
        }
        FileFormat::Pe => {
            let mut pe = PeFile::parse(stub_bytes)?;
            let section = Resource::PressedData
                .pe_section_name()
                .expect("pressed_data is a PE section");
            if pe.has_section(section) {
                pe.remove_section(section)?;
            }
            pe.add_data_section(section, &embedded)?;
            pe.write()?
        }
        FileFormat::Unknown => {
            return Err(Error::invalid_format(format!(
                "{}: stub is not ELF, Mach-O, or PE",
                stub.display()
            )));
        }
    };

    let output_size = out.len() as u64;
    write_bytes(output, &out)?;
    if format == FileFormat::MachO {
        macho::codesign(output)?;
    }

    let compress_info = CompressInfo {
        original_size: payload.len() as u64,
        compressed_size: compressed.len() as u64,
        ratio: payload.len() as f64 / compressed.len() as f64,
        cache_key,
        output_size,
    };
    tracing::debug!(
        original = compress_info.original_size,
        compressed = compress_info.compressed_size,
        output = %output.display(),
        "compress complete"
    );
    Ok(compress_info)
}

/// Locate the container inside a pressed binary: the stub-marker forms
/// first (structured PT_NOTE scan on Linux, then the stream scan), then
/// the container magic itself as a fallback.
pub fn locate_container(exe: &Path) -> Result<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(at) = marker::find_in_elf_note(exe, INFLATE_MARKER_PARTS) {
            return Ok(at + INFLATE_MARKER_LEN as u64);
        }
    }
    if let Ok(at) = marker::find_in_path(exe, INFLATE_MARKER_PARTS, MarkerPosition::After) {
        return Ok(at);
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(at) = marker::find_in_elf_note(exe, PRESSED_MARKER_PARTS) {
            return Ok(at);
        }
    }
    marker::find_in_path(exe, PRESSED_MARKER_PARTS, MarkerPosition::Start)
}

/// Read and decode the container embedded in `exe` starting at `offset`.
pub fn read_container(exe: &Path, offset: u64) -> Result<(container::ContainerHeader, Vec<u8>)> {
    let mut file = File::open(exe)?;
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset))?;

    let mut header_buf = vec![0u8; container::HEADER_LEN];
    file.read_exact(&mut header_buf)?;

    let declared = u64::from_le_bytes(header_buf[40..48].try_into().unwrap());
    let available = file_len.saturating_sub(offset + container::HEADER_LEN as u64);
    if declared > available {
        return Err(Error::invalid_format(format!(
            "container declares {declared} compressed bytes but only {available} remain"
        )));
    }
    let body_len =
        usize::try_from(declared).map_err(|_| Error::AllocationFailed(declared))?;
    let mut full = header_buf;
    full.reserve_exact(body_len);
    let mut body = vec![0u8; body_len];
    file.read_exact(&mut body)?;
    full.extend_from_slice(&body);

    let (header, compressed) = container::decode(&full)?;
    Ok((header, compressed.to_vec()))
}

/// The binflate runtime path: locate the container in the current
/// executable, consult the cache, decompress on a miss, and exec the
/// cached binary.
///
/// On Unix a successful exec never returns; the `i32` is the child's
/// exit code on Windows.
pub fn decompress_and_exec() -> Result<i32> {
    let exe = std::env::current_exe()?;
    let offset = locate_container(&exe)?;
    let (header, compressed) = read_container(&exe, offset)?;

    let here = platform::detect();
    if header.platform != here.platform || header.arch != here.arch {
        return Err(Error::invalid_format(format!(
            "payload built for {}/{}, running on {}/{}",
            header.platform.as_str(),
            header.arch.as_str(),
            here.platform.as_str(),
            here.arch.as_str()
        )));
    }

    if let Some(cached) = cache::get_cached_binary_path(&header.cache_key, header.uncompressed_size)
    {
        tracing::debug!(path = %cached.display(), "cache hit");
        return exec_binary(&cached);
    }

    if cache::compute_cache_key(&compressed) != header.cache_key {
        return Err(Error::CacheCorrupt(
            "container cache key does not match its compressed bytes".into(),
        ));
    }

    let decoded = codec::decode_buffer_sized(&compressed, header.uncompressed_size)?;
    let checksum = cache::compute_full_checksum(&decoded);
    let cached = cache::write_to_cache(
        &header.cache_key,
        &decoded,
        header.compressed_size,
        &exe,
        &checksum,
        "lzfse",
    )?;
    exec_binary(&cached)
}

/// Replace the current process image (Unix) or run the child and collect
/// its exit code (Windows). Arguments after the program name and the
/// whole environment pass through.
#[cfg(unix)]
fn exec_binary(path: &Path) -> Result<i32> {
    use std::os::unix::process::CommandExt;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
    let err = std::process::Command::new(path).args(args).exec();
    Err(Error::Io(err))
}

#[cfg(not(unix))]
fn exec_binary(path: &Path) -> Result<i32> {
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
    let status = std::process::Command::new(path).args(args).status()?;
    Ok(status.code().unwrap_or(1))
}

/// Default stub path for the compressor: a `binflate` binary next to the
/// running executable. PATH is never searched.
pub fn default_stub_path() -> Result<PathBuf> {
    let me = std::env::current_exe()?;
    let dir = me
        .parent()
        .ok_or_else(|| Error::invalid_args("cannot resolve executable directory"))?;
    let name = if cfg!(windows) { "binflate.exe" } else { "binflate" };
    Ok(dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{build_note_payload, Elf64Header, ProgramHeader, PHDR_SIZE};

    /// Minimal static ELF host with one PT_LOAD and a reusable PT_NOTE.
    fn elf_host() -> Vec<u8> {
        let note_payload = build_note_payload(&[NoteEntry {
            name: "GNU".into(),
            desc: vec![0xab; 20],
            ntype: 3,
        }]);
        let mut data = vec![0u8; 0x2000];
        let header = Elf64Header {
            e_ident: {
                let mut id = [0u8; 16];
                id[0..4].copy_from_slice(&crate::format::ELF_MAGIC);
                id[4] = 2;
                id[5] = 1;
                id[6] = 1;
                id
            },
            e_type: 2,
            e_machine: 62,
            e_version: 1,
            e_entry: 0x401000,
            e_phoff: 64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 2,
            e_shentsize: 64,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        header.write_to(&mut data[..64]);
        let phdrs = [
            ProgramHeader {
                p_type: elf::PT_LOAD,
                p_flags: 5,
                p_offset: 0,
                p_vaddr: 0x400000,
                p_paddr: 0x400000,
                p_filesz: 0x1000,
                p_memsz: 0x1000,
                p_align: 0x1000,
            },
            ProgramHeader {
                p_type: elf::PT_NOTE,
                p_flags: elf::PF_R,
                p_offset: 0x1200,
                p_vaddr: 0x401200,
                p_paddr: 0x401200,
                p_filesz: note_payload.len() as u64,
                p_memsz: note_payload.len() as u64,
                p_align: 4,
            },
        ];
        for (i, ph) in phdrs.iter().enumerate() {
            let off = 64 + i * PHDR_SIZE;
            data[off..off + PHDR_SIZE].copy_from_slice(&ph.to_bytes());
        }
        data[0x1200..0x1200 + note_payload.len()].copy_from_slice(&note_payload);
        data
    }

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 128) as u8).collect()
    }

    #[test]
    fn test_inject_list_extract_verify_remove_elf() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        let out = dir.path().join("host.out");
        std::fs::write(&host, elf_host()).unwrap();

        let payload = vec![0x42u8; 5000];
        inject(&host, Resource::NodeSeaBlob, &payload, &out).unwrap();

        let infos = list(&out).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].resource, Resource::NodeSeaBlob);
        assert_eq!(infos[0].size, 5000);

        assert_eq!(verify(&out, Resource::NodeSeaBlob).unwrap(), 5000);

        let extracted = dir.path().join("blob");
        extract(&out, Resource::NodeSeaBlob, &extracted).unwrap();
        assert_eq!(std::fs::read(&extracted).unwrap(), payload);

        let removed = dir.path().join("host.removed");
        remove(&out, Resource::NodeSeaBlob, &removed).unwrap();
        assert!(matches!(
            verify(&removed, Resource::NodeSeaBlob),
            Err(Error::ResourceNotFound(_))
        ));
        // The preexisting GNU note survived removal.
        let elf = ElfFile::parse(std::fs::read(&removed).unwrap()).unwrap();
        assert!(elf.notes().iter().any(|n| n.name == "GNU"));
    }

    #[test]
    fn test_inject_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        std::fs::write(&host, elf_host()).unwrap();

        let payload = vec![0x11u8; 2000];
        let once = dir.path().join("once");
        inject(&host, Resource::SmolVfsBlob, &payload, &once).unwrap();
        let twice = dir.path().join("twice");
        inject(&once, Resource::SmolVfsBlob, &payload, &twice).unwrap();

        assert_eq!(
            std::fs::read(&once).unwrap(),
            std::fs::read(&twice).unwrap(),
            "re-injection must be byte-identical"
        );
    }

    #[test]
    fn test_inject_flips_fuse_once() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        let mut data = elf_host();
        let sentinel = fuse::unflipped_sentinel();
        data[0x500..0x500 + sentinel.len()].copy_from_slice(&sentinel);
        std::fs::write(&host, data).unwrap();

        let out = dir.path().join("armed");
        inject(&host, Resource::NodeSeaBlob, &[1u8; 100], &out).unwrap();
        let armed = std::fs::read(&out).unwrap();
        assert_eq!(armed[0x500 + sentinel.len() - 1], b'1');

        // pressed_data does not arm the fuse.
        let host2 = dir.path().join("host2");
        let mut data2 = elf_host();
        data2[0x500..0x500 + sentinel.len()].copy_from_slice(&sentinel);
        std::fs::write(&host2, data2).unwrap();
        let out2 = dir.path().join("unarmed");
        inject(&host2, Resource::PressedData, &[1u8; 100], &out2).unwrap();
        let unarmed = std::fs::read(&out2).unwrap();
        assert_eq!(unarmed[0x500 + sentinel.len() - 1], b'0');
    }

    #[test]
    fn test_inject_rejects_empty_payload() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        std::fs::write(&host, elf_host()).unwrap();
        assert!(matches!(
            inject(&host, Resource::NodeSeaBlob, &[], &dir.path().join("out")),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_remove_missing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host");
        std::fs::write(&host, elf_host()).unwrap();
        assert!(matches!(
            remove(&host, Resource::SmolVfsBlob, &dir.path().join("out")),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_compress_builds_locatable_container() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let stub = dir.path().join("stub");
        let out = dir.path().join("pressed");

        std::fs::write(&target, compressible(300_000)).unwrap();
        std::fs::write(&stub, elf_host()).unwrap();

        let info = compress(&target, &stub, &out).unwrap();
        assert_eq!(info.original_size, 300_000);
        assert!(info.ratio > 1.0);
        assert_eq!(info.cache_key.len(), 16);

        // The runtime locator finds the container through the stub marker.
        let offset = locate_container(&out).unwrap();
        let (header, compressed) = read_container(&out, offset).unwrap();
        assert_eq!(header.uncompressed_size, 300_000);
        assert_eq!(header.cache_key, info.cache_key);
        let decoded = codec::decode_buffer_sized(&compressed, 300_000).unwrap();
        assert_eq!(decoded, compressible(300_000));
    }

    #[test]
    fn test_compress_pressed_data_listable() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let stub = dir.path().join("stub");
        let out = dir.path().join("pressed");
        std::fs::write(&target, compressible(100_000)).unwrap();
        std::fs::write(&stub, elf_host()).unwrap();
        compress(&target, &stub, &out).unwrap();

        let infos = list(&out).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].resource, Resource::PressedData);
    }

    #[test]
    fn test_locate_container_on_plain_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, elf_host()).unwrap();
        assert!(matches!(
            locate_container(&plain),
            Err(Error::MarkerNotFound)
        ));
    }
}
