//! Format-generic resource listing, extraction, and verification.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::atomic::write_atomic;
use crate::binary::Binary;
use crate::error::{Error, Result};
use crate::resource::Resource;

/// One listed resource.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The logical resource.
    pub resource: Resource,
    /// How the resource is realized in this format
    /// (`SEGMENT,section`, note owner, or resource/section name).
    pub native_name: String,
    /// Content size in bytes.
    pub size: u64,
}

fn native_name(binary: &Binary, resource: Resource) -> String {
    match binary {
        Binary::Elf(_) => resource.elf_note_owner().to_string(),
        Binary::MachO(_) => format!(
            "{},{}",
            resource.macho_segment(),
            resource.macho_section()
        ),
        Binary::Pe(_) => resource
            .pe_section_name()
            .unwrap_or_else(|| resource.pe_resource_name().expect("rcdata resource"))
            .to_string(),
    }
}

/// List every known resource present in the binary.
pub fn list_sections(binary: &Binary) -> Vec<SectionInfo> {
    Resource::ALL
        .iter()
        .filter_map(|&resource| {
            binary.resource_size(resource).map(|size| SectionInfo {
                resource,
                native_name: native_name(binary, resource),
                size,
            })
        })
        .collect()
}

/// Verify that a resource exists and is readable; returns its size.
pub fn verify_section(binary: &Binary, resource: Resource) -> Result<u64> {
    let content = binary
        .resource_content(resource)
        .ok_or_else(|| Error::ResourceNotFound(resource.logical_name().to_string()))?;
    Ok(content.len() as u64)
}

/// Extract a resource to a file through the atomic write workflow.
///
/// The written size must equal the resource content size; a short write
/// hiding behind buffering is caught by syncing before the rename.
pub fn extract_section(binary: &Binary, resource: Resource, out_path: &Path) -> Result<u64> {
    let content = binary
        .resource_content(resource)
        .ok_or_else(|| Error::ResourceNotFound(resource.logical_name().to_string()))?;
    let expected = content.len() as u64;

    write_atomic(out_path, |tmp| {
        let mut file = File::create(tmp)?;
        file.write_all(&content)?;
        // Disk-full after a buffered write surfaces here, not at drop.
        file.sync_all()
            .map_err(|e| Error::write_failed(format!("{}: {e}", tmp.display())))?;
        let written = file.metadata()?.len();
        if written != expected {
            return Err(Error::write_failed(format!(
                "{}: wrote {written} bytes, expected {expected}",
                tmp.display()
            )));
        }
        Ok(())
    })?;

    tracing::debug!(
        resource = %resource,
        path = %out_path.display(),
        bytes = expected,
        "extracted"
    );
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pe_with_resources() -> Binary {
        let mut pe = crate::pe::PeFile::parse(crate::pe::tests_support::minimal_pe()).unwrap();
        pe.insert_rcdata("NODE_SEA_BLOB", &[7u8; 4096]).unwrap();
        pe.add_data_section(".pressed_data", &[8u8; 100]).unwrap();
        Binary::parse_bytes(pe.write().unwrap()).unwrap()
    }

    #[test]
    fn test_list_sections() {
        let binary = pe_with_resources();
        let infos = list_sections(&binary);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].resource, Resource::NodeSeaBlob);
        assert_eq!(infos[0].native_name, "NODE_SEA_BLOB");
        assert_eq!(infos[0].size, 4096);
        assert_eq!(infos[1].resource, Resource::PressedData);
        assert_eq!(infos[1].native_name, ".pressed_data");
        assert_eq!(infos[1].size, 100);
    }

    #[test]
    fn test_verify_section() {
        let binary = pe_with_resources();
        assert_eq!(verify_section(&binary, Resource::NodeSeaBlob).unwrap(), 4096);
        assert!(matches!(
            verify_section(&binary, Resource::SmolVfsBlob),
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_extract_section_roundtrip() {
        let binary = pe_with_resources();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("blob.bin");

        let n = extract_section(&binary, Resource::NodeSeaBlob, &out).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(std::fs::read(&out).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn test_extract_missing_resource() {
        let binary = pe_with_resources();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("blob.bin");
        assert!(matches!(
            extract_section(&binary, Resource::SmolVfsBlob, &out),
            Err(Error::ResourceNotFound(_))
        ));
        assert!(!out.exists());
    }
}
